//! Typed stage actions and their lowering to command invocations

use crate::core::condition::{ConditionPattern, PatternConfig};
use crate::core::context::EnvironmentContext;
use crate::core::credentials::{CredentialLease, SecretMaterial};
use crate::core::error::{PipelineError, Result};
use crate::runner::{Invocation, Masker};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

fn default_reference() -> String {
    "main".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_gate_wait() -> u64 {
    300
}

/// Injects a credential into environment variables for one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBinding {
    /// Credential id registered in the store
    pub id: String,

    /// Receives the token, or the password of a username/password pair
    #[serde(default)]
    pub env: Option<String>,

    /// Receives the username of a username/password pair
    #[serde(default)]
    pub username_env: Option<String>,
}

/// Resource kinds that can be listed from the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Pods,
    Services,
}

impl QueryKind {
    fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Pods => "pods",
            QueryKind::Services => "services",
        }
    }
}

/// What an action does; tagged by `action:` in pipeline files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    /// Any external program
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        directory: Option<String>,
    },
    /// Source checkout; outputs the working directory
    Checkout {
        repository: String,
        #[serde(default = "default_reference")]
        reference: String,
        directory: String,
        #[serde(default)]
        credential: Option<String>,
    },
    /// Build tool run; outputs the declared artifacts
    Build {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        directory: Option<String>,
        #[serde(default)]
        artifacts: Vec<String>,
    },
    /// Vulnerability scan; outputs the report file
    Scan {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        report: String,
    },
    /// Artifact upload to a repository URL
    Upload {
        file: String,
        destination: String,
        #[serde(default)]
        credential: Option<String>,
    },
    /// Container image push, with an optional registry login first
    Push {
        image: String,
        #[serde(default)]
        registry: Option<String>,
        #[serde(default)]
        credential: Option<String>,
    },
    /// Apply a manifest to the cluster
    Apply {
        manifest: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    /// Wait for a rollout to finish
    RolloutStatus {
        resource: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        wait_secs: Option<u64>,
    },
    /// List pods or services
    Query {
        kind: QueryKind,
        #[serde(default)]
        namespace: Option<String>,
    },
    /// Poll a probe command until its output yields a verdict
    QualityGate {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        pass: PatternConfig,
        #[serde(default)]
        fail: Option<PatternConfig>,
        #[serde(default = "default_poll_interval")]
        interval_secs: u64,
        #[serde(default = "default_gate_wait")]
        wait_secs: u64,
    },
}

/// One action of a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(flatten)]
    pub kind: ActionKind,

    #[serde(default)]
    pub credentials: Vec<CredentialBinding>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Per-invocation timeout (overrides the pipeline default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Polling parameters for quality gates
#[derive(Debug, Clone)]
pub struct PollSpec {
    pub pass: ConditionPattern,
    pub fail: Option<ConditionPattern>,
    pub interval: Duration,
    pub wait: Duration,
}

/// Lowered form of an action, ready for the command runner
#[derive(Debug, Clone, Default)]
pub struct ActionPlan {
    pub invocations: Vec<Invocation>,
    pub poll: Option<PollSpec>,
    pub outputs: Vec<PathBuf>,
}

fn lease_for<'a>(leases: &'a [CredentialLease], id: &str) -> Result<&'a CredentialLease> {
    leases
        .iter()
        .find(|lease| lease.id() == id)
        .ok_or_else(|| PipelineError::CredentialNotFound(id.to_string()))
}

/// Escape a value for a curl config file string
fn curl_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn with_namespace(invocation: Invocation, namespace: &Option<String>) -> Invocation {
    match namespace {
        Some(ns) => invocation.args(["--namespace", ns.as_str()]),
        None => invocation,
    }
}

impl ActionKind {
    /// Short name used in logs and events
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Command { .. } => "command",
            ActionKind::Checkout { .. } => "checkout",
            ActionKind::Build { .. } => "build",
            ActionKind::Scan { .. } => "scan",
            ActionKind::Upload { .. } => "upload",
            ActionKind::Push { .. } => "push",
            ActionKind::Apply { .. } => "apply",
            ActionKind::RolloutStatus { .. } => "rollout_status",
            ActionKind::Query { .. } => "query",
            ActionKind::QualityGate { .. } => "quality_gate",
        }
    }

    fn credential(&self) -> Option<&String> {
        match self {
            ActionKind::Checkout { credential, .. }
            | ActionKind::Upload { credential, .. }
            | ActionKind::Push { credential, .. } => credential.as_ref(),
            _ => None,
        }
    }

    /// Copy with every `{{ NAME }}` placeholder rendered
    pub fn render(&self, ctx: &EnvironmentContext) -> Result<ActionKind> {
        let r = |s: &String| ctx.render(s);
        let ro = |s: &Option<String>| s.as_ref().map(|s| ctx.render(s)).transpose();
        let rv = |v: &Vec<String>| v.iter().map(|s| ctx.render(s)).collect::<Result<Vec<_>>>();

        Ok(match self {
            ActionKind::Command {
                program,
                args,
                directory,
            } => ActionKind::Command {
                program: r(program)?,
                args: rv(args)?,
                directory: ro(directory)?,
            },
            ActionKind::Checkout {
                repository,
                reference,
                directory,
                credential,
            } => ActionKind::Checkout {
                repository: r(repository)?,
                reference: r(reference)?,
                directory: r(directory)?,
                credential: credential.clone(),
            },
            ActionKind::Build {
                program,
                args,
                directory,
                artifacts,
            } => ActionKind::Build {
                program: r(program)?,
                args: rv(args)?,
                directory: ro(directory)?,
                artifacts: rv(artifacts)?,
            },
            ActionKind::Scan {
                program,
                args,
                report,
            } => ActionKind::Scan {
                program: r(program)?,
                args: rv(args)?,
                report: r(report)?,
            },
            ActionKind::Upload {
                file,
                destination,
                credential,
            } => ActionKind::Upload {
                file: r(file)?,
                destination: r(destination)?,
                credential: credential.clone(),
            },
            ActionKind::Push {
                image,
                registry,
                credential,
            } => ActionKind::Push {
                image: r(image)?,
                registry: ro(registry)?,
                credential: credential.clone(),
            },
            ActionKind::Apply {
                manifest,
                namespace,
            } => ActionKind::Apply {
                manifest: r(manifest)?,
                namespace: ro(namespace)?,
            },
            ActionKind::RolloutStatus {
                resource,
                namespace,
                wait_secs,
            } => ActionKind::RolloutStatus {
                resource: r(resource)?,
                namespace: ro(namespace)?,
                wait_secs: *wait_secs,
            },
            ActionKind::Query { kind, namespace } => ActionKind::Query {
                kind: *kind,
                namespace: ro(namespace)?,
            },
            ActionKind::QualityGate {
                program,
                args,
                pass,
                fail,
                interval_secs,
                wait_secs,
            } => ActionKind::QualityGate {
                program: r(program)?,
                args: rv(args)?,
                pass: pass.clone(),
                fail: fail.clone(),
                interval_secs: *interval_secs,
                wait_secs: *wait_secs,
            },
        })
    }
}

impl ActionSpec {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            credentials: Vec::new(),
            env: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    /// Shorthand for a plain command action
    pub fn command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ActionKind::Command {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            directory: None,
        })
    }

    pub fn with_credential(mut self, binding: CredentialBinding) -> Self {
        self.credentials.push(binding);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Every credential id this action needs in scope
    pub fn credential_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.credentials.iter().map(|b| b.id.clone()).collect();
        if let Some(id) = self.kind.credential() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Static checks done when the pipeline is assembled
    pub fn validate(&self) -> Result<()> {
        for binding in &self.credentials {
            if binding.env.is_none() && binding.username_env.is_none() {
                return Err(PipelineError::InvalidConfig(format!(
                    "credential binding {} in {} action names no environment variable",
                    binding.id,
                    self.kind.name()
                )));
            }
        }
        if let ActionKind::QualityGate {
            pass,
            fail,
            interval_secs,
            ..
        } = &self.kind
        {
            ConditionPattern::compile(pass)?;
            if let Some(fail) = fail {
                ConditionPattern::compile(fail)?;
            }
            if *interval_secs == 0 {
                return Err(PipelineError::InvalidConfig(
                    "quality gate interval_secs must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Lower to invocations using the credentials of the current scope
    pub fn plan(
        &self,
        ctx: &EnvironmentContext,
        leases: &[CredentialLease],
        default_timeout: Option<Duration>,
    ) -> Result<ActionPlan> {
        let kind = self.kind.render(ctx)?;
        let timeout = self
            .timeout_secs
            .map(Duration::from_secs)
            .or(default_timeout);

        let mut masker = Masker::default();
        let mut env = BTreeMap::new();
        for (key, value) in &self.env {
            env.insert(key.clone(), ctx.render(value)?);
        }
        for lease in leases {
            masker.extend(lease.expose()?.secret_values());
        }
        for binding in &self.credentials {
            let material = lease_for(leases, &binding.id)?.expose()?;
            if let Some(var) = &binding.env {
                env.insert(var.clone(), material.secret().to_string());
            }
            if let (Some(var), Some(username)) = (&binding.username_env, material.username()) {
                env.insert(var.clone(), username.to_string());
            }
        }

        let mut plan = ActionPlan::default();
        match &kind {
            ActionKind::Command {
                program,
                args,
                directory,
            } => {
                let mut invocation = Invocation::new(program).args(args.iter());
                if let Some(dir) = directory {
                    invocation = invocation.working_dir(dir);
                }
                plan.invocations.push(invocation);
            }
            ActionKind::Checkout {
                repository,
                reference,
                directory,
                credential,
            } => {
                let mut invocation = Invocation::new("git").args([
                    "clone",
                    "--depth",
                    "1",
                    "--branch",
                    reference.as_str(),
                    repository.as_str(),
                    directory.as_str(),
                ]);
                if let Some(id) = credential {
                    let header = match lease_for(leases, id)?.expose()? {
                        SecretMaterial::Token(token) => format!("Authorization: Bearer {}", token),
                        SecretMaterial::UsernamePassword { username, password } => format!(
                            "Authorization: Basic {}",
                            BASE64.encode(format!("{}:{}", username, password))
                        ),
                    };
                    masker.extend([header.clone()]);
                    invocation = invocation
                        .env("GIT_CONFIG_COUNT", "1")
                        .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                        .env("GIT_CONFIG_VALUE_0", header);
                }
                plan.invocations.push(invocation);
                plan.outputs.push(PathBuf::from(directory));
            }
            ActionKind::Build {
                program,
                args,
                directory,
                artifacts,
            } => {
                let mut invocation = Invocation::new(program).args(args.iter());
                if let Some(dir) = directory {
                    invocation = invocation.working_dir(dir);
                }
                plan.invocations.push(invocation);
                plan.outputs.extend(artifacts.iter().map(PathBuf::from));
            }
            ActionKind::Scan {
                program,
                args,
                report,
            } => {
                plan.invocations.push(Invocation::new(program).args(args.iter()));
                plan.outputs.push(PathBuf::from(report));
            }
            ActionKind::Upload {
                file,
                destination,
                credential,
            } => {
                let mut invocation = Invocation::new("curl").args([
                    "--fail",
                    "--silent",
                    "--show-error",
                    "--upload-file",
                    file.as_str(),
                ]);
                if let Some(id) = credential {
                    let config = match lease_for(leases, id)?.expose()? {
                        SecretMaterial::Token(token) => {
                            let header = format!("Authorization: Bearer {}", token);
                            format!("header = {}\n", curl_quote(&header))
                        }
                        SecretMaterial::UsernamePassword { username, password } => {
                            let user = format!("{}:{}", username, password);
                            format!("user = {}\n", curl_quote(&user))
                        }
                    };
                    invocation = invocation.args(["--config", "-"]).stdin(config);
                }
                plan.invocations.push(invocation.arg(destination.as_str()));
            }
            ActionKind::Push {
                image,
                registry,
                credential,
            } => {
                if let Some(id) = credential {
                    let (username, password) = match lease_for(leases, id)?.expose()? {
                        SecretMaterial::UsernamePassword { username, password } => {
                            (username, password)
                        }
                        SecretMaterial::Token(_) => {
                            return Err(PipelineError::InvalidConfig(format!(
                                "registry login needs a username/password credential, {} is a token",
                                id
                            )))
                        }
                    };
                    let mut login = Invocation::new("docker")
                        .args(["login", "--username", username.as_str(), "--password-stdin"])
                        .stdin(password);
                    if let Some(registry) = registry {
                        login = login.arg(registry.as_str());
                    }
                    plan.invocations.push(login);
                }
                plan.invocations
                    .push(Invocation::new("docker").args(["push", image.as_str()]));
            }
            ActionKind::Apply {
                manifest,
                namespace,
            } => {
                let invocation =
                    Invocation::new("kubectl").args(["apply", "-f", manifest.as_str()]);
                plan.invocations.push(with_namespace(invocation, namespace));
            }
            ActionKind::RolloutStatus {
                resource,
                namespace,
                wait_secs,
            } => {
                let mut invocation = with_namespace(
                    Invocation::new("kubectl").args(["rollout", "status", resource.as_str()]),
                    namespace,
                );
                if let Some(secs) = wait_secs {
                    invocation = invocation.arg(format!("--timeout={}s", secs));
                }
                plan.invocations.push(invocation);
            }
            ActionKind::Query { kind, namespace } => {
                let invocation = with_namespace(
                    Invocation::new("kubectl").args(["get", kind.as_str()]),
                    namespace,
                );
                plan.invocations.push(invocation.args(["-o", "wide"]));
            }
            ActionKind::QualityGate {
                program,
                args,
                pass,
                fail,
                interval_secs,
                wait_secs,
            } => {
                plan.invocations.push(Invocation::new(program).args(args.iter()));
                plan.poll = Some(PollSpec {
                    pass: ConditionPattern::compile(pass)?,
                    fail: fail.as_ref().map(ConditionPattern::compile).transpose()?,
                    interval: Duration::from_secs(*interval_secs),
                    wait: Duration::from_secs(*wait_secs),
                });
            }
        }

        for invocation in &mut plan.invocations {
            for (key, value) in &env {
                invocation.env.entry(key.clone()).or_insert_with(|| value.clone());
            }
            invocation.timeout = timeout;
            invocation.masker = masker.clone();
        }
        Ok(plan)
    }
}
