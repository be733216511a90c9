//! Pipeline configuration from YAML

use crate::core::{
    action::ActionSpec,
    context::EnvironmentContext,
    credentials::{CredentialSource, CredentialStore},
    error::{PipelineError, Result},
    guard::GuardConfig,
    stage::FailurePolicy,
    Pipeline,
};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Variable definition - a literal or a reference to the launching environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableDefinition {
    /// Simple string value
    Literal(String),
    /// Read from the process environment, with an optional fallback
    FromEnv { name: String, default: Option<String> },
}

impl VariableDefinition {
    fn from_value(key: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(VariableDefinition::Literal(s.clone())),
            Value::Number(n) => Ok(VariableDefinition::Literal(n.to_string())),
            Value::Bool(b) => Ok(VariableDefinition::Literal(b.to_string())),
            Value::Mapping(map) => {
                let name = map
                    .get("from_env")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        PipelineError::InvalidConfig(format!(
                            "variable {} must be a scalar or {{ from_env: NAME }}",
                            key
                        ))
                    })?;
                let default = match map.get("default") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    Some(Value::Bool(b)) => Some(b.to_string()),
                    Some(_) => {
                        return Err(PipelineError::InvalidConfig(format!(
                            "default of variable {} must be a scalar",
                            key
                        )))
                    }
                };
                Ok(VariableDefinition::FromEnv {
                    name: name.to_string(),
                    default,
                })
            }
            _ => Err(PipelineError::InvalidConfig(format!(
                "variable {} has an unsupported value",
                key
            ))),
        }
    }

    fn resolve(&self, key: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
        match self {
            VariableDefinition::Literal(value) => Ok(value.clone()),
            VariableDefinition::FromEnv { name, default } => lookup(name)
                .or_else(|| default.clone())
                .ok_or_else(|| PipelineError::UndefinedVariable(key.to_string())),
        }
    }
}

/// Credential source as written in a pipeline file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialConfig {
    UsernamePassword {
        username_env: String,
        password_env: String,
    },
    TokenEnv {
        token_env: String,
    },
    TokenFile {
        token_file: PathBuf,
    },
}

impl CredentialConfig {
    fn to_source(&self) -> CredentialSource {
        match self {
            CredentialConfig::UsernamePassword {
                username_env,
                password_env,
            } => CredentialSource::UsernamePasswordEnv {
                username_env: username_env.clone(),
                password_env: password_env.clone(),
            },
            CredentialConfig::TokenEnv { token_env } => {
                CredentialSource::TokenEnv(token_env.clone())
            }
            CredentialConfig::TokenFile { token_file } => {
                CredentialSource::TokenFile(token_file.clone())
            }
        }
    }
}

/// Pipeline-wide defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Timeout for every invocation that declares none
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Stage configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage name
    pub name: String,

    /// Guard; the stage always runs when absent
    #[serde(default)]
    pub when: Option<GuardConfig>,

    #[serde(default)]
    pub on_failure: FailurePolicy,

    /// Stage-scoped variable overrides
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    pub actions: Vec<ActionSpec>,
}

fn default_sendmail_program() -> String {
    "sendmail".to_string()
}

/// Email delivery through a local sendmail-compatible binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendmailConfig {
    #[serde(default = "default_sendmail_program")]
    pub program: String,

    #[serde(default)]
    pub from: Option<String>,
}

/// Notification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Webhook URL receiving a JSON status payload
    #[serde(default)]
    pub webhook: Option<String>,

    #[serde(default)]
    pub sendmail: Option<SendmailConfig>,

    /// Link to full logs; `{{ RUN_ID }}` and `{{ BUILD_NUMBER }}` are available
    #[serde(default)]
    pub log_url: Option<String>,

    /// Files attached to the report when they exist
    #[serde(default)]
    pub attach: Vec<PathBuf>,
}

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Variables of the environment context
    #[serde(default)]
    environment: BTreeMap<String, Value>,

    /// Credential sources by id
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialConfig>,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Pipeline stages
    pub stages: Vec<StageConfig>,

    #[serde(default)]
    pub notify: NotifyConfig,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig("no stages defined".to_string()));
        }

        // Check that all stage names are unique
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(&stage.name) {
                return Err(PipelineError::InvalidConfig(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
            if stage.actions.is_empty() {
                return Err(PipelineError::InvalidConfig(format!(
                    "stage {} has no actions",
                    stage.name
                )));
            }
            for action in &stage.actions {
                action.validate()?;
                for id in action.credential_ids() {
                    if !self.credentials.contains_key(&id) {
                        return Err(PipelineError::InvalidConfig(format!(
                            "stage {} references unknown credential {}",
                            stage.name, id
                        )));
                    }
                }
            }
        }

        for (key, value) in &self.environment {
            VariableDefinition::from_value(key, value)?;
        }

        Ok(())
    }

    /// Variable definitions keyed by name
    pub fn variables(&self) -> Result<BTreeMap<String, VariableDefinition>> {
        self.environment
            .iter()
            .map(|(key, value)| Ok((key.clone(), VariableDefinition::from_value(key, value)?)))
            .collect()
    }

    /// Build the run context from the process environment plus overrides
    pub fn resolve_environment(
        &self,
        overrides: &[(String, String)],
    ) -> Result<EnvironmentContext> {
        self.resolve_environment_with(&|name| std::env::var(name).ok(), overrides)
    }

    /// Build the run context with an explicit environment lookup
    ///
    /// Overrides win over file values and may introduce new keys. A
    /// `from_env` variable without default that is neither set nor overridden
    /// is `UndefinedVariable`.
    pub fn resolve_environment_with(
        &self,
        lookup: &dyn Fn(&str) -> Option<String>,
        overrides: &[(String, String)],
    ) -> Result<EnvironmentContext> {
        let overridden: HashSet<&str> = overrides.iter().map(|(k, _)| k.as_str()).collect();
        let mut builder = EnvironmentContext::builder();
        for (key, definition) in self.variables()? {
            if overridden.contains(key.as_str()) {
                continue;
            }
            let value = definition.resolve(&key, lookup)?;
            builder = builder.set(key, value);
        }
        let base = builder.build()?;
        Ok(base.with_overrides(overrides.iter().cloned()))
    }

    /// Credential store with every configured source registered
    pub fn credential_store(&self) -> CredentialStore {
        let mut store = CredentialStore::new();
        for (id, config) in &self.credentials {
            store.register(id.clone(), config.to_source());
        }
        store
    }

    /// Convert to an executable pipeline
    pub fn to_pipeline(&self) -> Result<Pipeline> {
        Pipeline::from_config(self)
    }
}
