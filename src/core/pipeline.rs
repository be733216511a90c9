//! Pipeline domain model

use crate::core::{
    config::PipelineConfig,
    context::EnvironmentContext,
    credentials::CredentialStore,
    error::{PipelineError, Result},
    stage::Stage,
};
use std::collections::HashSet;
use std::time::Duration;

/// An assembled, immutable pipeline definition
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Stages in declared (execution) order
    pub stages: Vec<Stage>,

    /// Timeout applied to invocations that declare none
    pub default_timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            default_timeout: None,
        }
    }

    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let stages = config
            .stages
            .iter()
            .map(Stage::from_config)
            .collect::<Result<Vec<_>>>()?;

        let pipeline = Pipeline {
            name: config.name.clone(),
            stages,
            default_timeout: config.defaults.timeout_secs.map(Duration::from_secs),
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Get a stage by name
    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Structural checks: non-empty, unique stage names
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "pipeline {} has no stages",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    /// Pre-flight checks run before any stage executes
    ///
    /// Every referenced credential must be registered and every template must
    /// render against the stage's context. Secrets are not resolved here.
    pub fn preflight(&self, ctx: &EnvironmentContext, credentials: &CredentialStore) -> Result<()> {
        self.validate()?;
        for stage in &self.stages {
            let stage_ctx = stage.context(ctx)?;
            for action in &stage.actions {
                for id in action.credential_ids() {
                    if !credentials.contains(&id) {
                        return Err(PipelineError::CredentialNotFound(id));
                    }
                }
                action.kind.render(&stage_ctx)?;
                for value in action.env.values() {
                    stage_ctx.render(value)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::ActionSpec;

    #[test]
    fn test_duplicate_stage_names() {
        let pipeline = Pipeline::new("app")
            .stage(Stage::new("build"))
            .stage(Stage::new("build"));
        assert!(matches!(pipeline.validate(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_pipeline_is_invalid() {
        assert!(Pipeline::new("app").validate().is_err());
    }

    #[test]
    fn test_preflight_unknown_credential() {
        let pipeline = Pipeline::new("app").stage(
            Stage::new("push").action(ActionSpec::new(crate::core::action::ActionKind::Push {
                image: "app:1".into(),
                registry: None,
                credential: Some("registry".into()),
            })),
        );
        let result = pipeline.preflight(&EnvironmentContext::default(), &CredentialStore::new());
        assert!(matches!(result, Err(PipelineError::CredentialNotFound(id)) if id == "registry"));
    }

    #[test]
    fn test_preflight_undefined_variable() {
        let pipeline = Pipeline::new("app").stage(Stage::new("deploy").action(
            ActionSpec::command("kubectl", ["config", "use-context", "{{ CLUSTER }}"]),
        ));
        let result = pipeline.preflight(&EnvironmentContext::default(), &CredentialStore::new());
        assert!(matches!(result, Err(PipelineError::UndefinedVariable(key)) if key == "CLUSTER"));
    }

    #[test]
    fn test_preflight_uses_stage_overrides() {
        let pipeline = Pipeline::new("app").stage(
            Stage::new("deploy")
                .with_env("CLUSTER", "aks-prod")
                .action(ActionSpec::command("kubectl", ["config", "use-context", "{{ CLUSTER }}"])),
        );
        assert!(pipeline
            .preflight(&EnvironmentContext::default(), &CredentialStore::new())
            .is_ok());
    }
}
