//! Stage domain model

use crate::core::{
    action::ActionSpec,
    config::StageConfig,
    context::EnvironmentContext,
    error::Result,
    guard::Guard,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What happens to the run when a stage fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Blocking step: the stage is FAILED and the remaining stages are skipped
    #[default]
    Abort,
    /// Best-effort step: the stage is UNSTABLE and the run goes on
    #[serde(alias = "continue")]
    ContinueDegraded,
}

/// A single stage in a pipeline
#[derive(Debug, Clone)]
pub struct Stage {
    /// Unique stage name
    pub name: String,

    /// Run-if predicate (defaults to always)
    pub guard: Guard,

    /// Actions executed in order, fail-fast
    pub actions: Vec<ActionSpec>,

    pub on_failure: FailurePolicy,

    /// Variables overridden for this stage only; values may use `{{ NAME }}`
    pub environment: BTreeMap<String, String>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guard: Guard::Always,
            actions: Vec::new(),
            on_failure: FailurePolicy::Abort,
            environment: BTreeMap::new(),
        }
    }

    /// Create a stage from a stage config
    pub fn from_config(config: &StageConfig) -> Result<Self> {
        let guard = match &config.when {
            Some(when) => Guard::from_config(when)?,
            None => Guard::Always,
        };
        for action in &config.actions {
            action.validate()?;
        }

        Ok(Stage {
            name: config.name.clone(),
            guard,
            actions: config.actions.clone(),
            on_failure: config.on_failure,
            environment: config.environment.clone(),
        })
    }

    pub fn when(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub fn action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Context seen by this stage: the run context plus the stage overrides
    pub fn context(&self, base: &EnvironmentContext) -> Result<EnvironmentContext> {
        if self.environment.is_empty() {
            return Ok(base.clone());
        }
        let overrides = self
            .environment
            .iter()
            .map(|(key, value)| Ok((key.clone(), base.render(value)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(base.with_overrides(overrides))
    }

    /// Credential ids needed by any action, deduplicated in first-use order
    pub fn credential_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for id in self.actions.iter().flat_map(ActionSpec::credential_ids) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}
