//! Error model shared by every pipeline component

use thiserror::Error;

/// Errors raised while assembling or executing a pipeline run
///
/// Stage-internal failures (non-zero exit, timeout) are normally recorded in a
/// [`StageResult`](crate::core::StageResult) instead of being returned; the
/// variants exist so the same vocabulary can be used in results and logs.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("duplicate variable: {0}")]
    DuplicateVariable(String),

    #[error("credential not found: {0}")]
    CredentialNotFound(String),

    #[error("credential {id} could not be resolved: {reason}")]
    CredentialUnavailable { id: String, reason: String },

    #[error("credential {0} used outside of its scope")]
    CredentialExpired(String),

    #[error("failed to launch {program}: {reason}")]
    LaunchError { program: String, reason: String },

    #[error("{program} exited with code {code}")]
    NonZeroExit { program: String, code: i32 },

    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("guard evaluation failed: {0}")]
    GuardEvaluationError(String),

    #[error("notification delivery failed: {0}")]
    NotificationDeliveryError(String),

    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl PipelineError {
    /// Configuration errors abort the whole run instead of failing one stage
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::UndefinedVariable(_)
                | PipelineError::DuplicateVariable(_)
                | PipelineError::CredentialNotFound(_)
                | PipelineError::CredentialUnavailable { .. }
                | PipelineError::CredentialExpired(_)
                | PipelineError::GuardEvaluationError(_)
                | PipelineError::InvalidConfig(_)
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
