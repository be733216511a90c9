//! stageline - a sequential CI/CD pipeline executor with guarded stages,
//! scoped credentials and run notifications

pub mod cli;
pub mod core;
pub mod execution;
pub mod notify;
pub mod persistence;
pub mod runner;

// Re-export commonly used types
pub use core::{
    EnvironmentContext, CredentialStore, Pipeline, PipelineError, Run, RunStatus, Stage,
    StageResult, StageStatus,
};
pub use execution::{AbortHandle, ExecutionEvent, PipelineExecutor};
pub use notify::{Notifier, ReportNotifier};
pub use runner::{CommandRunner, Invocation, ProcessRunner};
