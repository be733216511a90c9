//! Run and stage result models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Terminal state of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// Guard was false, or an earlier stage aborted the run
    Skipped,
    Succeeded,
    Failed,
    /// Failed under the continue-degraded policy
    Unstable,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Skipped => "SKIPPED",
            StageStatus::Succeeded => "SUCCEEDED",
            StageStatus::Failed => "FAILED",
            StageStatus::Unstable => "UNSTABLE",
        }
    }
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Succeeded,
    Unstable,
    Failed,
    /// Stopped by an external abort request
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Unstable => "UNSTABLE",
            RunStatus::Failed => "FAILED",
            RunStatus::Aborted => "ABORTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUCCEEDED" => Some(RunStatus::Succeeded),
            "UNSTABLE" => Some(RunStatus::Unstable),
            "FAILED" => Some(RunStatus::Failed),
            "ABORTED" => Some(RunStatus::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage, created once and never changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,

    /// Masked stdout of every action that ran
    #[serde(default)]
    pub stdout: String,

    /// Masked stderr of every action that ran
    #[serde(default)]
    pub stderr: String,

    /// Exit code of the last invocation (None when skipped or timed out)
    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Failure description
    #[serde(default)]
    pub error: Option<String>,

    /// Why the stage was skipped
    #[serde(default)]
    pub reason: Option<String>,

    /// Files produced by the stage's actions
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,

    /// Write-once log file with the stage output
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub duration_ms: u64,
}

impl StageResult {
    pub fn skipped(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Skipped,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: None,
            reason: Some(reason.into()),
            artifacts: Vec::new(),
            log_file: None,
            started_at: None,
            duration_ms: 0,
        }
    }
}

/// Record of one pipeline execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run ID
    pub id: Uuid,

    pub pipeline: String,

    /// Allocated from the history store at run start, if one is configured
    #[serde(default)]
    pub build_number: Option<u64>,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// One result per stage, in declared order
    pub results: Vec<StageResult>,

    /// Set when an external abort request stopped the run
    #[serde(default)]
    pub aborted: bool,

    /// Configuration error that stopped the run
    #[serde(default)]
    pub fatal_error: Option<String>,
}

impl Run {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            build_number: None,
            started_at: Utc::now(),
            finished_at: None,
            results: Vec::new(),
            aborted: false,
            fatal_error: None,
        }
    }

    /// Overall status, derived from the stage results
    pub fn status(&self) -> RunStatus {
        if self.fatal_error.is_some() {
            RunStatus::Failed
        } else if self.aborted {
            RunStatus::Aborted
        } else if self.results.iter().any(|r| r.status == StageStatus::Failed) {
            RunStatus::Failed
        } else if self.results.iter().any(|r| r.status == StageStatus::Unstable) {
            RunStatus::Unstable
        } else {
            RunStatus::Succeeded
        }
    }

    /// Get the result of a stage by name
    pub fn result(&self, stage: &str) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    pub fn statuses(&self) -> Vec<StageStatus> {
        self.results.iter().map(|r| r.status).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn duration(&self) -> Option<std::time::Duration> {
        self.finished_at
            .and_then(|end| end.signed_duration_since(self.started_at).to_std().ok())
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
