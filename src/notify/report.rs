//! Status report built from a finished run

use crate::core::{EnvironmentContext, Run, RunStatus, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing::warn;
use uuid::Uuid;

/// One line of the stage-by-stage breakdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLine {
    pub stage: String,
    pub status: StageStatus,
    /// Failure message or skip reason
    pub detail: Option<String>,
    pub duration_ms: u64,
}

/// Summary of a run as delivered to notification transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub pipeline: String,
    pub run_id: Uuid,
    pub build_number: Option<u64>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageLine>,
    /// Error that stopped the run before or between stages
    pub error: Option<String>,
    /// Link to the full logs
    pub log_url: Option<String>,
}

impl StatusReport {
    /// Build a report; `log_url` may use `{{ RUN_ID }}` and `{{ BUILD_NUMBER }}`
    pub fn from_run(run: &Run, log_url: Option<&str>) -> Self {
        let stages = run
            .results
            .iter()
            .map(|result| StageLine {
                stage: result.stage.clone(),
                status: result.status,
                detail: result.error.clone().or_else(|| result.reason.clone()),
                duration_ms: result.duration_ms,
            })
            .collect();

        Self {
            pipeline: run.pipeline.clone(),
            run_id: run.id,
            build_number: run.build_number,
            status: run.status(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            stages,
            error: run.fatal_error.clone(),
            log_url: log_url.and_then(|template| render_log_url(template, run)),
        }
    }

    pub fn subject(&self) -> String {
        match self.build_number {
            Some(number) => format!("[{}] build #{}: {}", self.pipeline, number, self.status),
            None => format!("[{}] run {}: {}", self.pipeline, self.short_id(), self.status),
        }
    }

    /// Plain-text body with the stage-by-stage breakdown
    pub fn body(&self) -> String {
        let mut body = String::new();
        let _ = writeln!(body, "Pipeline: {}", self.pipeline);
        if let Some(number) = self.build_number {
            let _ = writeln!(body, "Build:    #{}", number);
        }
        let _ = writeln!(body, "Run:      {}", self.run_id);
        let _ = writeln!(body, "Status:   {}", self.status);
        if let Some(finished) = self.finished_at {
            let secs = (finished - self.started_at).num_milliseconds() as f64 / 1000.0;
            let _ = writeln!(body, "Duration: {:.1}s", secs);
        }
        if let Some(error) = &self.error {
            let _ = writeln!(body, "Error:    {}", error);
        }

        let _ = writeln!(body);
        let _ = writeln!(body, "Stages:");
        for line in &self.stages {
            let _ = write!(body, "  {:<10} {}", line.status.as_str(), line.stage);
            if line.status != StageStatus::Skipped {
                let _ = write!(body, " ({:.1}s)", line.duration_ms as f64 / 1000.0);
            }
            if let Some(detail) = &line.detail {
                let _ = write!(body, " - {}", detail);
            }
            let _ = writeln!(body);
        }

        if let Some(url) = &self.log_url {
            let _ = writeln!(body);
            let _ = writeln!(body, "Logs: {}", url);
        }
        body
    }

    fn short_id(&self) -> String {
        self.run_id.to_string().chars().take(8).collect()
    }
}

fn render_log_url(template: &str, run: &Run) -> Option<String> {
    let mut builder = EnvironmentContext::builder().set("RUN_ID", run.id.to_string());
    if let Some(number) = run.build_number {
        builder = builder.set("BUILD_NUMBER", number.to_string());
    }
    let rendered = builder.build().and_then(|ctx| ctx.render(template));
    match rendered {
        Ok(url) => Some(url),
        Err(e) => {
            warn!("Cannot render log URL {}: {}", template, e);
            None
        }
    }
}
