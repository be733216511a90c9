//! Persistence layer for run history and build numbers

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{Run, RunStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Summary of a recorded run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub pipeline: String,
    pub build_number: Option<u64>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of stages in the run
    pub stages: usize,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id,
            pipeline: run.pipeline.clone(),
            build_number: run.build_number,
            status: run.status(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            stages: run.results.len(),
        }
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Allocate the next build number of a pipeline, atomically
    async fn allocate_build_number(&self, pipeline: &str) -> Result<u64>;

    /// Save a finished run; saving the same run again replaces it
    async fn save_run(&self, run: &Run) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>>;

    /// Most recent runs first, optionally for one pipeline
    async fn list_runs(&self, pipeline: Option<&str>, limit: usize) -> Result<Vec<RunSummary>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: tokio::sync::RwLock<HashMap<Uuid, Run>>,
    counters: tokio::sync::Mutex<HashMap<String, u64>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn allocate_build_number(&self, pipeline: &str) -> Result<u64> {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(pipeline.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, pipeline: Option<&str>, limit: usize) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut summaries: Vec<RunSummary> = runs
            .values()
            .filter(|run| pipeline.map_or(true, |name| run.pipeline == name))
            .map(RunSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        summaries.truncate(limit);
        Ok(summaries)
    }
}
