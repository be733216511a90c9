//! SQLite-based run history

use crate::core::{Run, RunStatus};
use crate::persistence::{RunStore, RunSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// SQLite run store
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (or create) a store at `db_path`; `:memory:` is accepted
    pub async fn new(db_path: &str) -> Result<Self> {
        let in_memory = db_path == ":memory:";
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);

        // Every in-memory connection would be its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("stageline");
        Self::at(&db_dir.join("runs.db")).await
    }

    /// Open a store file, creating its directory first
    pub async fn at(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let path = path
            .to_str()
            .with_context(|| format!("Database path is not UTF-8: {}", path.display()))?;
        Self::new(path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline TEXT NOT NULL,
                build_number INTEGER,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                stages INTEGER NOT NULL DEFAULT 0,
                record TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS build_counters (
                pipeline TEXT PRIMARY KEY,
                last INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn summary(row: &SqliteRow) -> Result<RunSummary> {
        let status: String = row.get("status");
        Ok(RunSummary {
            run_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            pipeline: row.get("pipeline"),
            build_number: row.get::<Option<i64>, _>("build_number").map(|n| n as u64),
            status: RunStatus::parse(&status)
                .with_context(|| format!("Unknown run status {}", status))?,
            started_at: Self::from_naive(row.get("started_at")),
            finished_at: row
                .get::<Option<NaiveDateTime>, _>("finished_at")
                .map(Self::from_naive),
            stages: row.get::<i64, _>("stages") as usize,
        })
    }
}

#[async_trait::async_trait]
impl RunStore for SqliteRunStore {
    async fn allocate_build_number(&self, pipeline: &str) -> Result<u64> {
        let row = sqlx::query(
            r#"
            INSERT INTO build_counters (pipeline, last) VALUES (?1, 1)
            ON CONFLICT(pipeline) DO UPDATE SET last = last + 1
            RETURNING last
            "#,
        )
        .bind(pipeline)
        .fetch_one(&self.pool)
        .await
        .context("Failed to allocate build number")?;

        Ok(row.get::<i64, _>("last") as u64)
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        let record = serde_json::to_string(run).context("Failed to serialize run")?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO runs
            (id, pipeline, build_number, status, started_at, finished_at, stages, record)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.pipeline)
        .bind(run.build_number.map(|n| n as i64))
        .bind(run.status().as_str())
        .bind(Self::to_naive(run.started_at))
        .bind(run.finished_at.map(Self::to_naive))
        .bind(run.results.len() as i64)
        .bind(record)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT record FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        match row {
            Some(row) => {
                let record: String = row.get("record");
                let run = serde_json::from_str(&record).context("Corrupt run record")?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self, pipeline: Option<&str>, limit: usize) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, pipeline, build_number, status, started_at, finished_at, stages
            FROM runs
            WHERE ?1 IS NULL OR pipeline = ?1
            ORDER BY started_at DESC
            LIMIT ?2
            "#,
        )
        .bind(pipeline)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter().map(Self::summary).collect()
    }
}
