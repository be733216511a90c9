//! Write-once stage log files

use crate::core::{error::Result, StageResult};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Writes one log file per executed stage under `<root>/<run-id>/`
///
/// Files are created with create-new semantics: an existing file is an
/// error, never overwritten.
#[derive(Debug, Clone)]
pub struct StageLogWriter {
    root: PathBuf,
}

impl StageLogWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the logs of one run
    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Deterministic path of a stage log
    pub fn path_for(&self, run_id: Uuid, index: usize, stage: &str) -> PathBuf {
        self.run_dir(run_id)
            .join(format!("{:02}-{}.log", index + 1, file_safe(stage)))
    }

    /// Write the (already masked) output of a stage
    pub fn write(&self, run_id: Uuid, index: usize, result: &StageResult) -> Result<PathBuf> {
        let path = self.path_for(run_id, index, &result.stage);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        writeln!(file, "stage: {}", result.stage)?;
        writeln!(file, "status: {}", result.status)?;
        if let Some(code) = result.exit_code {
            writeln!(file, "exit_code: {}", code)?;
        }
        if let Some(error) = &result.error {
            writeln!(file, "error: {}", error)?;
        }
        writeln!(file, "--- stdout ---")?;
        file.write_all(result.stdout.as_bytes())?;
        if !result.stdout.is_empty() && !result.stdout.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "--- stderr ---")?;
        file.write_all(result.stderr.as_bytes())?;
        file.flush()?;

        debug!("Wrote stage log {}", path.display());
        Ok(path)
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
