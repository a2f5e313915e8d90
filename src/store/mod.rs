//! Per-run on-disk state: metadata, captured logs, audit trail.

mod audit;
mod metadata;

pub use audit::{AuditLog, FileAuditLog};
pub use metadata::RunMetadata;

use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata for run {0} not found")]
    NotFound(String),

    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// File-backed store for run state, rooted at a base directory.
///
/// Layout per run: `<base>/<run-id>/metadata.json`, `<base>/<run-id>/logs.jsonl`,
/// and `<base>/<run-id>/audit/chain.jsonl`.
#[derive(Debug, Clone)]
pub struct Store {
    base: PathBuf,
}

impl Store {
    pub fn new(base: impl Into<PathBuf>) -> StoreResult<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// Directory holding everything persisted for a run.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base.join(run_id)
    }

    /// Path of the captured-output file for a run.
    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("logs.jsonl")
    }

    fn metadata_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("metadata.json")
    }

    /// Atomically persist run metadata (temp file, then rename).
    pub fn save_metadata(&self, meta: &RunMetadata) -> StoreResult<()> {
        let dir = self.run_dir(&meta.id);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join("metadata.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(meta)?)?;
        fs::rename(&tmp, self.metadata_path(&meta.id))?;
        Ok(())
    }

    pub fn load_metadata(&self, run_id: &str) -> StoreResult<RunMetadata> {
        let path = self.metadata_path(run_id);
        if !path.exists() {
            return Err(StoreError::NotFound(run_id.to_string()));
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Load every readable metadata record under the base directory.
    ///
    /// Unreadable or corrupt records are skipped with a warning so a single
    /// bad run cannot block boot.
    pub fn list_runs(&self) -> StoreResult<Vec<RunMetadata>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.load_metadata(&id) {
                Ok(meta) => out.push(meta),
                Err(e) => warn!("skipping run {}: {}", id, e),
            }
        }
        Ok(out)
    }

    /// Replace the log file with a full snapshot of container output.
    pub fn write_logs(&self, run_id: &str, data: &[u8]) -> StoreResult<()> {
        fs::create_dir_all(self.run_dir(run_id))?;
        fs::write(self.log_path(run_id), data)?;
        Ok(())
    }

    /// Append streamed output to the log file.
    pub fn append_logs(&self, run_id: &str, data: &[u8]) -> StoreResult<()> {
        use std::io::Write;

        fs::create_dir_all(self.run_dir(run_id))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(run_id))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn read_logs(&self, run_id: &str) -> StoreResult<String> {
        Ok(fs::read_to_string(self.log_path(run_id))?)
    }

    /// Delete everything persisted for a run.
    pub fn remove_run(&self, run_id: &str) -> StoreResult<()> {
        let dir = self.run_dir(run_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Audit trail for a run.
    pub fn audit(&self, run_id: &str) -> FileAuditLog {
        FileAuditLog::new(self.run_dir(run_id).join("audit"))
    }
}
