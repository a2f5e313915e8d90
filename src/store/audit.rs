//! Tamper-evident audit trail: a SHA-256 hash chain over JSON records.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{StoreError, StoreResult};

/// Append-only audit trail for a run.
pub trait AuditLog {
    /// Append an event, chaining its hash onto the previous record.
    fn append(&self, event: &str, detail: serde_json::Value) -> StoreResult<()>;

    /// Recompute the chain and report whether every link holds.
    fn verify(&self) -> StoreResult<bool>;
}

#[derive(Debug, Serialize, Deserialize)]
struct AuditRecord {
    seq: u64,
    at: DateTime<Utc>,
    event: String,
    detail: serde_json::Value,
    prev: String,
    hash: String,
}

impl AuditRecord {
    fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_be_bytes());
        hasher.update(self.at.to_rfc3339().as_bytes());
        hasher.update(self.event.as_bytes());
        hasher.update(self.detail.to_string().as_bytes());
        hasher.update(self.prev.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// File-backed hash chain at `<dir>/chain.jsonl`, one record per line.
pub struct FileAuditLog {
    dir: PathBuf,
}

impl FileAuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn chain_path(&self) -> PathBuf {
        self.dir.join("chain.jsonl")
    }

    fn last_record(&self) -> StoreResult<Option<AuditRecord>> {
        let path = self.chain_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        match content.lines().filter(|l| !l.trim().is_empty()).last() {
            Some(line) => Ok(Some(serde_json::from_str(line)?)),
            None => Ok(None),
        }
    }
}

impl AuditLog for FileAuditLog {
    fn append(&self, event: &str, detail: serde_json::Value) -> StoreResult<()> {
        fs::create_dir_all(&self.dir)?;

        let (seq, prev) = match self.last_record()? {
            Some(last) => (last.seq + 1, last.hash),
            None => (0, String::new()),
        };

        let mut record = AuditRecord {
            seq,
            at: Utc::now(),
            event: event.to_string(),
            detail,
            prev,
            hash: String::new(),
        };
        record.hash = record.digest();

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.chain_path())?;
        file.write_all(serde_json::to_string(&record)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn verify(&self) -> StoreResult<bool> {
        let path = self.chain_path();
        if !path.exists() {
            return Ok(true);
        }

        let content = fs::read_to_string(path)?;
        let mut prev = String::new();
        let mut seq = 0u64;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let record: AuditRecord = serde_json::from_str(line)?;
            if record.seq != seq || record.prev != prev || record.hash != record.digest() {
                return Ok(false);
            }
            prev = record.hash;
            seq += 1;
        }
        Ok(true)
    }
}
