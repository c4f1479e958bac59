//! Memory Store — persists per-conversation turn history across executor
//! runs. A persistent record is `{input, output, time, temp_data}`; on load,
//! at most K most-recent records are flattened into a single `history` turn
//! and injected before the new query.
//!
//! Persistence mechanics are ported from `TranscriptWriter`'s append-only
//! JSONL pattern: one JSON object per line, tolerant-skip malformed lines on
//! read. A persistent memory record is itself an append-only per-conversation
//! log, so the same mechanics apply unchanged.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

const DEFAULT_MEMORY_SIZE: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub input: String,
    pub output: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub temp_data: serde_json::Value,
}

pub trait MemoryStore: Send + Sync {
    fn append(&self, conversation_id: &str, record: &MemoryRecord) -> Result<()>;
    fn load_recent(&self, conversation_id: &str, k: usize) -> Result<Vec<MemoryRecord>>;
}

/// JSONL-file-backed implementation: `<base_dir>/<conversation_id>.jsonl`.
pub struct FileMemoryStore {
    base_dir: PathBuf,
}

impl FileMemoryStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.base_dir.join(format!("{conversation_id}.jsonl"))
    }
}

impl MemoryStore for FileMemoryStore {
    fn append(&self, conversation_id: &str, record: &MemoryRecord) -> Result<()> {
        use std::io::Write;
        std::fs::create_dir_all(&self.base_dir)
            .map_err(|e| EngineError::PersistenceTransient(e.to_string()))?;
        let path = self.path_for(conversation_id);
        let json = serde_json::to_string(record)
            .map_err(|e| EngineError::PersistenceTransient(e.to_string()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::PersistenceTransient(e.to_string()))?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| EngineError::PersistenceTransient(e.to_string()))?;
        Ok(())
    }

    fn load_recent(&self, conversation_id: &str, k: usize) -> Result<Vec<MemoryRecord>> {
        let path = self.path_for(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::PersistenceTransient(e.to_string()))?;
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => {
                    tracing::warn!(conversation_id, error = %e, "skipping malformed memory record");
                }
            }
        }
        let start = records.len().saturating_sub(k);
        Ok(records.split_off(start))
    }
}

/// Flatten the K most recent records into the single `history` turn format
/// named in the data model: `user: <input>\n\nassistant: <output>`.
pub fn flatten_history(records: &[MemoryRecord]) -> String {
    records
        .iter()
        .map(|r| format!("user: {}\n\nassistant: {}", r.input, r.output))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn default_memory_size() -> usize {
    DEFAULT_MEMORY_SIZE
}
