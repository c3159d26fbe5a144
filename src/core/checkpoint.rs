//! Resume checkpoints for outgoing transfers.
//!
//! Key-value records `resume_<fileId> → {lastChunk, timestamp}` kept in
//! `<data_dir>/checkpoints.json`. Written after every successfully sent
//! chunk, read when a transfer (re)starts, cleared on completion or
//! cancel. Only the sending side persists checkpoints.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::utils::atomic_write::atomic_write;

/// Last chunk index delivered to every accepting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeCheckpoint {
    pub last_chunk: u32,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl ResumeCheckpoint {
    /// First chunk index still to send.
    pub fn next_chunk(&self) -> u32 {
        self.last_chunk.saturating_add(1)
    }
}

pub struct CheckpointStore {
    /// `None` keeps checkpoints in memory only.
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, ResumeCheckpoint>>,
}

fn key(file_id: &str) -> String {
    format!("resume_{file_id}")
}

impl CheckpointStore {
    /// Open (or create) the store at `path`. A corrupt file is logged and
    /// replaced by an empty store.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(
                    event = "checkpoint_store_corrupt",
                    path = %path.display(),
                    error = %e,
                    "Discarding unreadable checkpoint file"
                );
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(&self, file_id: &str) -> Option<ResumeCheckpoint> {
        self.entries.lock().await.get(&key(file_id)).copied()
    }

    pub async fn save(&self, file_id: &str, last_chunk: u32) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key(file_id),
            ResumeCheckpoint {
                last_chunk,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        );
        self.persist(&entries).await
    }

    pub async fn clear(&self, file_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(&key(file_id)).is_some() {
            debug!(event = "checkpoint_cleared", file_id, "Resume checkpoint cleared");
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn persist(&self, entries: &HashMap<String, ResumeCheckpoint>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(entries)?;
        atomic_write(path, &content).await
    }
}
