//! Transfer Registry: the observable catalogue of all transfers.
//!
//! The list lives in a `tokio::sync::watch` channel. Every mutation goes
//! through [`TransferRegistry::update`] (or insert/remove), which edits the
//! list in place and republishes it to all subscribers. Updates for an
//! unknown `file_id` are silently ignored: late progress events for a
//! cancelled or rejected transfer are expected.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Lifecycle of a transfer.
///
/// `Connecting → WaitingForApproval → Sending` on the sender,
/// `Receiving` on the receiver, ending in `Completed` or `Failed`.
/// `Paused` is reversible; `Cancelled` transfers are removed right after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Connecting,
    WaitingForApproval,
    Sending,
    Receiving,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Sent,
    Received,
}

/// One file-transfer attempt, keyed by `file_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub file_id: String,
    pub name: String,
    pub total_bytes: u64,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    /// Fraction in `[0, 1]`.
    pub progress: f64,
    /// Bytes per second.
    pub rate: f64,
    /// Comma-joined for multi-target sends.
    pub peer_ids: String,
    pub is_paused: bool,
    pub total_chunks: u32,
    pub sent_chunks: u32,
    pub received_chunks: u32,
    /// Source file (sender) or saved file (receiver, once completed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

impl Transfer {
    pub fn new(
        file_id: impl Into<String>,
        name: impl Into<String>,
        total_bytes: u64,
        total_chunks: u32,
        direction: TransferDirection,
        status: TransferStatus,
        peer_ids: &[String],
    ) -> Self {
        Self {
            file_id: file_id.into(),
            name: name.into(),
            total_bytes,
            direction,
            status,
            progress: 0.0,
            rate: 0.0,
            peer_ids: peer_ids.join(","),
            is_paused: false,
            total_chunks,
            sent_chunks: 0,
            received_chunks: 0,
            file_path: None,
        }
    }

    /// Peer ids as a list (splits the comma-joined field).
    pub fn peers(&self) -> Vec<String> {
        self.peer_ids
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    fn apply(&mut self, update: TransferUpdate) {
        if let Some(s) = update.status {
            self.status = s;
        }
        if let Some(p) = update.progress {
            self.progress = p.clamp(0.0, 1.0);
        }
        if let Some(r) = update.rate {
            self.rate = r;
        }
        if let Some(p) = update.is_paused {
            self.is_paused = p;
        }
        if let Some(n) = update.sent_chunks {
            self.sent_chunks = n;
        }
        if let Some(n) = update.received_chunks {
            self.received_chunks = n;
        }
        if let Some(ids) = update.peer_ids {
            self.peer_ids = ids;
        }
        if let Some(path) = update.file_path {
            self.file_path = Some(path);
        }
    }
}

/// Partial update merged into a [`Transfer`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferUpdate {
    pub status: Option<TransferStatus>,
    pub progress: Option<f64>,
    pub rate: Option<f64>,
    pub is_paused: Option<bool>,
    pub sent_chunks: Option<u32>,
    pub received_chunks: Option<u32>,
    pub peer_ids: Option<String>,
    pub file_path: Option<PathBuf>,
}

impl TransferUpdate {
    pub fn status(status: TransferStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.is_paused = Some(paused);
        self
    }

    pub fn sent(mut self, n: u32) -> Self {
        self.sent_chunks = Some(n);
        self
    }

    pub fn received(mut self, n: u32) -> Self {
        self.received_chunks = Some(n);
        self
    }

    pub fn peers(mut self, peers: &[String]) -> Self {
        self.peer_ids = Some(peers.join(","));
        self
    }

    pub fn path(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }
}

/// Cloneable handle to the shared transfer list.
#[derive(Clone)]
pub struct TransferRegistry {
    tx: Arc<watch::Sender<Vec<Transfer>>>,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { tx: Arc::new(tx) }
    }

    /// Observe the full transfer list; the receiver always holds the latest.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Transfer>> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Vec<Transfer> {
        self.tx.borrow().clone()
    }

    pub fn get(&self, file_id: &str) -> Option<Transfer> {
        self.tx.borrow().iter().find(|t| t.file_id == file_id).cloned()
    }

    /// Add a transfer, replacing any previous entry with the same id.
    pub fn insert(&self, transfer: Transfer) {
        self.tx.send_modify(|list| {
            match list.iter_mut().find(|t| t.file_id == transfer.file_id) {
                Some(existing) => *existing = transfer,
                None => list.push(transfer),
            }
        });
    }

    /// Merge `update` into the transfer `file_id`. Returns `false` (and
    /// publishes nothing) when the id is unknown.
    pub fn update(&self, file_id: &str, update: TransferUpdate) -> bool {
        let applied = self.tx.send_if_modified(|list| {
            match list.iter_mut().find(|t| t.file_id == file_id) {
                Some(t) => {
                    t.apply(update);
                    true
                }
                None => false,
            }
        });
        if !applied {
            trace!(event = "registry_update_ignored", file_id, "Update for unknown transfer ignored");
        }
        applied
    }

    pub fn remove(&self, file_id: &str) -> Option<Transfer> {
        let mut removed = None;
        self.tx.send_if_modified(|list| {
            match list.iter().position(|t| t.file_id == file_id) {
                Some(idx) => {
                    removed = Some(list.remove(idx));
                    true
                }
                None => false,
            }
        });
        removed
    }

    /// Remove a transfer that ended in `status`, returning it stamped with
    /// that status.
    pub fn retire(&self, file_id: &str, status: TransferStatus) -> Option<Transfer> {
        let mut transfer = self.remove(file_id)?;
        transfer.status = status;
        Some(transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Transfer {
        Transfer::new(
            id,
            "a.bin",
            100,
            1,
            TransferDirection::Sent,
            TransferStatus::Connecting,
            &["p1".to_string(), "p2".to_string()],
        )
    }

    #[test]
    fn test_update_merges_fields() {
        let reg = TransferRegistry::new();
        reg.insert(sample("f1"));
        assert!(reg.update(
            "f1",
            TransferUpdate::status(TransferStatus::Sending).progress(0.5).sent(3)
        ));
        let t = reg.get("f1").unwrap();
        assert_eq!(t.status, TransferStatus::Sending);
        assert_eq!(t.progress, 0.5);
        assert_eq!(t.sent_chunks, 3);
        assert_eq!(t.name, "a.bin");
        assert_eq!(t.peers(), vec!["p1", "p2"]);
    }

    #[test]
    fn test_update_unknown_is_noop() {
        let reg = TransferRegistry::new();
        reg.insert(sample("f1"));
        let mut rx = reg.subscribe();
        rx.borrow_and_update();

        assert!(!reg.update("missing", TransferUpdate::status(TransferStatus::Failed)));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(reg.snapshot(), vec![sample("f1")]);
    }

    #[test]
    fn test_subscribers_see_full_list() {
        let reg = TransferRegistry::new();
        let mut rx = reg.subscribe();
        reg.insert(sample("f1"));
        reg.insert(sample("f2"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 2);

        reg.update("f2", TransferUpdate::default().progress(2.0));
        assert_eq!(rx.borrow_and_update()[1].progress, 1.0);
    }

    #[test]
    fn test_remove() {
        let reg = TransferRegistry::new();
        reg.insert(sample("f1"));
        assert_eq!(reg.remove("f1").map(|t| t.file_id), Some("f1".into()));
        assert!(reg.remove("f1").is_none());
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn test_retire_stamps_final_status() {
        let reg = TransferRegistry::new();
        reg.insert(sample("f1"));
        let t = reg.retire("f1", TransferStatus::Cancelled).unwrap();
        assert_eq!(t.status, TransferStatus::Cancelled);
        assert_eq!(t.name, "a.bin");
        assert!(reg.snapshot().is_empty());
        assert!(reg.retire("f1", TransferStatus::Cancelled).is_none());
    }
}
