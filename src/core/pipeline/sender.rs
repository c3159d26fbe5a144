//! Sender pipeline: streams one file's chunks to every accepting peer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   bounded chan  ┌──────────────────────┐
//! │ DiskRead │ ───────────────►│ Send loop            │──► peer channels
//! │ (async)  │   read-ahead    │ (frame, backpressure)│
//! └──────────┘                 └──────────────────────┘
//! ```
//!
//! The loop checks pause/cancel at the top of every iteration, sends the
//! chunk to each target in turn, then records a resume checkpoint. A
//! target whose channel stays unusable past the retry budget is dropped;
//! the transfer only fails once no target is left.

use anyhow::Result;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::rate::{ProgressThrottle, RateMeter};
use crate::core::checkpoint::CheckpointStore;
use crate::core::config::{
    BACKPRESSURE_BASE_DELAY, BACKPRESSURE_MAX_DELAY, BACKPRESSURE_MAX_RETRIES, DC_REOPEN_POLL,
    DC_SEND_MAX_RETRIES, SENDER_READ_AHEAD_CHUNKS, TransferPolicy,
};
use crate::core::connection::{PeerChannel, PeerTransport};
use crate::core::error::TransferError;
use crate::core::protocol::encode_chunk_frame;
use crate::core::registry::{TransferRegistry, TransferStatus, TransferUpdate};
use crate::utils::sos::SignalOfStop;

// ── Reader ─────────────────────────────────────────────────────────────────────

/// A chunk read from disk, ready to be framed.
pub struct ReadChunk {
    pub index: u32,
    pub data: Vec<u8>,
}

/// Spawn a disk reader that prefetches chunks `start_chunk..total_chunks`
/// into a bounded channel. The reader stops when the receiver is dropped.
pub fn spawn_reader(
    file_path: PathBuf,
    file_size: u64,
    total_chunks: u32,
    chunk_size: usize,
    start_chunk: u32,
) -> (mpsc::Receiver<ReadChunk>, tokio::task::JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(SENDER_READ_AHEAD_CHUNKS);

    let handle = tokio::spawn(async move {
        let mut file = tokio::fs::File::open(&file_path).await?;
        for index in start_chunk..total_chunks {
            let offset = index as u64 * chunk_size as u64;
            let len = (chunk_size as u64).min(file_size.saturating_sub(offset)) as usize;

            file.seek(SeekFrom::Start(offset)).await?;
            let mut data = vec![0u8; len];
            file.read_exact(&mut data).await?;

            if tx.send(ReadChunk { index, data }).await.is_err() {
                break;
            }
        }
        Ok(())
    });

    (rx, handle)
}

// ── Backpressure ──────────────────────────────────────────────────────────────

/// Back off (doubling, capped) until the channel's send buffer has room
/// for `next_msg_size` bytes. Gives up after [`BACKPRESSURE_MAX_RETRIES`].
pub async fn wait_for_buffer_space(
    ch: &dyn PeerChannel,
    peer_id: &str,
    next_msg_size: usize,
    high_watermark: usize,
) -> Result<(), TransferError> {
    let mut delay = BACKPRESSURE_BASE_DELAY;
    for attempt in 0..=BACKPRESSURE_MAX_RETRIES {
        if !ch.is_open() {
            return Err(TransferError::not_ready(peer_id));
        }
        let buffered = ch.buffered_amount().await;
        if buffered + next_msg_size <= high_watermark {
            return Ok(());
        }
        if attempt == BACKPRESSURE_MAX_RETRIES {
            break;
        }
        debug!(
            event = "backpressure",
            peer_id,
            buffered,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Waiting for send buffer to drain"
        );
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(BACKPRESSURE_MAX_DELAY);
    }
    warn!(event = "backpressure_exhausted", peer_id, "Send buffer never drained");
    Err(TransferError::not_ready(peer_id))
}

/// Send one framed chunk to `peer_id`, waiting for the channel to (re)open
/// up to [`DC_SEND_MAX_RETRIES`] times.
pub async fn send_chunk_with_retry(
    transport: &dyn PeerTransport,
    peer_id: &str,
    frame: Bytes,
    high_watermark: usize,
) -> Result<(), TransferError> {
    for attempt in 0..=DC_SEND_MAX_RETRIES {
        match transport.channel(peer_id).await {
            Some(ch) if ch.is_open() => {
                wait_for_buffer_space(ch.as_ref(), peer_id, frame.len(), high_watermark).await?;
                match ch.send_binary(frame.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!(event = "chunk_send_retry", peer_id, attempt, error = %e, "Chunk send failed, retrying");
                    }
                }
            }
            _ => {
                debug!(event = "channel_not_open", peer_id, attempt, "Waiting for channel to open");
            }
        }
        if attempt < DC_SEND_MAX_RETRIES {
            tokio::time::sleep(DC_REOPEN_POLL).await;
        }
    }
    Err(TransferError::not_ready(peer_id))
}

// ── Send loop ─────────────────────────────────────────────────────────────────

/// Cooperative pause/cancel flags shared with the transfer service.
#[derive(Clone, Default)]
pub struct SendControl {
    paused: Arc<AtomicBool>,
    cancel: SignalOfStop,
}

impl SendControl {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.cancelled()
    }
}

/// Everything the loop needs to know about one outgoing file.
#[derive(Debug, Clone)]
pub struct SendJob {
    pub file_id: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub chunk_size: usize,
    pub total_chunks: u32,
    /// First chunk to send (resume point).
    pub start_chunk: u32,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    /// Halted by a pause; `next_chunk` is where a resume picks up.
    Paused { next_chunk: u32 },
    Cancelled,
    Failed(String),
}

pub struct SendContext<'a> {
    pub transport: &'a dyn PeerTransport,
    pub registry: &'a TransferRegistry,
    pub checkpoints: &'a CheckpointStore,
    pub policy: &'a TransferPolicy,
    pub control: &'a SendControl,
}

pub async fn run_send_loop(job: SendJob, ctx: SendContext<'_>) -> SendOutcome {
    let SendJob {
        file_id,
        path,
        file_size,
        chunk_size,
        total_chunks,
        start_chunk,
        mut targets,
    } = job;

    info!(
        event = "send_started",
        file_id = %file_id,
        start_chunk,
        total_chunks,
        targets = targets.len(),
        "Sending file"
    );

    let (mut chunks, reader) = spawn_reader(path, file_size, total_chunks, chunk_size, start_chunk);
    let mut rate = RateMeter::default();
    let mut throttle = ProgressThrottle::default();
    let mut next = start_chunk;

    let outcome = loop {
        // Every chunk is out: a late pause or cancel no longer applies.
        if next >= total_chunks {
            break SendOutcome::Completed;
        }
        if ctx.control.is_cancelled() {
            break SendOutcome::Cancelled;
        }
        if ctx.control.is_paused() {
            break SendOutcome::Paused { next_chunk: next };
        }

        let Some(chunk) = chunks.recv().await else {
            break SendOutcome::Failed("file read failed".to_string());
        };
        let frame = encode_chunk_frame(&file_id, chunk.index, &chunk.data);

        let mut failed = Vec::new();
        for peer_id in &targets {
            if let Err(e) =
                send_chunk_with_retry(ctx.transport, peer_id, frame.clone(), ctx.policy.buffered_amount_high).await
            {
                warn!(event = "target_dropped", file_id = %file_id, peer_id = %peer_id, index = chunk.index, error = %e, "Dropping target");
                failed.push(peer_id.clone());
            }
        }
        if !failed.is_empty() {
            targets.retain(|p| !failed.contains(p));
            ctx.registry
                .update(&file_id, TransferUpdate::default().peers(&targets));
            if targets.is_empty() {
                break SendOutcome::Failed("no reachable targets".to_string());
            }
        }

        if let Err(e) = ctx.checkpoints.save(&file_id, chunk.index).await {
            warn!(event = "checkpoint_save_failed", file_id = %file_id, error = %e, "Checkpoint not saved");
        }

        next = chunk.index + 1;
        let current_rate = rate.record(chunk.data.len());
        if throttle.ready(next == total_chunks) {
            ctx.registry.update(
                &file_id,
                TransferUpdate::default()
                    .progress(next as f64 / total_chunks as f64)
                    .rate(current_rate)
                    .sent(next),
            );
        }

        if !ctx.policy.inter_chunk_delay.is_zero() {
            tokio::time::sleep(ctx.policy.inter_chunk_delay).await;
        }
    };

    drop(chunks);
    if let Ok(Err(e)) = reader.await {
        warn!(event = "file_read_failed", file_id = %file_id, error = %e, "Reading source file failed");
    }

    match &outcome {
        SendOutcome::Completed => {
            ctx.registry.update(
                &file_id,
                TransferUpdate::status(TransferStatus::Completed)
                    .progress(1.0)
                    .sent(total_chunks),
            );
            if let Err(e) = ctx.checkpoints.clear(&file_id).await {
                warn!(event = "checkpoint_clear_failed", file_id = %file_id, error = %e, "Checkpoint not cleared");
            }
            info!(event = "send_completed", file_id = %file_id, total_chunks, "File sent");
        }
        SendOutcome::Failed(reason) => {
            ctx.registry
                .update(&file_id, TransferUpdate::status(TransferStatus::Failed));
            warn!(event = "send_failed", file_id = %file_id, reason = %reason, "Send failed");
        }
        SendOutcome::Paused { next_chunk } => {
            info!(event = "send_paused", file_id = %file_id, next_chunk, "Send loop halted by pause");
        }
        SendOutcome::Cancelled => {
            info!(event = "send_cancelled", file_id = %file_id, "Send loop halted by cancel");
        }
    }
    outcome
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CHUNK_SIZE;
    use crate::core::protocol::decode_chunk_frame;
    use crate::core::registry::{Transfer, TransferDirection};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("peerdrop_test_sender").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    /// Channel that records frames; `buffered` drains by `drain` per poll.
    #[derive(Default)]
    struct RecordingChannel {
        closed: AtomicBool,
        buffered: AtomicUsize,
        drain: usize,
        polls: AtomicUsize,
        sent: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl PeerChannel for RecordingChannel {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn buffered_amount(&self) -> usize {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let now = self.buffered.load(Ordering::SeqCst);
            self.buffered
                .store(now.saturating_sub(self.drain), Ordering::SeqCst);
            now
        }

        async fn send_text(&self, _text: String) -> Result<()> {
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> Result<()> {
            self.sent.lock().unwrap().push(data);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        channels: HashMap<String, Arc<RecordingChannel>>,
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn open(&self, _peer_id: &str) -> Result<()> {
            Ok(())
        }

        async fn channel(&self, peer_id: &str) -> Option<Arc<dyn PeerChannel>> {
            self.channels
                .get(peer_id)
                .map(|c| c.clone() as Arc<dyn PeerChannel>)
        }
    }

    fn unpaced(mut policy: TransferPolicy) -> TransferPolicy {
        policy.inter_chunk_delay = std::time::Duration::ZERO;
        policy
    }

    fn sample_file(dir: &std::path::Path, len: usize) -> (PathBuf, Vec<u8>) {
        let path = dir.join("src.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    fn job(path: PathBuf, size: usize, chunk: usize, start: u32, targets: &[&str]) -> SendJob {
        SendJob {
            file_id: "f".into(),
            path,
            file_size: size as u64,
            chunk_size: chunk,
            total_chunks: crate::core::config::total_chunks(size as u64, chunk).unwrap(),
            start_chunk: start,
            targets: targets.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn registry_for(job: &SendJob) -> TransferRegistry {
        let registry = TransferRegistry::new();
        registry.insert(Transfer::new(
            job.file_id.clone(),
            "src.bin",
            job.file_size,
            job.total_chunks,
            TransferDirection::Sent,
            TransferStatus::Sending,
            &job.targets,
        ));
        registry
    }

    #[tokio::test]
    async fn reader_produces_all_chunks() {
        let dir = test_dir("reader_all");
        let (path, data) = sample_file(&dir, CHUNK_SIZE * 3 + 100);
        let total = crate::core::config::total_chunks(data.len() as u64, CHUNK_SIZE).unwrap();

        let (mut rx, _handle) = spawn_reader(path, data.len() as u64, total, CHUNK_SIZE, 0);
        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.push(chunk);
        }

        assert_eq!(received.len(), 4);
        assert_eq!(received[0].index, 0);
        assert_eq!(received.last().unwrap().data.len(), 100);
        cleanup(&dir);
    }

    #[tokio::test]
    async fn reader_skips_chunks_for_resume() {
        let dir = test_dir("reader_resume");
        let (path, _) = sample_file(&dir, CHUNK_SIZE * 4);

        let (mut rx, _handle) = spawn_reader(path, (CHUNK_SIZE * 4) as u64, 4, CHUNK_SIZE, 2);
        let mut indices = Vec::new();
        while let Some(chunk) = rx.recv().await {
            indices.push(chunk.index);
        }
        assert_eq!(indices, vec![2, 3]);
        cleanup(&dir);
    }

    #[tokio::test]
    async fn backpressure_waits_until_drained() {
        let ch = RecordingChannel {
            buffered: AtomicUsize::new(1000),
            drain: 400,
            ..Default::default()
        };
        wait_for_buffer_space(&ch, "p", 100, 500).await.unwrap();
        // 1000 → 600 → 200: third poll fits.
        assert_eq!(ch.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backpressure_fails_on_closed_channel() {
        let ch = RecordingChannel {
            buffered: AtomicUsize::new(1000),
            ..Default::default()
        };
        ch.closed.store(true, Ordering::SeqCst);
        let err = wait_for_buffer_space(&ch, "p", 100, 500).await.unwrap_err();
        assert!(matches!(err, TransferError::ChannelNotReady { .. }));
    }

    #[tokio::test]
    async fn send_loop_delivers_every_chunk_and_clears_checkpoint() {
        let dir = test_dir("loop_all");
        let (path, data) = sample_file(&dir, 5000);
        let ch = Arc::new(RecordingChannel::default());
        let transport = FakeTransport {
            channels: HashMap::from([("p".to_string(), ch.clone())]),
        };
        let job = job(path, data.len(), 1000, 0, &["p"]);
        let registry = registry_for(&job);
        let checkpoints = CheckpointStore::in_memory();
        let policy = unpaced(TransferPolicy::default());
        let control = SendControl::default();

        let outcome = run_send_loop(
            job,
            SendContext {
                transport: &transport,
                registry: &registry,
                checkpoints: &checkpoints,
                policy: &policy,
                control: &control,
            },
        )
        .await;
        assert_eq!(outcome, SendOutcome::Completed);

        let sent = ch.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 5);
        let mut rebuilt = Vec::new();
        for (i, frame) in sent.iter().enumerate() {
            let f = decode_chunk_frame(frame).unwrap();
            assert_eq!(f.chunk_index, i as u32);
            rebuilt.extend_from_slice(&f.payload);
        }
        assert_eq!(rebuilt, data);

        let t = registry.get("f").unwrap();
        assert_eq!(t.status, TransferStatus::Completed);
        assert_eq!(t.sent_chunks, 5);
        assert!(checkpoints.load("f").await.is_none());
        cleanup(&dir);
    }

    #[tokio::test]
    async fn send_loop_resumes_from_start_chunk() {
        let dir = test_dir("loop_resume");
        let (path, data) = sample_file(&dir, 4000);
        let ch = Arc::new(RecordingChannel::default());
        let transport = FakeTransport {
            channels: HashMap::from([("p".to_string(), ch.clone())]),
        };
        let job = job(path, data.len(), 1000, 2, &["p"]);
        let registry = registry_for(&job);
        let checkpoints = CheckpointStore::in_memory();
        let policy = unpaced(TransferPolicy::default());
        let control = SendControl::default();

        run_send_loop(
            job,
            SendContext {
                transport: &transport,
                registry: &registry,
                checkpoints: &checkpoints,
                policy: &policy,
                control: &control,
            },
        )
        .await;

        let indices: Vec<u32> = ch
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|f| decode_chunk_frame(f).unwrap().chunk_index)
            .collect();
        assert_eq!(indices, vec![2, 3]);
        cleanup(&dir);
    }

    #[tokio::test]
    async fn paused_loop_sends_nothing() {
        let dir = test_dir("loop_paused");
        let (path, data) = sample_file(&dir, 3000);
        let ch = Arc::new(RecordingChannel::default());
        let transport = FakeTransport {
            channels: HashMap::from([("p".to_string(), ch.clone())]),
        };
        let job = job(path, data.len(), 1000, 1, &["p"]);
        let registry = registry_for(&job);
        let checkpoints = CheckpointStore::in_memory();
        let policy = unpaced(TransferPolicy::default());
        let control = SendControl::default();
        control.pause();

        let outcome = run_send_loop(
            job,
            SendContext {
                transport: &transport,
                registry: &registry,
                checkpoints: &checkpoints,
                policy: &policy,
                control: &control,
            },
        )
        .await;
        assert_eq!(outcome, SendOutcome::Paused { next_chunk: 1 });
        assert!(ch.sent.lock().unwrap().is_empty());
        cleanup(&dir);
    }

    #[tokio::test]
    async fn pause_after_last_chunk_still_completes() {
        let dir = test_dir("loop_pause_at_end");
        let (path, data) = sample_file(&dir, 2000);
        let ch = Arc::new(RecordingChannel::default());
        let transport = FakeTransport {
            channels: HashMap::from([("p".to_string(), ch.clone())]),
        };
        let job = job(path, data.len(), 1000, 2, &["p"]);
        let registry = registry_for(&job);
        let checkpoints = CheckpointStore::in_memory();
        checkpoints.save("f", 1).await.unwrap();
        let policy = unpaced(TransferPolicy::default());
        let control = SendControl::default();
        control.pause();

        let outcome = run_send_loop(
            job,
            SendContext {
                transport: &transport,
                registry: &registry,
                checkpoints: &checkpoints,
                policy: &policy,
                control: &control,
            },
        )
        .await;
        assert_eq!(outcome, SendOutcome::Completed);
        assert!(ch.sent.lock().unwrap().is_empty());
        let t = registry.get("f").unwrap();
        assert_eq!(t.status, TransferStatus::Completed);
        assert_eq!(t.sent_chunks, 2);
        assert!(checkpoints.load("f").await.is_none());
        cleanup(&dir);
    }

    #[tokio::test]
    async fn unreachable_target_is_dropped_others_continue() {
        let dir = test_dir("loop_drop");
        let (path, data) = sample_file(&dir, 2000);
        let good = Arc::new(RecordingChannel::default());
        let dead = Arc::new(RecordingChannel::default());
        dead.closed.store(true, Ordering::SeqCst);
        let transport = FakeTransport {
            channels: HashMap::from([
                ("good".to_string(), good.clone()),
                ("dead".to_string(), dead.clone()),
            ]),
        };
        let job = job(path, data.len(), 1000, 0, &["dead", "good"]);
        let registry = registry_for(&job);
        let checkpoints = CheckpointStore::in_memory();
        let policy = unpaced(TransferPolicy::default());
        let control = SendControl::default();

        let outcome = run_send_loop(
            job,
            SendContext {
                transport: &transport,
                registry: &registry,
                checkpoints: &checkpoints,
                policy: &policy,
                control: &control,
            },
        )
        .await;
        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(good.sent.lock().unwrap().len(), 2);
        assert_eq!(registry.get("f").unwrap().peer_ids, "good");
        cleanup(&dir);
    }
}
