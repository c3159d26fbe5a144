//! Centralized configuration constants for PeerDrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. The heuristic thresholds that depend on the
//! deployment (small-file cut-off, buffer threshold, pacing) are grouped
//! in [`TransferPolicy`] so they can be overridden from `config.toml`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Chunk size for regular files (64 KB).
///
/// A framed chunk is slightly larger than this, which is why the SCTP
/// message limit is raised to [`SCTP_MAX_MESSAGE_SIZE`].
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Files strictly below this size are "small": reduced chunk size and
/// in-memory reassembly on the receiving side.
pub const SMALL_FILE_THRESHOLD: u64 = 50 * 1024;

/// Chunk size used for small files.
pub const SMALL_FILE_CHUNK_SIZE: usize = 8 * 1024;

/// Largest file a peer may announce (1 TiB).
pub const MAX_FILE_SIZE: u64 = 1 << 40;

/// Most chunks a single transfer may be split into.
pub const MAX_TOTAL_CHUNKS: u32 = 1 << 24;

/// Pause between two consecutive chunk sends.
pub const INTER_CHUNK_DELAY: Duration = Duration::from_millis(2);

/// Chunks the sender's disk reader may prefetch ahead of the send loop.
pub const SENDER_READ_AHEAD_CHUNKS: usize = 8;

/// Receiver disk write queue depth (chunks waiting for the writer task).
pub const RECEIVER_WRITE_QUEUE_CHUNKS: usize = 64;

/// Rolling window of instantaneous rate samples used for smoothing.
pub const RATE_SAMPLE_WINDOW: usize = 5;

/// Minimum interval between two progress notifications (final chunk exempt).
pub const PROGRESS_THROTTLE: Duration = Duration::from_secs(1);

/// How long the sender waits for every target to answer a request before
/// proceeding with whoever accepted.
pub const ACCEPT_WINDOW: Duration = Duration::from_secs(60);

// ── Flow control ─────────────────────────────────────────────────────────────

/// Outstanding bytes on the data channel above which the sender backs off.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 256 * 1024;

/// First backoff step while the channel buffer drains.
pub const BACKPRESSURE_BASE_DELAY: Duration = Duration::from_millis(10);

/// Upper bound for one backoff step.
pub const BACKPRESSURE_MAX_DELAY: Duration = Duration::from_millis(500);

/// Backoff attempts before a chunk send fails with `ChannelNotReady`.
pub const BACKPRESSURE_MAX_RETRIES: u32 = 12;

/// Attempts to wait for a non-open channel to (re)open during a send.
pub const DC_SEND_MAX_RETRIES: u32 = 10;

/// Delay between two "is the channel open yet" polls during a send retry.
pub const DC_REOPEN_POLL: Duration = Duration::from_millis(500);

// ── Connection / Signaling ───────────────────────────────────────────────────

/// Public STUN server used for candidate gathering.
pub const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// SCTP message limit we can send and advertise; fits a framed chunk.
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 256 * 1024;

/// Label of the single ordered data channel per peer.
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

/// Timeout waiting for a peer's data channel to open.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervision tick: at most one corrective action per peer per tick.
pub const SUPERVISION_INTERVAL: Duration = Duration::from_secs(5);

/// Heartbeat period while a channel is open.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before the initiator re-offers after its channel closed.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Capacity of the recent-signal dedup cache (evicted oldest-first).
pub const SIGNAL_DEDUP_CAPACITY: usize = 100;

// ── Relay ────────────────────────────────────────────────────────────────────

/// Default signaling relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8081/ws";

/// Maximum consecutive relay reconnect attempts.
pub const RELAY_MAX_RECONNECTS: u32 = 5;

/// Cap for the exponential relay reconnect delay.
pub const RELAY_MAX_BACKOFF: Duration = Duration::from_secs(30);

// ── Policy ───────────────────────────────────────────────────────────────────

/// Deployment-tunable transfer heuristics.
///
/// Defaults come from the constants above; every field can be overridden
/// in the `[policy]` table of `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferPolicy {
    pub small_file_threshold: u64,
    pub small_file_chunk_size: usize,
    pub chunk_size: usize,
    pub buffered_amount_high: usize,
    #[serde(with = "millis")]
    pub inter_chunk_delay: Duration,
    #[serde(with = "millis")]
    pub accept_window: Duration,
    /// Stream large receives to disk instead of memory.
    pub stream_to_disk: bool,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            small_file_threshold: SMALL_FILE_THRESHOLD,
            small_file_chunk_size: SMALL_FILE_CHUNK_SIZE,
            chunk_size: CHUNK_SIZE,
            buffered_amount_high: DC_BUFFERED_AMOUNT_HIGH,
            inter_chunk_delay: INTER_CHUNK_DELAY,
            accept_window: ACCEPT_WINDOW,
            stream_to_disk: true,
        }
    }
}

impl TransferPolicy {
    /// Chunk size for a file of `file_size` bytes.
    pub fn chunk_size_for(&self, file_size: u64) -> usize {
        if file_size < self.small_file_threshold {
            self.small_file_chunk_size.min(self.chunk_size)
        } else {
            self.chunk_size
        }
    }

    pub fn is_small(&self, file_size: u64) -> bool {
        file_size < self.small_file_threshold
    }
}

/// Number of `chunk_size` chunks covering `file_size` bytes, or `None`
/// past [`MAX_TOTAL_CHUNKS`].
#[inline]
pub fn total_chunks(file_size: u64, chunk_size: usize) -> Option<u32> {
    let count = file_size.div_ceil(chunk_size.max(1) as u64);
    u32::try_from(count).ok().filter(|&c| c <= MAX_TOTAL_CHUNKS)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
