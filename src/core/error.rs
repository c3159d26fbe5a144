//! Transfer error taxonomy.
//!
//! Only [`TransferError::ChannelNotReady`] (after retries are exhausted)
//! and [`TransferError::Finalize`] ever reach user-visible Transfer state.
//! Everything else is logged and recovered locally.

use thiserror::Error;

/// Why a binary chunk frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameDecodeError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid file id length {0}")]
    InvalidIdLength(u32),
    #[error("file id length {id_len} exceeds frame of {frame_len} bytes")]
    Truncated { id_len: u32, frame_len: usize },
    #[error("file id is not valid UTF-8")]
    InvalidUtf8,
    #[error("file id is empty")]
    EmptyId,
}

/// Errors raised by the transfer engine.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Malformed or out-of-state signaling message. Dropped, never fatal.
    #[error("signaling error from {peer_id}: {reason}")]
    Signaling { peer_id: String, reason: String },

    /// Send attempted on a channel that is not open.
    #[error("data channel to {peer_id} not ready")]
    ChannelNotReady { peer_id: String },

    /// Malformed binary frame.
    #[error("frame decode error: {0}")]
    FrameDecode(#[from] FrameDecodeError),

    /// Chunk index outside `0..total_chunks` or an empty payload.
    #[error("chunk {index} rejected for {file_id}: {reason}")]
    ChunkIndex {
        file_id: String,
        index: u32,
        reason: &'static str,
    },

    /// Assembly or disk-flush failure on the receiving side.
    #[error("finalize failed for {file_id}: {source}")]
    Finalize {
        file_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl TransferError {
    pub fn not_ready(peer_id: impl Into<String>) -> Self {
        Self::ChannelNotReady {
            peer_id: peer_id.into(),
        }
    }

    pub fn signaling(peer_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Signaling {
            peer_id: peer_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error must flip the Transfer to `failed`.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::ChannelNotReady { .. } | Self::Finalize { .. })
    }
}
