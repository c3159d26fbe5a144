//! Data channel wire protocol.
//!
//! Text messages are JSON [`ControlEnvelope`]s; binary messages are always
//! [`ChunkFrame`]s. [`classify_message`] is the single place where raw
//! channel messages are split into the two kinds.

pub mod frame;
pub mod messages;

use bytes::Bytes;
use tracing::warn;

pub use frame::{ChunkFrame, decode_chunk_frame, encode_chunk_frame};
pub use messages::{
    ControlEnvelope, FileTransferRequest, FileTransferResponse, Heartbeat, Signal,
    SignalEnvelope, SignalKind, TransferControl,
};

/// A decoded inbound data channel message.
#[derive(Debug, Clone)]
pub enum Inbound {
    Control(ControlEnvelope),
    Chunk(ChunkFrame),
}

/// Decode a raw data channel message. Malformed input is logged and
/// dropped (`None`); it never surfaces as an error to the transport.
pub fn classify_message(peer_id: &str, is_string: bool, data: Bytes) -> Option<Inbound> {
    if is_string {
        let text = match std::str::from_utf8(&data) {
            Ok(t) => t,
            Err(e) => {
                warn!(event = "control_not_utf8", peer_id, error = %e, "Dropping non UTF-8 text message");
                return None;
            }
        };
        match ControlEnvelope::from_json(text) {
            Ok(env) => Some(Inbound::Control(env)),
            Err(e) => {
                warn!(event = "control_decode_failed", peer_id, bytes = data.len(), error = %e, "Dropping malformed control message");
                None
            }
        }
    } else {
        match decode_chunk_frame(&data) {
            Ok(frame) => Some(Inbound::Chunk(frame)),
            Err(e) => {
                warn!(event = "frame_decode_failed", peer_id, bytes = data.len(), error = %e, "Dropping malformed chunk frame");
                None
            }
        }
    }
}
