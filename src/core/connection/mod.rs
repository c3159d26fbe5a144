//! Peer connectivity: transport seams, signaling decisions and the
//! WebRTC link manager.

pub mod channel;
pub mod manager;
pub mod signaling;

pub use channel::{PeerChannel, PeerTransport, WebRtcChannel};
pub use manager::PeerManager;

use crate::core::protocol::{ChunkFrame, ControlEnvelope};

/// Something that happened on a peer's data channel.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    ChannelOpen {
        peer_id: String,
    },
    ChannelClosed {
        peer_id: String,
    },
    Control {
        peer_id: String,
        envelope: ControlEnvelope,
    },
    Chunk {
        peer_id: String,
        frame: ChunkFrame,
    },
}
