//! Protocol types: JSON control envelopes and signaling envelopes.
//!
//! Control envelopes travel as UTF-8 text on the data channel and are
//! shaped `{"type": ..., "payload": {...}}`. Signaling envelopes travel
//! over the external relay and carry an SDP description or an ICE
//! candidate for one peer.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

// ── Control messages ──────────────────────────────────────────────────────────

/// Every text message exchanged on a data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlEnvelope {
    FileTransferRequest(FileTransferRequest),
    FileTransferResponse(FileTransferResponse),
    ControlMessage(TransferControl),
    Heartbeat(Heartbeat),
}

/// Sender → receiver: announce a file before any chunk flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferRequest {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub chunk_size: u32,
    /// Filled in by the receiving side with the channel's peer id.
    #[serde(default)]
    pub from_id: String,
}

/// Receiver → sender: accept or reject a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferResponse {
    pub file_id: String,
    pub accept: bool,
    #[serde(default)]
    pub from_id: String,
}

/// Peer-coordinated transfer control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferControl {
    PauseTransfer {
        #[serde(rename = "fileId")]
        file_id: String,
    },
    ResumeTransfer {
        #[serde(rename = "fileId")]
        file_id: String,
    },
    CancelTransfer {
        #[serde(rename = "fileId")]
        file_id: String,
    },
}

impl TransferControl {
    pub fn file_id(&self) -> &str {
        match self {
            Self::PauseTransfer { file_id }
            | Self::ResumeTransfer { file_id }
            | Self::CancelTransfer { file_id } => file_id,
        }
    }
}

/// Liveness ping. `timestamp` is Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: i64,
}

impl Heartbeat {
    pub fn now() -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl ControlEnvelope {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

// ── Signaling ─────────────────────────────────────────────────────────────────
// Exchanged via the relay during connection establishment, never on the
// data channel.

/// An opaque signal as produced by the peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Signal {
    /// SDP offer or answer (`{"type": "offer"|"answer", "sdp": ...}`).
    Description(RTCSessionDescription),
    /// Trickled ICE candidate (`{"candidate": ..., "sdpMid": ...}`).
    Candidate(RTCIceCandidateInit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    /// Pranswer / rollback: never produced by us, dropped on receipt.
    Unsupported,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "ice-candidate",
            Self::Unsupported => "unsupported",
        }
    }
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Description(desc) => match desc.sdp_type {
                RTCSdpType::Offer => SignalKind::Offer,
                RTCSdpType::Answer => SignalKind::Answer,
                _ => SignalKind::Unsupported,
            },
            Self::Candidate(_) => SignalKind::Candidate,
        }
    }
}

/// Relay payload for a `webrtc_signal` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Set by the relay on delivery.
    #[serde(default)]
    pub from_id: String,
    #[serde(default)]
    pub to_id: String,
    pub signal: Signal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let env = ControlEnvelope::FileTransferRequest(FileTransferRequest {
            file_id: "f1".into(),
            file_name: "a.txt".into(),
            file_size: 10,
            total_chunks: 1,
            chunk_size: 8192,
            from_id: String::new(),
        });
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "file_transfer_request");
        assert_eq!(value["payload"]["fileId"], "f1");
        assert_eq!(value["payload"]["fileName"], "a.txt");
        assert_eq!(value["payload"]["totalChunks"], 1);
        assert_eq!(value["payload"]["chunkSize"], 8192);
    }

    #[test]
    fn test_control_message_wire_shape() {
        let json = r#"{"type":"control_message","payload":{"type":"pause_transfer","fileId":"f9"}}"#;
        let env = ControlEnvelope::from_json(json).unwrap();
        assert_eq!(
            env,
            ControlEnvelope::ControlMessage(TransferControl::PauseTransfer {
                file_id: "f9".into()
            })
        );
        assert_eq!(env.to_json().unwrap(), json);
    }

    #[test]
    fn test_response_without_from_id() {
        let json = r#"{"type":"file_transfer_response","payload":{"fileId":"f","accept":false}}"#;
        let env = ControlEnvelope::from_json(json).unwrap();
        match env {
            ControlEnvelope::FileTransferResponse(r) => {
                assert!(!r.accept);
                assert!(r.from_id.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(ControlEnvelope::from_json(r#"{"type":"file_info","payload":{}}"#).is_err());
    }

    #[test]
    fn test_signal_kinds_parse() {
        let offer: Signal = serde_json::from_str(r#"{"type":"offer","sdp":"v=0\r\n"}"#).unwrap();
        assert_eq!(offer.kind(), SignalKind::Offer);

        let answer: Signal = serde_json::from_str(r#"{"type":"answer","sdp":"v=0\r\n"}"#).unwrap();
        assert_eq!(answer.kind(), SignalKind::Answer);

        let cand: Signal = serde_json::from_str(
            r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
        )
        .unwrap();
        assert_eq!(cand.kind(), SignalKind::Candidate);
    }
}
