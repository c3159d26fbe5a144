//! Signaling state machine decisions, supervision decisions, and the
//! recent-signal dedup cache.
//!
//! Everything here is pure: the manager feeds in the current peer
//! connection state and executes the returned action. This keeps the
//! offer/answer/ICE guards testable without a network.

use std::collections::{HashSet, VecDeque};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::core::config::SIGNAL_DEDUP_CAPACITY;
use crate::core::protocol::SignalKind;
use crate::utils::hash::fingerprint;

// ── Signaling ─────────────────────────────────────────────────────────────────

/// What to do with an inbound signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Set remote offer, answer it.
    ApplyOffer,
    /// Set remote answer.
    ApplyAnswer,
    /// Add the candidate now.
    ApplyCandidate,
    /// Hold the candidate until a remote description exists.
    QueueCandidate,
    /// Ignore, with the reason for the log line.
    Drop(&'static str),
}

/// Snapshot of the link state relevant to signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub signaling: RTCSignalingState,
    pub has_remote_description: bool,
    pub closed: bool,
}

pub fn decide_signal(kind: SignalKind, link: LinkSnapshot) -> SignalAction {
    if link.closed {
        return SignalAction::Drop("link closed");
    }
    match kind {
        SignalKind::Offer => {
            if link.signaling == RTCSignalingState::Stable {
                SignalAction::ApplyOffer
            } else {
                SignalAction::Drop("offer while not stable")
            }
        }
        SignalKind::Answer => {
            if link.signaling == RTCSignalingState::HaveLocalOffer && !link.has_remote_description {
                SignalAction::ApplyAnswer
            } else {
                SignalAction::Drop("answer without pending local offer")
            }
        }
        SignalKind::Candidate => {
            if link.has_remote_description {
                SignalAction::ApplyCandidate
            } else {
                SignalAction::QueueCandidate
            }
        }
        SignalKind::Unsupported => SignalAction::Drop("unsupported description type"),
    }
}

// ── Supervision ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    Missing,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionAction {
    /// Tear the link down and send a fresh offer.
    Restart,
    /// Keep the connection, recreate the data channel.
    RecreateChannel,
    /// Tear the link down and wait for the remote side to re-offer.
    Teardown,
}

/// One corrective action per tick at most. Only the initiator re-offers.
pub fn decide_supervision(
    connection: RTCPeerConnectionState,
    channel: ChannelHealth,
    is_initiator: bool,
) -> Option<SupervisionAction> {
    match connection {
        RTCPeerConnectionState::Failed if is_initiator => Some(SupervisionAction::Restart),
        RTCPeerConnectionState::Failed => Some(SupervisionAction::Teardown),
        RTCPeerConnectionState::Connected
            if channel == ChannelHealth::Closed && is_initiator =>
        {
            Some(SupervisionAction::RecreateChannel)
        }
        _ => None,
    }
}

/// Repair for a link whose data channel closed under us, decided after
/// [`RECONNECT_DELAY`](crate::core::config::RECONNECT_DELAY). Only the
/// initiator acts, and only while the closed channel is still the link's
/// current one.
pub fn decide_after_close(
    connection: RTCPeerConnectionState,
    channel: ChannelHealth,
    is_initiator: bool,
    still_current: bool,
) -> Option<SupervisionAction> {
    if !is_initiator || !still_current || channel == ChannelHealth::Open {
        return None;
    }
    match connection {
        RTCPeerConnectionState::Connected => Some(SupervisionAction::RecreateChannel),
        _ => Some(SupervisionAction::Restart),
    }
}

// ── Dedup ─────────────────────────────────────────────────────────────────────

/// Bounded set of recently seen signals, evicted oldest-first.
pub struct SignalDedup {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for SignalDedup {
    fn default() -> Self {
        Self::with_capacity(SIGNAL_DEDUP_CAPACITY)
    }
}

impl SignalDedup {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity + 1),
            order: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Dedup key: peer + signal type + content fingerprint.
    pub fn key(peer_id: &str, kind: SignalKind, payload: &[u8]) -> String {
        format!("{peer_id}:{}:{}", kind.as_str(), fingerprint(payload))
    }

    /// Record `key`. Returns `false` if it was already seen (a replay).
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}
