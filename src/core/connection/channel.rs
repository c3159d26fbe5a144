//! Transport seams between the transfer pipeline and the peer links.
//!
//! The pipeline only ever sees [`PeerTransport`] and [`PeerChannel`];
//! the WebRTC implementation lives in [`super::manager`], and tests plug
//! in an in-memory loopback.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

use crate::core::error::TransferError;
use crate::core::protocol::ControlEnvelope;

/// One reliable ordered message channel to a single peer.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Bytes queued in the channel's send buffer.
    async fn buffered_amount(&self) -> usize;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;
}

/// Access to per-peer channels, keyed by peer id.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Make sure a link to `peer_id` exists, initiating one if needed.
    async fn open(&self, peer_id: &str) -> Result<()>;

    /// Current channel to `peer_id`, open or not.
    async fn channel(&self, peer_id: &str) -> Option<Arc<dyn PeerChannel>>;

    /// Poll until the channel to `peer_id` is open.
    async fn wait_open(
        &self,
        peer_id: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn PeerChannel>, TransferError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ch) = self.channel(peer_id).await {
                if ch.is_open() {
                    return Ok(ch);
                }
            }
            if Instant::now() >= deadline {
                warn!(event = "channel_open_timeout", peer_id, "Data channel did not open in time");
                return Err(TransferError::not_ready(peer_id));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Send one control envelope. Fails fast if the channel is not open.
    async fn send_control(&self, peer_id: &str, env: &ControlEnvelope) -> Result<(), TransferError> {
        let ch = match self.channel(peer_id).await {
            Some(ch) if ch.is_open() => ch,
            _ => return Err(TransferError::not_ready(peer_id)),
        };
        let text = env
            .to_json()
            .map_err(|e| TransferError::signaling(peer_id, format!("encode control: {e}")))?;
        ch.send_text(text).await.map_err(|e| {
            debug!(event = "control_send_failed", peer_id, error = %e, "Control message send failed");
            TransferError::not_ready(peer_id)
        })
    }
}

/// [`PeerChannel`] over a WebRTC data channel.
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self { dc }
    }
}

#[async_trait]
impl PeerChannel for WebRtcChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("data channel not open: {:?}", self.dc.ready_state()));
        }
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("data channel not open: {:?}", self.dc.ready_state()));
        }
        self.dc.send(&data).await?;
        Ok(())
    }
}
