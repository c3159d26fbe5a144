//! WebRTC peer links: one `RTCPeerConnection` plus one ordered data
//! channel per remote peer.
//!
//! Signals arrive from the relay through [`PeerManager::handle_signal`]
//! and leave through the `signal_tx` channel. Everything observed on the
//! data channels is forwarded as [`PeerEvent`]s, except heartbeats which
//! are consumed here. When a channel closes, the side that initiated the
//! link re-offers after [`RECONNECT_DELAY`].

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::PeerEvent;
use super::channel::{PeerChannel, PeerTransport, WebRtcChannel};
use super::signaling::{
    ChannelHealth, LinkSnapshot, SignalAction, SignalDedup, SupervisionAction, decide_after_close,
    decide_signal, decide_supervision,
};
use crate::core::config::{
    DATA_CHANNEL_LABEL, HEARTBEAT_INTERVAL, RECONNECT_DELAY, SCTP_MAX_MESSAGE_SIZE, STUN_SERVER,
    SUPERVISION_INTERVAL,
};
use crate::core::protocol::{
    ControlEnvelope, Heartbeat, Inbound, Signal, SignalEnvelope, SignalKind, classify_message,
};
use crate::utils::sos::SignalOfStop;

struct PeerLink {
    pc: Arc<RTCPeerConnection>,
    channel: Option<Arc<RTCDataChannel>>,
    /// We sent the first offer on this link.
    initiator: bool,
    /// Distinguishes this link from a replaced one in late callbacks.
    generation: u64,
    pending_candidates: Vec<RTCIceCandidateInit>,
    /// Unix milliseconds of the last heartbeat received.
    last_heartbeat: Option<i64>,
}

impl PeerLink {
    fn channel_health(&self) -> ChannelHealth {
        match self.channel.as_ref().map(|dc| dc.ready_state()) {
            None => ChannelHealth::Missing,
            Some(RTCDataChannelState::Open) => ChannelHealth::Open,
            Some(RTCDataChannelState::Closing | RTCDataChannelState::Closed) => {
                ChannelHealth::Closed
            }
            Some(_) => ChannelHealth::Connecting,
        }
    }

    async fn snapshot(&self) -> LinkSnapshot {
        let signaling = self.pc.signaling_state();
        LinkSnapshot {
            signaling,
            has_remote_description: self.pc.remote_description().await.is_some(),
            closed: signaling == RTCSignalingState::Closed
                || self.pc.connection_state() == RTCPeerConnectionState::Closed,
        }
    }
}

struct Inner {
    api: API,
    links: Mutex<HashMap<String, PeerLink>>,
    dedup: Mutex<SignalDedup>,
    generation: AtomicU64,
    signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    sos: SignalOfStop,
}

/// Cloneable handle to all peer links.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

fn build_api() -> Result<API> {
    let mut me = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut me)?;
    let mut se = SettingEngine::default();
    se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));
    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(registry)
        .build())
}

/// Advertise our SCTP message limit so the remote side may send framed
/// 64 KB chunks; the default without the attribute is 64 KB flat.
fn advertise_max_message_size(mut desc: RTCSessionDescription) -> RTCSessionDescription {
    if !desc.sdp.contains("a=max-message-size:") {
        desc.sdp
            .push_str(&format!("a=max-message-size:{SCTP_MAX_MESSAGE_SIZE}\r\n"));
    }
    desc
}

fn ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![STUN_SERVER.into()],
        ..Default::default()
    }]
}

impl PeerManager {
    pub fn new(
        signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
        sos: SignalOfStop,
    ) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                api: build_api().context("building WebRTC API")?,
                links: Mutex::new(HashMap::new()),
                dedup: Mutex::new(SignalDedup::default()),
                generation: AtomicU64::new(0),
                signal_tx,
                events_tx,
                sos,
            }),
        })
    }

    /// Peers that currently have a link.
    pub async fn peers(&self) -> Vec<String> {
        self.inner.links.lock().await.keys().cloned().collect()
    }

    /// Initiate a link to `peer_id` unless a usable one exists.
    pub async fn connect(&self, peer_id: &str) -> Result<()> {
        {
            let links = self.inner.links.lock().await;
            if let Some(link) = links.get(peer_id) {
                let state = link.pc.connection_state();
                if !matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    return Ok(());
                }
            }
        }
        self.close(peer_id).await;

        let pc = self.new_link(peer_id, true).await?;
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        self.attach_channel(peer_id, dc).await;

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        info!(event = "offer_sent", peer_id, "Sending offer");
        self.emit_signal(peer_id, Signal::Description(advertise_max_message_size(offer)));
        Ok(())
    }

    /// Tear down the link to `peer_id`, if any.
    pub async fn close(&self, peer_id: &str) {
        let link = self.inner.links.lock().await.remove(peer_id);
        if let Some(link) = link {
            if let Err(e) = link.pc.close().await {
                debug!(event = "peer_close_error", peer_id, error = %e, "Error closing peer connection");
            }
            info!(event = "peer_closed", peer_id, "Peer link closed");
        }
    }

    pub async fn close_all(&self) {
        for peer_id in self.peers().await {
            self.close(&peer_id).await;
        }
    }

    /// Apply one inbound signal. Replays, out-of-state descriptions and
    /// undeliverable candidates are logged and dropped.
    pub async fn handle_signal(&self, env: SignalEnvelope) {
        let peer_id = env.from_id.clone();
        if peer_id.is_empty() {
            warn!(event = "signal_without_sender", "Dropping signal with no sender id");
            return;
        }
        let kind = env.signal.kind();

        let key = match serde_json::to_vec(&env.signal) {
            Ok(raw) => SignalDedup::key(&peer_id, kind, &raw),
            Err(e) => {
                warn!(event = "signal_encode_failed", peer_id, error = %e, "Dropping unencodable signal");
                return;
            }
        };
        if !self.inner.dedup.lock().await.insert(key) {
            debug!(event = "signal_duplicate", peer_id, kind = kind.as_str(), "Duplicate signal ignored");
            return;
        }

        if let Err(e) = self.apply_signal(&peer_id, env.signal).await {
            warn!(event = "signal_failed", peer_id, kind = kind.as_str(), error = %e, "Failed to apply signal");
        }
    }

    async fn apply_signal(&self, peer_id: &str, signal: Signal) -> Result<()> {
        let kind = signal.kind();
        let has_link = self.inner.links.lock().await.contains_key(peer_id);
        if !has_link {
            if matches!(kind, SignalKind::Answer | SignalKind::Unsupported) {
                debug!(event = "signal_dropped", peer_id, kind = kind.as_str(), reason = "no link", "Signal dropped");
                return Ok(());
            }
            self.new_link(peer_id, false).await?;
        }

        let (pc, snapshot) = {
            let links = self.inner.links.lock().await;
            let link = links
                .get(peer_id)
                .ok_or_else(|| anyhow!("link vanished"))?;
            (link.pc.clone(), link.snapshot().await)
        };

        match (decide_signal(kind, snapshot), signal) {
            (SignalAction::ApplyOffer, Signal::Description(offer)) => {
                pc.set_remote_description(offer).await?;
                self.flush_candidates(peer_id, &pc).await;
                let answer = pc.create_answer(None).await?;
                pc.set_local_description(answer.clone()).await?;
                info!(event = "answer_sent", peer_id, "Answering offer");
                self.emit_signal(peer_id, Signal::Description(advertise_max_message_size(answer)));
            }
            (SignalAction::ApplyAnswer, Signal::Description(answer)) => {
                pc.set_remote_description(answer).await?;
                self.flush_candidates(peer_id, &pc).await;
                info!(event = "answer_applied", peer_id, "Remote answer applied");
            }
            (SignalAction::ApplyCandidate, Signal::Candidate(c)) => {
                pc.add_ice_candidate(c).await?;
            }
            (SignalAction::QueueCandidate, Signal::Candidate(c)) => {
                if let Some(link) = self.inner.links.lock().await.get_mut(peer_id) {
                    link.pending_candidates.push(c);
                    debug!(event = "candidate_queued", peer_id, queued = link.pending_candidates.len(), "Candidate queued");
                }
            }
            (SignalAction::Drop(reason), _) => {
                debug!(event = "signal_dropped", peer_id, kind = kind.as_str(), reason, "Signal dropped");
            }
            (action, _) => {
                return Err(anyhow!("action {action:?} does not match signal {}", kind.as_str()));
            }
        }
        Ok(())
    }

    async fn flush_candidates(&self, peer_id: &str, pc: &Arc<RTCPeerConnection>) {
        let pending = match self.inner.links.lock().await.get_mut(peer_id) {
            Some(link) => std::mem::take(&mut link.pending_candidates),
            None => return,
        };
        if pending.is_empty() {
            return;
        }
        debug!(event = "candidates_flushed", peer_id, count = pending.len(), "Applying queued candidates");
        for c in pending {
            if let Err(e) = pc.add_ice_candidate(c).await {
                warn!(event = "candidate_failed", peer_id, error = %e, "Queued candidate rejected");
            }
        }
    }

    fn emit_signal(&self, peer_id: &str, signal: Signal) {
        let env = SignalEnvelope {
            from_id: String::new(),
            to_id: peer_id.to_string(),
            signal,
        };
        if self.inner.signal_tx.send(env).is_err() {
            warn!(event = "signal_sink_closed", peer_id, "Signal sink closed, signal lost");
        }
    }

    // ── Link construction ────────────────────────────────────────────────

    async fn new_link(&self, peer_id: &str, initiator: bool) -> Result<Arc<RTCPeerConnection>> {
        let pc = Arc::new(
            self.inner
                .api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: ice_servers(),
                    ..Default::default()
                })
                .await?,
        );
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let weak = Arc::downgrade(&self.inner);
        let pid = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            let pid = pid.clone();
            Box::pin(async move {
                let (Some(c), Some(inner)) = (c, weak.upgrade()) else {
                    return;
                };
                match c.to_json() {
                    Ok(init) => PeerManager { inner }.emit_signal(&pid, Signal::Candidate(init)),
                    Err(e) => warn!(event = "candidate_encode_failed", peer_id = %pid, error = %e, "Local candidate dropped"),
                }
            })
        }));

        let pid = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let pid = pid.clone();
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", peer_id = %pid, "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", peer_id = %pid, "WebRTC connection failed");
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", peer_id = %pid, "WebRTC transient disconnect (ICE may recover)");
                    }
                    _ => debug!(event = "webrtc_state", peer_id = %pid, state = %s, "Connection state changed"),
                }
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        let pid = peer_id.to_string();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            let pid = pid.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if dc.label() != DATA_CHANNEL_LABEL {
                    warn!(event = "unexpected_channel", peer_id = %pid, label = %dc.label(), "Ignoring unexpected data channel");
                    return;
                }
                let manager = PeerManager { inner };
                if manager.link_generation(&pid).await == Some(generation) {
                    manager.attach_channel(&pid, dc).await;
                }
            })
        }));

        let displaced = self.inner.links.lock().await.insert(
            peer_id.to_string(),
            PeerLink {
                pc: pc.clone(),
                channel: None,
                initiator,
                generation,
                pending_candidates: Vec::new(),
                last_heartbeat: None,
            },
        );
        debug!(event = "peer_link_created", peer_id, initiator, generation, "Peer link created");
        // A local connect and an inbound offer raced; the older link loses.
        if let Some(old) = displaced {
            warn!(
                event = "peer_link_replaced",
                peer_id,
                old_generation = old.generation,
                generation,
                "Closing displaced peer link"
            );
            if let Err(e) = old.pc.close().await {
                debug!(event = "peer_close_error", peer_id, error = %e, "Error closing peer connection");
            }
        }
        Ok(pc)
    }

    async fn link_generation(&self, peer_id: &str) -> Option<u64> {
        self.inner.links.lock().await.get(peer_id).map(|l| l.generation)
    }

    /// Install `dc` as the link's channel and wire its callbacks.
    async fn attach_channel(&self, peer_id: &str, dc: Arc<RTCDataChannel>) {
        let generation = self.link_generation(peer_id).await;
        let weak = Arc::downgrade(&self.inner);
        let pid = peer_id.to_string();
        let dc_ref = dc.clone();
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            let pid = pid.clone();
            let dc = dc_ref.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                info!(event = "dc_open", peer_id = %pid, "Data channel open");
                let _ = inner.events_tx.send(PeerEvent::ChannelOpen {
                    peer_id: pid.clone(),
                });
                tokio::spawn(heartbeat_loop(pid, dc, inner.sos.clone(), HEARTBEAT_INTERVAL));
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        let pid = peer_id.to_string();
        let closed = Arc::downgrade(&dc);
        dc.on_close(Box::new(move || {
            let weak = weak.clone();
            let pid = pid.clone();
            let closed = closed.clone();
            Box::pin(async move {
                warn!(event = "dc_closed", peer_id = %pid, "Data channel closed by transport");
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let _ = inner.events_tx.send(PeerEvent::ChannelClosed {
                    peer_id: pid.clone(),
                });
                if let Some(generation) = generation {
                    PeerManager { inner }.spawn_repair_after_close(pid, generation, closed);
                }
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        let pid = peer_id.to_string();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let weak = weak.clone();
            let pid = pid.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    dispatch_message(&inner, &pid, msg).await;
                }
            })
        }));

        if let Some(link) = self.inner.links.lock().await.get_mut(peer_id) {
            link.channel = Some(dc);
        }
    }

    // ── Supervision ──────────────────────────────────────────────────────

    /// Inspect every link each [`SUPERVISION_INTERVAL`] and repair what
    /// broke. Returns when `sos` is cancelled.
    pub async fn supervise(&self) {
        loop {
            if !self.inner.sos.sleep(SUPERVISION_INTERVAL).await {
                break;
            }
            let actions: Vec<(String, SupervisionAction, Option<i64>)> = {
                let links = self.inner.links.lock().await;
                links
                    .iter()
                    .filter_map(|(peer_id, link)| {
                        decide_supervision(
                            link.pc.connection_state(),
                            link.channel_health(),
                            link.initiator,
                        )
                        .map(|a| (peer_id.clone(), a, link.last_heartbeat))
                    })
                    .collect()
            };
            for (peer_id, action, last_heartbeat) in actions {
                info!(event = "supervision_action", peer_id, ?action, ?last_heartbeat, "Repairing peer link");
                match action {
                    SupervisionAction::Restart => {
                        self.close(&peer_id).await;
                        let manager = self.clone();
                        tokio::spawn(async move {
                            if !manager.inner.sos.sleep(RECONNECT_DELAY).await {
                                return;
                            }
                            if let Err(e) = manager.connect(&peer_id).await {
                                warn!(event = "reconnect_failed", peer_id, error = %e, "Reconnect failed");
                            }
                        });
                    }
                    SupervisionAction::RecreateChannel => {
                        if let Err(e) = self.recreate_channel(&peer_id).await {
                            warn!(event = "channel_recreate_failed", peer_id, error = %e, "Could not recreate data channel");
                        }
                    }
                    SupervisionAction::Teardown => self.close(&peer_id).await,
                }
            }
        }
        debug!(event = "supervisor_stopped", "Peer supervisor stopped");
    }

    fn spawn_repair_after_close(self, peer_id: String, generation: u64, closed: Weak<RTCDataChannel>) {
        // Boxed: a repair attaches new channels, whose close callbacks land here again.
        let task: Pin<Box<dyn Future<Output = ()> + Send>> =
            Box::pin(self.repair_after_close(peer_id, generation, closed));
        tokio::spawn(task);
    }

    /// Wait [`RECONNECT_DELAY`] after `closed` went down, then repair the
    /// link if it is still the one (and the channel) that closed.
    async fn repair_after_close(self, peer_id: String, generation: u64, closed: Weak<RTCDataChannel>) {
        if !self.inner.sos.sleep(RECONNECT_DELAY).await {
            return;
        }
        let action = {
            let links = self.inner.links.lock().await;
            let Some(link) = links.get(&peer_id) else {
                return;
            };
            let still_current = link.generation == generation
                && link
                    .channel
                    .as_ref()
                    .is_some_and(|dc| Weak::ptr_eq(&Arc::downgrade(dc), &closed));
            decide_after_close(
                link.pc.connection_state(),
                link.channel_health(),
                link.initiator,
                still_current,
            )
        };
        let Some(action) = action else {
            return;
        };
        info!(event = "reconnect_after_close", peer_id, ?action, "Repairing link after channel close");
        let result = match action {
            SupervisionAction::RecreateChannel => self.recreate_channel(&peer_id).await,
            SupervisionAction::Restart => {
                self.close(&peer_id).await;
                self.connect(&peer_id).await
            }
            SupervisionAction::Teardown => {
                self.close(&peer_id).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(event = "reconnect_failed", peer_id, error = %e, "Reconnect failed");
        }
    }

    async fn recreate_channel(&self, peer_id: &str) -> Result<()> {
        let pc = self
            .inner
            .links
            .lock()
            .await
            .get(peer_id)
            .map(|l| l.pc.clone())
            .ok_or_else(|| anyhow!("no link"))?;
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        self.attach_channel(peer_id, dc).await;
        Ok(())
    }
}

async fn dispatch_message(inner: &Inner, peer_id: &str, msg: DataChannelMessage) {
    let event = match classify_message(peer_id, msg.is_string, msg.data) {
        Some(Inbound::Control(ControlEnvelope::Heartbeat(hb))) => {
            if let Some(link) = inner.links.lock().await.get_mut(peer_id) {
                link.last_heartbeat = Some(hb.timestamp);
            }
            debug!(event = "heartbeat_received", peer_id, timestamp = hb.timestamp, "Heartbeat");
            return;
        }
        Some(Inbound::Control(envelope)) => PeerEvent::Control {
            peer_id: peer_id.to_string(),
            envelope,
        },
        Some(Inbound::Chunk(frame)) => PeerEvent::Chunk {
            peer_id: peer_id.to_string(),
            frame,
        },
        None => return,
    };
    if inner.events_tx.send(event).is_err() {
        debug!(event = "event_sink_closed", peer_id, "Peer event dropped");
    }
}

/// Send a heartbeat every `period` while the channel is open.
async fn heartbeat_loop(peer_id: String, dc: Arc<RTCDataChannel>, sos: SignalOfStop, period: Duration) {
    while sos.sleep(period).await {
        if dc.ready_state() != RTCDataChannelState::Open {
            break;
        }
        let text = match ControlEnvelope::Heartbeat(Heartbeat::now()).to_json() {
            Ok(t) => t,
            Err(_) => break,
        };
        if let Err(e) = dc.send_text(text).await {
            debug!(event = "heartbeat_send_failed", peer_id, error = %e, "Heartbeat not sent");
            break;
        }
    }
    debug!(event = "heartbeat_stopped", peer_id, "Heartbeat loop ended");
}

#[async_trait]
impl PeerTransport for PeerManager {
    async fn open(&self, peer_id: &str) -> Result<()> {
        self.connect(peer_id).await
    }

    async fn channel(&self, peer_id: &str) -> Option<Arc<dyn PeerChannel>> {
        let links = self.inner.links.lock().await;
        let dc = links.get(peer_id)?.channel.clone()?;
        Some(Arc::new(WebRtcChannel::new(dc)))
    }
}
