//! Transfer service: the single object the UI (or node driver) talks to.
//!
//! Owns the outgoing transfers, the active receivers and the inbound
//! requests awaiting a decision, and is the only writer of the
//! [`TransferRegistry`]. Peer events are fed in by [`TransferService::run`]
//! one at a time; imperative entry points (`send_file`, `accept_transfer`,
//! ...) may be called concurrently from elsewhere.
//!
//! # Outgoing lifecycle
//!
//! ```text
//! send_file ─► connecting ─► request sent ─► waiting_for_approval
//!                                   │ all answered / ACCEPT_WINDOW
//!                                   ▼
//!                     no acceptor: discarded │ else: sending ─► completed
//! ```

use anyhow::{Context, Result, anyhow, bail};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::core::checkpoint::CheckpointStore;
use crate::core::config::{
    DATA_CHANNEL_TIMEOUT, MAX_FILE_SIZE, SCTP_MAX_MESSAGE_SIZE, TransferPolicy, total_chunks,
};
use crate::core::connection::{PeerEvent, PeerTransport};
use crate::core::pipeline::{
    ChunkOutcome, FileReceiver, SendContext, SendControl, SendJob, SendOutcome, run_send_loop,
};
use crate::core::protocol::{
    ChunkFrame, ControlEnvelope, FileTransferRequest, FileTransferResponse, TransferControl,
};
use crate::core::registry::{
    Transfer, TransferDirection, TransferRegistry, TransferStatus, TransferUpdate,
};
use crate::utils::sos::SignalOfStop;

/// Inbound requests kept for late subscribers.
const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Static settings for one service instance.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Our device id, stamped on outgoing requests and responses.
    pub local_id: String,
    pub policy: TransferPolicy,
    pub download_dir: PathBuf,
}

struct Outgoing {
    job: SendJob,
    request: FileTransferRequest,
    responses: HashMap<String, bool>,
    answered: Arc<Notify>,
    /// Set once chunking started; later responses are ignored.
    window_closed: bool,
    control: SendControl,
    running: bool,
}

impl Outgoing {
    fn all_answered(&self) -> bool {
        self.job
            .targets
            .iter()
            .all(|p| self.responses.contains_key(p))
    }
}

struct Incoming {
    receiver: FileReceiver,
    /// The sending peer; chunks from anyone else are dropped.
    peer_id: String,
}

struct Inner {
    options: ServiceOptions,
    registry: TransferRegistry,
    transport: Arc<dyn PeerTransport>,
    checkpoints: Arc<CheckpointStore>,
    outgoing: Mutex<HashMap<String, Outgoing>>,
    incoming: Mutex<HashMap<String, Incoming>>,
    pending: Mutex<HashMap<String, FileTransferRequest>>,
    requests_tx: broadcast::Sender<FileTransferRequest>,
}

/// Cloneable handle; all clones share the same state.
#[derive(Clone)]
pub struct TransferService {
    inner: Arc<Inner>,
}

impl TransferService {
    pub fn new(
        options: ServiceOptions,
        transport: Arc<dyn PeerTransport>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        let (requests_tx, _) = broadcast::channel(REQUEST_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                options,
                registry: TransferRegistry::new(),
                transport,
                checkpoints,
                outgoing: Mutex::new(HashMap::new()),
                incoming: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                requests_tx,
            }),
        }
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.inner.registry
    }

    /// Observable full Transfer list.
    pub fn subscribe_transfers(&self) -> watch::Receiver<Vec<Transfer>> {
        self.inner.registry.subscribe()
    }

    /// Observable stream of inbound requests awaiting accept/reject.
    pub fn subscribe_requests(&self) -> broadcast::Receiver<FileTransferRequest> {
        self.inner.requests_tx.subscribe()
    }

    // ── Event loop ───────────────────────────────────────────────────────

    /// Consume peer events until `sos` is cancelled or the sender is dropped.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<PeerEvent>, sos: SignalOfStop) {
        loop {
            let event = tokio::select! {
                _ = sos.wait() => break,
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            self.handle_peer_event(event).await;
        }
        debug!(event = "transfer_service_stopped", "Transfer service loop ended");
    }

    pub async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::ChannelOpen { peer_id } => {
                debug!(event = "peer_channel_open", peer_id, "Peer channel available");
            }
            PeerEvent::ChannelClosed { peer_id } => {
                info!(event = "peer_channel_closed", peer_id, "Peer channel closed; in-flight sends will retry");
            }
            PeerEvent::Control { peer_id, envelope } => match envelope {
                ControlEnvelope::FileTransferRequest(req) => self.on_request(&peer_id, req).await,
                ControlEnvelope::FileTransferResponse(resp) => self.on_response(&peer_id, resp).await,
                ControlEnvelope::ControlMessage(ctrl) => self.on_control(&peer_id, ctrl).await,
                ControlEnvelope::Heartbeat(hb) => {
                    trace!(event = "heartbeat_ignored", peer_id, timestamp = hb.timestamp, "Heartbeat");
                }
            },
            PeerEvent::Chunk { peer_id, frame } => self.on_chunk(&peer_id, frame).await,
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Start sending `path` to every peer in `targets`. Returns the new
    /// transfer's file id; negotiation continues in the background.
    pub async fn send_file(&self, path: &Path, targets: &[String]) -> Result<String> {
        if targets.is_empty() {
            bail!("no target peers");
        }
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if !meta.is_file() {
            bail!("{} is not a file", path.display());
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;

        let file_size = meta.len();
        let policy = &self.inner.options.policy;
        let chunk_size = policy.chunk_size_for(file_size);
        if file_size > MAX_FILE_SIZE {
            bail!("{} exceeds the {MAX_FILE_SIZE} byte limit", path.display());
        }
        let total = total_chunks(file_size, chunk_size)
            .ok_or_else(|| anyhow!("{} needs too many chunks", path.display()))?;
        let file_id = format!(
            "{}-{}",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        );

        let mut transfer = Transfer::new(
            file_id.clone(),
            file_name.clone(),
            file_size,
            total,
            TransferDirection::Sent,
            TransferStatus::Connecting,
            targets,
        );
        transfer.file_path = Some(path.to_path_buf());
        self.inner.registry.insert(transfer);

        let request = FileTransferRequest {
            file_id: file_id.clone(),
            file_name,
            file_size,
            total_chunks: total,
            chunk_size: chunk_size as u32,
            from_id: self.inner.options.local_id.clone(),
        };
        let job = SendJob {
            file_id: file_id.clone(),
            path: path.to_path_buf(),
            file_size,
            chunk_size,
            total_chunks: total,
            start_chunk: 0,
            targets: targets.to_vec(),
        };
        self.inner.outgoing.lock().await.insert(
            file_id.clone(),
            Outgoing {
                job,
                request,
                responses: HashMap::new(),
                answered: Arc::new(Notify::new()),
                window_closed: false,
                control: SendControl::default(),
                running: false,
            },
        );

        info!(
            event = "send_requested",
            file_id = %file_id,
            bytes = file_size,
            total_chunks = total,
            chunk_size,
            targets = targets.len(),
            "Outgoing transfer created"
        );
        tokio::spawn(self.clone().negotiate(file_id.clone()));
        Ok(file_id)
    }

    /// Open a channel to every target, send the request, wait for answers.
    async fn negotiate(self, file_id: String) {
        let Some((targets, request, answered)) = self
            .inner
            .outgoing
            .lock()
            .await
            .get(&file_id)
            .map(|o| (o.job.targets.clone(), o.request.clone(), o.answered.clone()))
        else {
            return;
        };

        let reached = join_all(targets.iter().map(|peer| self.offer_to(peer, &request))).await;
        for (peer, ok) in targets.iter().zip(reached) {
            if !ok {
                self.record_response(&file_id, peer, false).await;
            }
        }
        self.inner.registry.update(
            &file_id,
            TransferUpdate::status(TransferStatus::WaitingForApproval),
        );

        let window = self.inner.options.policy.accept_window;
        let wait_all = async {
            loop {
                let notified = answered.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let done = match self.inner.outgoing.lock().await.get(&file_id) {
                    Some(o) => o.all_answered(),
                    None => true,
                };
                if done {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(window, wait_all).await.is_err() {
            info!(event = "accept_window_elapsed", file_id = %file_id, "Proceeding with the targets that accepted");
        }

        let (accepted, paused) = {
            let mut outgoing = self.inner.outgoing.lock().await;
            let Some(o) = outgoing.get_mut(&file_id) else {
                return;
            };
            o.window_closed = true;
            let accepted: Vec<String> = o
                .job
                .targets
                .iter()
                .filter(|p| o.responses.get(*p).copied().unwrap_or(false))
                .cloned()
                .collect();
            if accepted.is_empty() {
                outgoing.remove(&file_id);
                (accepted, false)
            } else {
                o.job.targets = accepted.clone();
                (accepted, o.control.is_paused())
            }
        };

        if accepted.is_empty() {
            self.inner.registry.remove(&file_id);
            info!(event = "transfer_declined", file_id = %file_id, "No target accepted; transfer discarded");
            return;
        }

        let status = if paused {
            TransferStatus::Paused
        } else {
            TransferStatus::Sending
        };
        self.inner.registry.update(
            &file_id,
            TransferUpdate::status(status).peers(&accepted),
        );
        self.start_sending(file_id);
    }

    /// Returns `false` if the request could not be delivered.
    async fn offer_to(&self, peer_id: &str, request: &FileTransferRequest) -> bool {
        let transport = &self.inner.transport;
        if let Err(e) = transport.open(peer_id).await {
            warn!(event = "peer_open_failed", peer_id, error = %e, "Could not start peer link");
            return false;
        }
        if let Err(e) = transport.wait_open(peer_id, DATA_CHANNEL_TIMEOUT).await {
            warn!(event = "request_undeliverable", peer_id, file_id = %request.file_id, error = %e, "Target unreachable");
            return false;
        }
        let env = ControlEnvelope::FileTransferRequest(request.clone());
        match transport.send_control(peer_id, &env).await {
            Ok(()) => {
                info!(event = "request_sent", peer_id, file_id = %request.file_id, "Transfer request sent");
                true
            }
            Err(e) => {
                warn!(event = "request_undeliverable", peer_id, file_id = %request.file_id, error = %e, "Request send failed");
                false
            }
        }
    }

    async fn record_response(&self, file_id: &str, peer_id: &str, accept: bool) {
        let mut outgoing = self.inner.outgoing.lock().await;
        let Some(o) = outgoing.get_mut(file_id) else {
            debug!(event = "response_unknown_transfer", file_id, peer_id, "Response for unknown transfer ignored");
            return;
        };
        if o.window_closed {
            info!(event = "response_too_late", file_id, peer_id, accept, "Response after chunking started ignored");
            return;
        }
        if !o.job.targets.iter().any(|p| p == peer_id) {
            warn!(event = "response_from_stranger", file_id, peer_id, "Response from a peer that was not asked");
            return;
        }
        o.responses.insert(peer_id.to_string(), accept);
        if o.all_answered() {
            o.answered.notify_one();
        }
    }

    fn start_sending(&self, file_id: String) {
        tokio::spawn(self.clone().drive_sender(file_id));
    }

    /// Run the send loop, again after a pause that was lifted before the
    /// loop noticed it.
    async fn drive_sender(self, file_id: String) {
        loop {
            let claimed = {
                let mut outgoing = self.inner.outgoing.lock().await;
                match outgoing.get_mut(&file_id) {
                    Some(o) if !o.running => {
                        o.running = true;
                        Some((o.job.clone(), o.control.clone()))
                    }
                    _ => None,
                }
            };
            let Some((mut job, control)) = claimed else {
                return;
            };
            job.start_chunk = self
                .inner
                .checkpoints
                .load(&file_id)
                .await
                .map(|cp| cp.next_chunk())
                .unwrap_or(0);

            let inner = &self.inner;
            let outcome = run_send_loop(
                job,
                SendContext {
                    transport: inner.transport.as_ref(),
                    registry: &inner.registry,
                    checkpoints: &inner.checkpoints,
                    policy: &inner.options.policy,
                    control: &control,
                },
            )
            .await;

            if !self.sender_finished(&file_id, outcome).await {
                return;
            }
        }
    }

    /// Returns `true` when the loop should run again.
    async fn sender_finished(&self, file_id: &str, outcome: SendOutcome) -> bool {
        let mut outgoing = self.inner.outgoing.lock().await;
        match outcome {
            SendOutcome::Paused { .. } => match outgoing.get_mut(file_id) {
                Some(o) => {
                    o.running = false;
                    !o.control.is_paused() && !o.control.is_cancelled()
                }
                None => false,
            },
            SendOutcome::Cancelled => {
                outgoing.remove(file_id);
                drop(outgoing);
                // A chunk in flight during cancel may have re-saved it.
                if let Err(e) = self.inner.checkpoints.clear(file_id).await {
                    warn!(event = "checkpoint_clear_failed", file_id, error = %e, "Checkpoint not cleared");
                }
                false
            }
            SendOutcome::Completed | SendOutcome::Failed(_) => {
                outgoing.remove(file_id);
                false
            }
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────

    async fn on_request(&self, peer_id: &str, mut req: FileTransferRequest) {
        req.from_id = peer_id.to_string();
        if req.file_id.is_empty() || req.chunk_size == 0 || req.chunk_size > SCTP_MAX_MESSAGE_SIZE {
            warn!(event = "request_invalid", peer_id, file_id = %req.file_id, "Malformed transfer request dropped");
            return;
        }
        if req.file_size > MAX_FILE_SIZE {
            warn!(event = "request_too_large", peer_id, file_id = %req.file_id, bytes = req.file_size, "Transfer request over the size limit dropped");
            return;
        }
        if total_chunks(req.file_size, req.chunk_size as usize) != Some(req.total_chunks) {
            warn!(
                event = "request_invalid",
                peer_id,
                file_id = %req.file_id,
                total_chunks = req.total_chunks,
                "Chunk count does not match file size"
            );
            return;
        }
        if self.inner.registry.get(&req.file_id).is_some() {
            debug!(event = "request_duplicate", peer_id, file_id = %req.file_id, "Duplicate transfer request ignored");
            return;
        }

        self.inner.registry.insert(Transfer::new(
            req.file_id.clone(),
            req.file_name.clone(),
            req.file_size,
            req.total_chunks,
            TransferDirection::Received,
            TransferStatus::WaitingForApproval,
            &[peer_id.to_string()],
        ));
        self.inner
            .pending
            .lock()
            .await
            .insert(req.file_id.clone(), req.clone());
        info!(
            event = "request_received",
            peer_id,
            file_id = %req.file_id,
            name = %req.file_name,
            bytes = req.file_size,
            "Inbound transfer request"
        );
        let _ = self.inner.requests_tx.send(req);
    }

    /// Accept a pending inbound request: create its receiver, then tell
    /// the sender to start.
    pub async fn accept_transfer(&self, file_id: &str) -> Result<()> {
        let req = self
            .inner
            .pending
            .lock()
            .await
            .remove(file_id)
            .ok_or_else(|| anyhow!("no pending request {file_id}"))?;

        let receiver = match FileReceiver::new(
            &req,
            &self.inner.options.download_dir,
            &self.inner.options.policy,
            self.inner.registry.clone(),
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                self.inner
                    .registry
                    .update(file_id, TransferUpdate::status(TransferStatus::Failed));
                self.respond(&req.from_id, file_id, false).await;
                return Err(e.context("creating receiver"));
            }
        };

        self.inner.registry.update(
            file_id,
            TransferUpdate::status(TransferStatus::Receiving),
        );
        let empty = req.total_chunks == 0;
        self.inner.incoming.lock().await.insert(
            file_id.to_string(),
            Incoming {
                receiver,
                peer_id: req.from_id.clone(),
            },
        );
        self.respond(&req.from_id, file_id, true).await;
        info!(event = "transfer_accepted", peer_id = %req.from_id, file_id, "Transfer accepted");

        if empty {
            let incoming = self.inner.incoming.lock().await.remove(file_id);
            if let Some(mut incoming) = incoming {
                incoming.receiver.finalize().await?;
            }
        }
        Ok(())
    }

    pub async fn reject_transfer(&self, file_id: &str) -> Result<()> {
        let req = self
            .inner
            .pending
            .lock()
            .await
            .remove(file_id)
            .ok_or_else(|| anyhow!("no pending request {file_id}"))?;
        self.inner.registry.remove(file_id);
        self.respond(&req.from_id, file_id, false).await;
        info!(event = "transfer_rejected", peer_id = %req.from_id, file_id, "Transfer rejected");
        Ok(())
    }

    async fn respond(&self, peer_id: &str, file_id: &str, accept: bool) {
        let env = ControlEnvelope::FileTransferResponse(FileTransferResponse {
            file_id: file_id.to_string(),
            accept,
            from_id: self.inner.options.local_id.clone(),
        });
        if let Err(e) = self.inner.transport.send_control(peer_id, &env).await {
            warn!(event = "response_undeliverable", peer_id, file_id, error = %e, "Could not deliver response");
        }
    }

    async fn on_response(&self, peer_id: &str, resp: FileTransferResponse) {
        debug!(event = "response_received", peer_id, file_id = %resp.file_id, accept = resp.accept, "Transfer response");
        self.record_response(&resp.file_id, peer_id, resp.accept).await;
    }

    async fn on_chunk(&self, peer_id: &str, frame: ChunkFrame) {
        let mut incoming = self.inner.incoming.lock().await;
        let Some(entry) = incoming.get_mut(&frame.file_id) else {
            debug!(event = "chunk_unknown_transfer", peer_id, file_id = %frame.file_id, "Chunk for unknown transfer dropped");
            return;
        };
        if entry.peer_id != peer_id {
            warn!(event = "chunk_from_stranger", peer_id, file_id = %frame.file_id, "Chunk from unexpected peer dropped");
            return;
        }
        trace!(event = "chunk_received", peer_id, file_id = %frame.file_id, chunk_index = frame.chunk_index, "Chunk");

        match entry.receiver.add_chunk(frame.chunk_index, frame.payload).await {
            Ok(ChunkOutcome::Completed(_)) => {
                incoming.remove(&frame.file_id);
            }
            Ok(ChunkOutcome::Stored { .. } | ChunkOutcome::Duplicate) => {}
            Err(e) if e.is_user_visible() => {
                incoming.remove(&frame.file_id);
            }
            // Logged by the receiver; the chunk is dropped.
            Err(_) => {}
        }
    }

    // ── Pause / resume / cancel ──────────────────────────────────────────

    pub async fn pause_transfer(&self, file_id: &str) -> Result<()> {
        let peers = self.set_paused(file_id, true).await?;
        self.notify(&peers, TransferControl::PauseTransfer {
            file_id: file_id.to_string(),
        })
        .await;
        Ok(())
    }

    pub async fn resume_transfer(&self, file_id: &str) -> Result<()> {
        let peers = self.set_paused(file_id, false).await?;
        self.notify(&peers, TransferControl::ResumeTransfer {
            file_id: file_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Flip the pause state locally. Returns the peers to notify.
    async fn set_paused(&self, file_id: &str, paused: bool) -> Result<Vec<String>> {
        let outgoing_peers = {
            let outgoing = self.inner.outgoing.lock().await;
            outgoing.get(file_id).map(|o| {
                if paused {
                    o.control.pause();
                } else {
                    o.control.resume();
                }
                (o.job.targets.clone(), o.running, o.window_closed)
            })
        };

        if let Some((peers, running, window_closed)) = outgoing_peers {
            let status = match (paused, window_closed) {
                (true, _) => TransferStatus::Paused,
                (false, true) => TransferStatus::Sending,
                // Still collecting answers; sending starts when the window closes.
                (false, false) => TransferStatus::WaitingForApproval,
            };
            self.inner.registry.update(
                file_id,
                TransferUpdate::status(status).paused(paused),
            );
            if !paused && window_closed && !running {
                self.start_sending(file_id.to_string());
            }
            info!(event = "send_pause_changed", file_id, paused, "Outgoing transfer pause changed");
            return Ok(peers);
        }

        let sender = self
            .inner
            .incoming
            .lock()
            .await
            .get(file_id)
            .map(|i| i.peer_id.clone());
        if let Some(sender) = sender {
            let status = match paused {
                true => TransferStatus::Paused,
                false => TransferStatus::Receiving,
            };
            self.inner.registry.update(
                file_id,
                TransferUpdate::status(status).paused(paused),
            );
            info!(event = "receive_pause_changed", file_id, paused, "Incoming transfer pause changed");
            return Ok(vec![sender]);
        }

        bail!("no active transfer {file_id}")
    }

    /// Cancel everywhere: stop local work and tell every involved peer.
    pub async fn cancel_transfer(&self, file_id: &str) -> Result<()> {
        let peers = self.cancel_local(file_id).await;
        if peers.is_empty() {
            bail!("no transfer {file_id}");
        }
        self.notify(&peers, TransferControl::CancelTransfer {
            file_id: file_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Tear down every trace of `file_id`. Returns the peers involved.
    async fn cancel_local(&self, file_id: &str) -> Vec<String> {
        let mut peers = Vec::new();

        if let Some(o) = self.inner.outgoing.lock().await.remove(file_id) {
            o.control.cancel();
            o.answered.notify_one();
            peers.extend(o.job.targets);
        }
        if let Err(e) = self.inner.checkpoints.clear(file_id).await {
            warn!(event = "checkpoint_clear_failed", file_id, error = %e, "Checkpoint not cleared");
        }

        let incoming = self.inner.incoming.lock().await.remove(file_id);
        if let Some(incoming) = incoming {
            peers.push(incoming.peer_id);
            incoming.receiver.abort().await;
        }
        if let Some(req) = self.inner.pending.lock().await.remove(file_id) {
            peers.push(req.from_id);
        }

        if let Some(t) = self.inner.registry.retire(file_id, TransferStatus::Cancelled) {
            info!(event = "transfer_cancelled", file_id, name = %t.name, status = ?t.status, "Transfer cancelled");
        }
        peers
    }

    async fn on_control(&self, peer_id: &str, ctrl: TransferControl) {
        let file_id = ctrl.file_id().to_string();
        if !self.involves(&file_id, peer_id).await {
            warn!(event = "control_from_stranger", peer_id, file_id, "Control message for a transfer the peer is not part of");
            return;
        }
        let result = match ctrl {
            TransferControl::PauseTransfer { .. } => self.set_paused(&file_id, true).await.map(drop),
            TransferControl::ResumeTransfer { .. } => self.set_paused(&file_id, false).await.map(drop),
            TransferControl::CancelTransfer { .. } => {
                self.cancel_local(&file_id).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(event = "control_ignored", peer_id, file_id, error = %e, "Remote control message ignored");
        }
    }

    async fn involves(&self, file_id: &str, peer_id: &str) -> bool {
        if let Some(o) = self.inner.outgoing.lock().await.get(file_id) {
            return o.job.targets.iter().any(|p| p == peer_id);
        }
        if let Some(i) = self.inner.incoming.lock().await.get(file_id) {
            return i.peer_id == peer_id;
        }
        if let Some(r) = self.inner.pending.lock().await.get(file_id) {
            return r.from_id == peer_id;
        }
        false
    }

    async fn notify(&self, peers: &[String], ctrl: TransferControl) {
        let env = ControlEnvelope::ControlMessage(ctrl);
        for peer_id in peers {
            if let Err(e) = self.inner.transport.send_control(peer_id, &env).await {
                warn!(event = "control_undeliverable", peer_id = %peer_id, error = %e, "Control message not delivered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::PeerChannel;
    use crate::core::protocol::{Inbound, classify_message, decode_chunk_frame};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    type Switchboard = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<PeerEvent>>>>;
    type SendLog = Arc<StdMutex<Vec<(String, u32)>>>;

    /// Delivers everything sent on it to the remote peer's event queue.
    struct LoopChannel {
        from: String,
        to: mpsc::UnboundedSender<PeerEvent>,
        sends: SendLog,
    }

    #[async_trait]
    impl PeerChannel for LoopChannel {
        fn is_open(&self) -> bool {
            !self.to.is_closed()
        }

        async fn buffered_amount(&self) -> usize {
            0
        }

        async fn send_text(&self, text: String) -> anyhow::Result<()> {
            if let Some(Inbound::Control(envelope)) =
                classify_message(&self.from, true, Bytes::from(text))
            {
                self.to.send(PeerEvent::Control {
                    peer_id: self.from.clone(),
                    envelope,
                })?;
            }
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> anyhow::Result<()> {
            let frame = decode_chunk_frame(&data)?;
            self.sends
                .lock()
                .unwrap()
                .push((frame.file_id.clone(), frame.chunk_index));
            self.to.send(PeerEvent::Chunk {
                peer_id: self.from.clone(),
                frame,
            })?;
            Ok(())
        }
    }

    struct Loopback {
        local_id: String,
        board: Switchboard,
        sends: SendLog,
    }

    #[async_trait]
    impl PeerTransport for Loopback {
        async fn open(&self, _peer_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn channel(&self, peer_id: &str) -> Option<Arc<dyn PeerChannel>> {
            let to = self.board.lock().unwrap().get(peer_id)?.clone();
            Some(Arc::new(LoopChannel {
                from: self.local_id.clone(),
                to,
                sends: self.sends.clone(),
            }))
        }
    }

    struct Node {
        service: TransferService,
        sends: SendLog,
        dir: PathBuf,
        sos: SignalOfStop,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.sos.cancel();
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn policy() -> TransferPolicy {
        TransferPolicy {
            inter_chunk_delay: Duration::ZERO,
            accept_window: Duration::from_secs(5),
            ..TransferPolicy::default()
        }
    }

    fn spawn_node(test: &str, id: &str, board: &Switchboard, policy: TransferPolicy) -> Node {
        let dir = std::env::temp_dir()
            .join("peerdrop_test_service")
            .join(test)
            .join(id);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        board.lock().unwrap().insert(id.to_string(), tx);
        let sends = SendLog::default();
        let transport = Arc::new(Loopback {
            local_id: id.to_string(),
            board: board.clone(),
            sends: sends.clone(),
        });
        let service = TransferService::new(
            ServiceOptions {
                local_id: id.to_string(),
                policy,
                download_dir: dir.join("downloads"),
            },
            transport,
            Arc::new(CheckpointStore::in_memory()),
        );
        let sos = SignalOfStop::new();
        {
            let service = service.clone();
            let sos = sos.clone();
            tokio::spawn(async move { service.run(rx, sos).await });
        }
        Node {
            service,
            sends,
            dir,
            sos,
        }
    }

    fn write_source(node: &Node, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let path = node.dir.join(name);
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        while !cond() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn status(node: &Node, file_id: &str) -> Option<TransferStatus> {
        node.service.registry().get(file_id).map(|t| t.status)
    }

    #[tokio::test]
    async fn test_ten_megabytes_in_160_chunks() {
        let board = Switchboard::default();
        let alice = spawn_node("ten_mb", "alice", &board, policy());
        let bob = spawn_node("ten_mb", "bob", &board, policy());
        let mut requests = bob.service.subscribe_requests();

        let (path, data) = write_source(&alice, "big.bin", 10 * 1024 * 1024);
        let file_id = alice
            .service
            .send_file(&path, &["bob".to_string()])
            .await
            .unwrap();

        let req = requests.recv().await.unwrap();
        assert_eq!(req.file_id, file_id);
        assert_eq!(req.total_chunks, 160);
        assert_eq!(req.chunk_size, 65536);
        assert_eq!(req.from_id, "alice");
        assert_eq!(status(&bob, &file_id), Some(TransferStatus::WaitingForApproval));
        wait_until("alice waits for approval", || {
            status(&alice, &file_id) == Some(TransferStatus::WaitingForApproval)
        })
        .await;

        bob.service.accept_transfer(&file_id).await.unwrap();

        wait_until("bob completes", || status(&bob, &file_id) == Some(TransferStatus::Completed)).await;
        wait_until("alice completes", || status(&alice, &file_id) == Some(TransferStatus::Completed)).await;

        let received = bob.service.registry().get(&file_id).unwrap();
        assert_eq!(received.progress, 1.0);
        assert_eq!(received.received_chunks, 160);
        assert_eq!(std::fs::read(received.file_path.unwrap()).unwrap(), data);

        let sent = alice.service.registry().get(&file_id).unwrap();
        assert_eq!(sent.progress, 1.0);
        assert_eq!(sent.sent_chunks, 160);
        assert_eq!(alice.sends.lock().unwrap().len(), 160);
    }

    #[tokio::test]
    async fn test_one_rejects_one_accepts() {
        let board = Switchboard::default();
        let alice = spawn_node("mixed", "alice", &board, policy());
        let bob = spawn_node("mixed", "bob", &board, policy());
        let carol = spawn_node("mixed", "carol", &board, policy());
        let mut bob_requests = bob.service.subscribe_requests();
        let mut carol_requests = carol.service.subscribe_requests();

        let (path, data) = write_source(&alice, "doc.txt", 20_000);
        let file_id = alice
            .service
            .send_file(&path, &["bob".to_string(), "carol".to_string()])
            .await
            .unwrap();

        assert_eq!(bob_requests.recv().await.unwrap().file_id, file_id);
        assert_eq!(carol_requests.recv().await.unwrap().file_id, file_id);
        bob.service.reject_transfer(&file_id).await.unwrap();
        carol.service.accept_transfer(&file_id).await.unwrap();

        wait_until("alice completes", || status(&alice, &file_id) == Some(TransferStatus::Completed)).await;
        wait_until("carol completes", || status(&carol, &file_id) == Some(TransferStatus::Completed)).await;

        assert_eq!(alice.service.registry().get(&file_id).unwrap().peer_ids, "carol");
        assert!(bob.service.registry().get(&file_id).is_none());
        let saved = carol.service.registry().get(&file_id).unwrap().file_path.unwrap();
        assert_eq!(std::fs::read(saved).unwrap(), data);
        // 20 000 bytes in 8 KB chunks, only to carol.
        assert_eq!(alice.sends.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_all_reject_discards_transfer() {
        let board = Switchboard::default();
        let alice = spawn_node("all_reject", "alice", &board, policy());
        let bob = spawn_node("all_reject", "bob", &board, policy());
        let mut requests = bob.service.subscribe_requests();

        let (path, _) = write_source(&alice, "a.txt", 100);
        let file_id = alice
            .service
            .send_file(&path, &["bob".to_string()])
            .await
            .unwrap();
        requests.recv().await.unwrap();
        bob.service.reject_transfer(&file_id).await.unwrap();

        wait_until("alice discards", || status(&alice, &file_id).is_none()).await;
        assert!(alice.sends.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume_never_resend() {
        let board = Switchboard::default();
        let slow = TransferPolicy {
            chunk_size: 1024,
            small_file_threshold: 0,
            inter_chunk_delay: Duration::from_millis(15),
            ..policy()
        };
        let alice = spawn_node("pause", "alice", &board, slow.clone());
        let bob = spawn_node("pause", "bob", &board, slow);
        let mut requests = bob.service.subscribe_requests();

        let (path, data) = write_source(&alice, "paced.bin", 60 * 1024);
        let file_id = alice
            .service
            .send_file(&path, &["bob".to_string()])
            .await
            .unwrap();
        assert_eq!(requests.recv().await.unwrap().total_chunks, 60);
        bob.service.accept_transfer(&file_id).await.unwrap();

        let sends = alice.sends.clone();
        wait_until("some chunks sent", || sends.lock().unwrap().len() >= 5).await;
        alice.service.pause_transfer(&file_id).await.unwrap();
        assert!(alice.service.registry().get(&file_id).unwrap().is_paused);
        wait_until("bob sees pause", || status(&bob, &file_id) == Some(TransferStatus::Paused)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let at_pause = sends.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sends.lock().unwrap().len(), at_pause, "no sends while paused");
        assert!(at_pause < 60);

        alice.service.resume_transfer(&file_id).await.unwrap();
        wait_until("bob completes", || status(&bob, &file_id) == Some(TransferStatus::Completed)).await;

        let mut indices: Vec<u32> = sends.lock().unwrap().iter().map(|(_, i)| *i).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..60).collect::<Vec<_>>(), "each chunk sent exactly once");
        let saved = bob.service.registry().get(&file_id).unwrap().file_path.unwrap();
        assert_eq!(std::fs::read(saved).unwrap(), data);
    }

    #[tokio::test]
    async fn test_cancel_from_receiver_stops_both_sides() {
        let board = Switchboard::default();
        let slow = TransferPolicy {
            chunk_size: 1024,
            small_file_threshold: 0,
            inter_chunk_delay: Duration::from_millis(10),
            ..policy()
        };
        let alice = spawn_node("cancel", "alice", &board, slow.clone());
        let bob = spawn_node("cancel", "bob", &board, slow);
        let mut requests = bob.service.subscribe_requests();

        let (path, _) = write_source(&alice, "long.bin", 200 * 1024);
        let file_id = alice
            .service
            .send_file(&path, &["bob".to_string()])
            .await
            .unwrap();
        requests.recv().await.unwrap();
        bob.service.accept_transfer(&file_id).await.unwrap();

        let sends = alice.sends.clone();
        wait_until("some chunks sent", || sends.lock().unwrap().len() >= 3).await;
        bob.service.cancel_transfer(&file_id).await.unwrap();

        assert!(bob.service.registry().get(&file_id).is_none());
        wait_until("alice drops transfer", || status(&alice, &file_id).is_none()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = sends.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sends.lock().unwrap().len(), after);
        assert!(after < 200);

        let leftovers = std::fs::read_dir(bob.dir.join("downloads")).unwrap().count();
        assert_eq!(leftovers, 0, "partial temp file removed");
    }

    #[tokio::test]
    async fn test_zero_length_file_completes_both_sides() {
        let board = Switchboard::default();
        let alice = spawn_node("empty", "alice", &board, policy());
        let bob = spawn_node("empty", "bob", &board, policy());
        let mut requests = bob.service.subscribe_requests();

        let (path, _) = write_source(&alice, "empty.txt", 0);
        let file_id = alice
            .service
            .send_file(&path, &["bob".to_string()])
            .await
            .unwrap();
        assert_eq!(requests.recv().await.unwrap().total_chunks, 0);
        bob.service.accept_transfer(&file_id).await.unwrap();

        assert_eq!(status(&bob, &file_id), Some(TransferStatus::Completed));
        wait_until("alice completes", || status(&alice, &file_id) == Some(TransferStatus::Completed)).await;
        let saved = bob.service.registry().get(&file_id).unwrap().file_path.unwrap();
        assert_eq!(std::fs::read(saved).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_chunk_for_unknown_transfer_is_dropped() {
        let board = Switchboard::default();
        let bob = spawn_node("unknown", "bob", &board, policy());
        bob.service
            .handle_peer_event(PeerEvent::Chunk {
                peer_id: "mallory".into(),
                frame: ChunkFrame {
                    file_id: "nope".into(),
                    chunk_index: 0,
                    payload: Bytes::from_static(b"x"),
                },
            })
            .await;
        assert!(bob.service.registry().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_inconsistent_or_oversized_request_is_dropped() {
        let board = Switchboard::default();
        let bob = spawn_node("bad_request", "bob", &board, policy());
        let mut requests = bob.service.subscribe_requests();

        let offer = |file_id: &str, file_size: u64, chunk_size: u32, total_chunks: u32| PeerEvent::Control {
            peer_id: "mallory".into(),
            envelope: ControlEnvelope::FileTransferRequest(FileTransferRequest {
                file_id: file_id.into(),
                file_name: "huge.bin".into(),
                file_size,
                total_chunks,
                chunk_size,
                from_id: String::new(),
            }),
        };
        // Chunk count wraps to 1 when truncated to u32.
        bob.service
            .handle_peer_event(offer("wrapped", (1u64 << 32) * 8192 + 5, 8192, 1))
            .await;
        // Consistent, but past the size limit.
        let chunk = SCTP_MAX_MESSAGE_SIZE;
        let size = MAX_FILE_SIZE + 1;
        bob.service
            .handle_peer_event(offer("oversized", size, chunk, size.div_ceil(chunk as u64) as u32))
            .await;
        // Chunks larger than the channel can carry.
        bob.service
            .handle_peer_event(offer("wide", 1 << 20, 1 << 20, 1))
            .await;
        assert!(bob.service.registry().snapshot().is_empty());
        assert!(requests.try_recv().is_err());

        bob.service.handle_peer_event(offer("fine", 20_000, 8192, 3)).await;
        assert_eq!(status(&bob, "fine"), Some(TransferStatus::WaitingForApproval));
        assert_eq!(requests.try_recv().unwrap().file_id, "fine");
    }

    #[tokio::test]
    async fn test_resume_before_acceptance_keeps_waiting() {
        let board = Switchboard::default();
        let alice = spawn_node("resume_waiting", "alice", &board, policy());
        let bob = spawn_node("resume_waiting", "bob", &board, policy());
        let mut requests = bob.service.subscribe_requests();

        let (path, data) = write_source(&alice, "later.txt", 5_000);
        let file_id = alice
            .service
            .send_file(&path, &["bob".to_string()])
            .await
            .unwrap();
        requests.recv().await.unwrap();
        wait_until("alice waits for approval", || {
            status(&alice, &file_id) == Some(TransferStatus::WaitingForApproval)
        })
        .await;

        alice.service.pause_transfer(&file_id).await.unwrap();
        assert_eq!(status(&alice, &file_id), Some(TransferStatus::Paused));
        alice.service.resume_transfer(&file_id).await.unwrap();
        let t = alice.service.registry().get(&file_id).unwrap();
        assert_eq!(t.status, TransferStatus::WaitingForApproval);
        assert!(!t.is_paused);
        assert!(alice.sends.lock().unwrap().is_empty());

        bob.service.accept_transfer(&file_id).await.unwrap();
        wait_until("bob completes", || status(&bob, &file_id) == Some(TransferStatus::Completed)).await;
        wait_until("alice completes", || status(&alice, &file_id) == Some(TransferStatus::Completed)).await;
        let saved = bob.service.registry().get(&file_id).unwrap().file_path.unwrap();
        assert_eq!(std::fs::read(saved).unwrap(), data);
    }
}
