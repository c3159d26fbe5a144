//! Signaling relay client.
//!
//! Keeps one WebSocket to the relay open for the life of the process.
//! Inbound `webrtc_signal` payloads go to the peer manager, outbound
//! signals are wrapped as `{type: "webrtc_signal", payload}` and written
//! as text frames. The online device list (`client_list`) is published on
//! a watch channel and cleared whenever the socket drops.
//!
//! A dropped connection is retried after `min(2^n s, 30 s)`, at most
//! [`RELAY_MAX_RECONNECTS`] times in a row. A connection that opened
//! resets the counter; a stop request never reconnects.

use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::core::config::{RELAY_MAX_BACKOFF, RELAY_MAX_RECONNECTS};
use crate::core::protocol::SignalEnvelope;
use crate::utils::sos::SignalOfStop;

/// One decoded relay message we care about.
#[derive(Debug)]
pub enum RelayEvent {
    ClientList(Vec<String>),
    Signal(SignalEnvelope),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct OutboundMessage<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: T,
}

#[derive(Deserialize)]
struct ClientListPayload {
    #[serde(default)]
    clients: Vec<ClientEntry>,
}

#[derive(Deserialize)]
struct ClientEntry {
    id: String,
}

/// `<base>?deviceId=<id>`, keeping any query the base already has.
pub fn relay_url(base: &str, device_id: &str) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid relay url {base}"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(anyhow!("relay url must be ws:// or wss://, got {other}://")),
    }
    url.query_pairs_mut().append_pair("deviceId", device_id);
    Ok(url)
}

/// Delay before reconnect attempt `attempt` (1-based).
pub fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(RELAY_MAX_BACKOFF)
}

/// Decode a text frame. Unknown types and malformed payloads yield `None`.
pub fn parse_relay_message(text: &str) -> Option<RelayEvent> {
    let raw: RawMessage = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(event = "relay_decode_failed", error = %e, "Dropping malformed relay message");
            return None;
        }
    };
    let decoded = match raw.kind.as_str() {
        "client_list" => serde_json::from_value::<ClientListPayload>(raw.payload)
            .map(|p| RelayEvent::ClientList(p.clients.into_iter().map(|c| c.id).collect())),
        "webrtc_signal" => serde_json::from_value::<SignalEnvelope>(raw.payload).map(RelayEvent::Signal),
        other => {
            debug!(event = "relay_message_ignored", kind = other, "Unhandled relay message type");
            return None;
        }
    };
    match decoded {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!(event = "relay_payload_invalid", kind = %raw.kind, error = %e, "Dropping relay message with bad payload");
            None
        }
    }
}

fn encode<T: Serialize>(kind: &str, payload: T) -> Result<String> {
    Ok(serde_json::to_string(&OutboundMessage { kind, payload })?)
}

/// How one socket session ended.
enum SessionEnd {
    Stopped,
    Dropped,
}

pub struct RelayClient {
    url: Url,
    device_id: String,
    /// Signals from the peer manager waiting to be sent.
    outbound: mpsc::UnboundedReceiver<SignalEnvelope>,
    /// Signals from remote peers.
    inbound: mpsc::UnboundedSender<SignalEnvelope>,
    clients: watch::Sender<Vec<String>>,
    sos: SignalOfStop,
}

impl RelayClient {
    pub fn new(
        base_url: &str,
        device_id: &str,
        outbound: mpsc::UnboundedReceiver<SignalEnvelope>,
        inbound: mpsc::UnboundedSender<SignalEnvelope>,
        sos: SignalOfStop,
    ) -> Result<Self> {
        let (clients, _) = watch::channel(Vec::new());
        Ok(Self {
            url: relay_url(base_url, device_id)?,
            device_id: device_id.to_string(),
            outbound,
            inbound,
            clients,
            sos,
        })
    }

    /// Observe the list of device ids the relay reports online.
    pub fn clients(&self) -> watch::Receiver<Vec<String>> {
        self.clients.subscribe()
    }

    /// Connect and serve until stopped or out of reconnect attempts.
    pub async fn run(mut self) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            let connected = self
                .sos
                .select(connect_async(self.url.as_str()))
                .await;
            let end = match connected {
                None => SessionEnd::Stopped,
                Some(Ok((ws, _))) => {
                    attempts = 0;
                    info!(event = "relay_connected", url = %self.url, device_id = %self.device_id, "Connected to signaling relay");
                    let end = self.session(ws).await;
                    self.clients.send_replace(Vec::new());
                    end
                }
                Some(Err(e)) => {
                    warn!(event = "relay_connect_failed", url = %self.url, error = %e, "Relay connection failed");
                    SessionEnd::Dropped
                }
            };

            if matches!(end, SessionEnd::Stopped) || self.sos.cancelled() {
                info!(event = "relay_stopped", "Relay client stopped");
                return Ok(());
            }
            attempts += 1;
            if attempts > RELAY_MAX_RECONNECTS {
                error!(event = "relay_gave_up", attempts = RELAY_MAX_RECONNECTS, "Relay unreachable, giving up");
                return Err(anyhow!("relay unreachable after {RELAY_MAX_RECONNECTS} attempts"));
            }
            let delay = reconnect_delay(attempts);
            info!(event = "relay_reconnect_scheduled", attempt = attempts, delay_secs = delay.as_secs(), "Reconnecting to relay");
            if !self.sos.sleep(delay).await {
                return Ok(());
            }
        }
    }

    async fn session<S>(&mut self, ws: tokio_tungstenite::WebSocketStream<S>) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();

        match encode("get_client_list", serde_json::json!({})) {
            Ok(text) => {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!(event = "relay_send_failed", error = %e, "Could not request client list");
                    return SessionEnd::Dropped;
                }
            }
            Err(e) => warn!(event = "relay_encode_failed", error = %e, "Could not encode client list request"),
        }

        loop {
            tokio::select! {
                _ = self.sos.wait() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Stopped;
                }
                out = self.outbound.recv() => {
                    let Some(mut env) = out else {
                        return SessionEnd::Stopped;
                    };
                    env.from_id = self.device_id.clone();
                    let to_id = env.to_id.clone();
                    let text = match encode("webrtc_signal", &env) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(event = "relay_encode_failed", peer_id = %to_id, error = %e, "Could not encode signal");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        warn!(event = "relay_send_failed", peer_id = %to_id, error = %e, "Signal not sent; connection lost");
                        return SessionEnd::Dropped;
                    }
                    debug!(event = "signal_sent", peer_id = %to_id, kind = env.signal.kind().as_str(), "Signal relayed");
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.on_text(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => {
                        info!(event = "relay_disconnected", "Relay closed the connection");
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(event = "relay_read_failed", error = %e, "Relay connection error");
                        return SessionEnd::Dropped;
                    }
                },
            }
        }
    }

    fn on_text(&self, text: &str) {
        match parse_relay_message(text) {
            Some(RelayEvent::ClientList(ids)) => {
                let others: Vec<String> = ids.into_iter().filter(|id| id != &self.device_id).collect();
                debug!(event = "client_list", count = others.len(), "Online devices updated");
                self.clients.send_replace(others);
            }
            Some(RelayEvent::Signal(env)) => {
                if env.from_id.is_empty() {
                    warn!(event = "signal_without_sender", "Dropping signal with no fromId");
                    return;
                }
                if self.inbound.send(env).is_err() {
                    warn!(event = "signal_sink_closed", "Peer manager gone, signal dropped");
                }
            }
            None => {}
        }
    }
}
