/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Client side of the signaling relay: one reconnecting WebSocket, read and
//! write on separate tasks, inbound events handed to the caller's dispatcher.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use videortc_protocol::SignalEnvelope;

use crate::net_metrics::{now_ms, NetMetrics};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const KEEPALIVE_EVERY: Duration = Duration::from_secs(60);
const PING_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type SharedSink = Arc<Mutex<Option<WsSink>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    pub event: String,
    pub from: String,
    pub to: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Peers already online when this node connected.
    Init(Vec<String>),
    Online(String),
    Relay(RelayMessage),
}

/// Inbound frame to event. Frames with no usable event are dropped.
pub fn classify(text: &str) -> Option<SignalEvent> {
    let env: SignalEnvelope = serde_json::from_str(text).ok()?;
    match env.event.as_str() {
        "online" => env
            .id
            .filter(|id| !id.is_empty())
            .map(SignalEvent::Online),
        "init" => {
            let ids = env
                .ids
                .unwrap_or_default()
                .into_iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) if !s.is_empty() => Some(s),
                    _ => None,
                })
                .collect();
            Some(SignalEvent::Init(ids))
        }
        "" => None,
        _ if env.from.is_empty() || env.to.is_empty() => None,
        _ => Some(SignalEvent::Relay(RelayMessage {
            event: env.event,
            from: env.from,
            to: env.to,
            data: env.data,
        })),
    }
}

/// Fire-and-forget outbound handle. Cheap to clone.
#[derive(Clone)]
pub struct Signaling {
    self_id: Arc<str>,
    tx: mpsc::UnboundedSender<String>,
}

impl Signaling {
    pub fn channel(self_id: &str) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                self_id: Arc::from(self_id),
                tx,
            },
            rx,
        )
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn send(&self, env: &SignalEnvelope) {
        match serde_json::to_string(env) {
            Ok(text) => {
                if self.tx.send(text).is_err() {
                    debug!(event=%env.event, "signaling writer gone");
                }
            }
            Err(e) => warn!("encode signal: {e}"),
        }
    }

    /// `{"event":..,"from":self,"to":..,"data":..}`.
    pub fn relay(&self, event: &str, to: &str, data: serde_json::Value) {
        self.send(&SignalEnvelope::relay(event, &self.self_id, to, data));
    }
}

pub fn signal_url(base: &str, self_id: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), self_id)
}

/// Starts the read and write lanes. Classified events go to `events`.
pub fn spawn_client(
    url: String,
    outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<SignalEvent>,
    metrics: Arc<NetMetrics>,
    shutdown: watch::Receiver<bool>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let sink: SharedSink = Arc::new(Mutex::new(None));
    let reader = tokio::spawn(read_loop(
        url,
        sink.clone(),
        events,
        metrics.clone(),
        shutdown.clone(),
    ));
    let writer = tokio::spawn(write_loop(sink, outbound, metrics, shutdown));
    (reader, writer)
}

async fn read_loop(
    url: String,
    sink: SharedSink,
    events: mpsc::UnboundedSender<SignalEvent>,
    metrics: Arc<NetMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match read_session(&url, &sink, &events, &metrics, &mut shutdown).await {
            Ok(()) => info!("signaling closed"),
            Err(e) => {
                warn!("signaling: {e:#}");
                metrics.set_signal_error(format!("{e:#}"));
            }
        }
        *sink.lock().await = None;
        metrics.set_signal_connected(false);
        if events.is_closed() {
            break;
        }
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
    if let Some(mut s) = sink.lock().await.take() {
        let _ = s.close().await;
    }
}

async fn read_session(
    url: &str,
    sink: &SharedSink,
    events: &mpsc::UnboundedSender<SignalEvent>,
    metrics: &NetMetrics,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    let (ws_tx, mut ws_rx) = ws.split();
    *sink.lock().await = Some(ws_tx);
    metrics.set_signal_connected(true);
    info!(%url, "signaling connected");

    loop {
        let msg = tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
            msg = ws_rx.next() => msg,
        };
        let Some(msg) = msg else { return Ok(()) };
        match msg? {
            Message::Text(text) => {
                metrics.signal_rx_add(text.len() as u64);
                match classify(&text) {
                    Some(ev) => {
                        if events.send(ev).is_err() {
                            return Ok(());
                        }
                    }
                    None => debug!(raw=%text, "signal dropped"),
                }
            }
            Message::Ping(p) => {
                if let Some(s) = sink.lock().await.as_mut() {
                    let _ = s.send(Message::Pong(p)).await;
                }
            }
            Message::Pong(p) => {
                if let Ok(a) = <[u8; 8]>::try_from(p.as_slice()) {
                    metrics.signal_rtt_update(now_ms().saturating_sub(u64::from_be_bytes(a)));
                }
            }
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
}

async fn write_loop(
    sink: SharedSink,
    mut outbound: mpsc::UnboundedReceiver<String>,
    metrics: Arc<NetMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_EVERY);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            text = outbound.recv() => {
                let Some(text) = text else { break };
                let mut guard = sink.lock().await;
                let Some(s) = guard.as_mut() else {
                    debug!("signaling offline, frame dropped");
                    continue;
                };
                let n = text.len() as u64;
                match tokio::time::timeout(WRITE_TIMEOUT, s.send(Message::Text(text))).await {
                    Ok(Ok(())) => metrics.signal_tx_add(n),
                    Ok(Err(e)) => warn!("signal write: {e}"),
                    Err(_) => warn!("signal write timed out"),
                }
            }
            _ = keepalive.tick() => {
                let mut guard = sink.lock().await;
                let Some(s) = guard.as_mut() else { continue };
                let ping = Message::Ping(now_ms().to_be_bytes().to_vec());
                let ok = matches!(tokio::time::timeout(PING_TIMEOUT, s.send(ping)).await, Ok(Ok(())));
                if !ok {
                    warn!("signal keepalive failed, closing");
                    let _ = s.close().await;
                    *guard = None;
                }
            }
        }
    }
}
