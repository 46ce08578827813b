/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use videortc_protocol::DcEvent;
use webrtc::api::API;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::{ChunkSink, PeerChannel};
use crate::dc_events::DcWorkers;
use crate::health::HealthSnapshot;
use crate::net_metrics::{now_ms, NetMetrics};
use crate::signaling::Signaling;

pub const DC_LABEL: &str = "dc";
pub const DC_MAX_PACKET_LIFE_TIME_MS: u16 = 2000;

/// Everything a connection needs from the rest of the node.
pub struct PeerContext {
    pub api: API,
    pub rtc_config: RTCConfiguration,
    pub signaling: Signaling,
    pub workers: DcWorkers,
    pub metrics: Arc<NetMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStat {
    pub key: String,
    pub id: u16,
    pub label: String,
    pub state: String,
    pub buffered: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStat {
    pub created_ms: u64,
    pub connection_state: String,
    pub ice_connection_state: String,
    pub ice_gathering_state: String,
    pub channel: Option<ChannelStat>,
}

/// One negotiated session with a remote peer and at most one data channel.
pub struct Connection {
    remote: String,
    created: Instant,
    created_ms: u64,
    pc: Arc<RTCPeerConnection>,
    dc: Mutex<Option<Arc<PeerChannel>>>,
    ctx: Arc<PeerContext>,
}

impl Connection {
    pub async fn new(remote: &str, ctx: Arc<PeerContext>) -> Result<Arc<Self>> {
        let pc = ctx
            .api
            .new_peer_connection(ctx.rtc_config.clone())
            .await
            .context("new peer connection")?;
        let conn = Arc::new(Self {
            remote: remote.to_string(),
            created: Instant::now(),
            created_ms: now_ms(),
            pc: Arc::new(pc),
            dc: Mutex::new(None),
            ctx,
        });

        let peer = conn.remote.clone();
        conn.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                info!(peer=%peer, state=%s, "ice connection state");
                Box::pin(async {})
            }));

        let weak = Arc::downgrade(&conn);
        conn.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(conn) = weak.upgrade() {
                    conn.install_channel(dc).await;
                }
            })
        }));
        Ok(conn)
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    pub async fn channel(&self) -> Option<Arc<PeerChannel>> {
        self.dc.lock().await.clone()
    }

    /// Answers a remote offer. Local candidates trickle to `from` as they appear.
    pub async fn accept(&self, offer: &serde_json::Value, from: &str) -> Result<()> {
        self.trickle_to(from);
        let sdp = offer
            .get("sdp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("offer from {from} without sdp"))?;
        let desc = RTCSessionDescription::offer(sdp.to_string()).context("parse offer")?;
        self.pc
            .set_remote_description(desc)
            .await
            .context("set remote offer")?;
        let answer = self.pc.create_answer(None).await.context("create answer")?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .context("set local answer")?;
        let local = self.pc.local_description().await.unwrap_or(answer);
        self.ctx
            .signaling
            .relay("answer", from, serde_json::to_value(&local)?);
        Ok(())
    }

    /// Opens our own data channel to `to`; the offer goes out whenever the
    /// session asks for negotiation.
    pub async fn connect(self: &Arc<Self>, to: &str) -> Result<()> {
        let weak = Arc::downgrade(self);
        let target = to.to_string();
        self.pc.on_negotiation_needed(Box::new(move || {
            let weak = weak.clone();
            let target = target.clone();
            Box::pin(async move {
                let Some(conn) = weak.upgrade() else { return };
                if let Err(e) = conn.send_offer(&target).await {
                    warn!(peer=%target, "offer failed: {e:#}");
                }
            })
        }));

        let dc = self
            .pc
            .create_data_channel(
                DC_LABEL,
                Some(RTCDataChannelInit {
                    max_packet_life_time: Some(DC_MAX_PACKET_LIFE_TIME_MS),
                    ..Default::default()
                }),
            )
            .await
            .context("create data channel")?;
        self.install_channel(dc).await;
        Ok(())
    }

    async fn send_offer(&self, to: &str) -> Result<()> {
        let offer = self.pc.create_offer(None).await.context("create offer")?;
        self.ctx
            .signaling
            .relay("offer", to, serde_json::to_value(&offer)?);
        self.trickle_to(to);
        self.pc
            .set_local_description(offer)
            .await
            .context("set local offer")?;
        Ok(())
    }

    pub async fn add_candidate(&self, data: serde_json::Value) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(data).context("candidate json")?;
        self.pc
            .add_ice_candidate(init)
            .await
            .context("add ice candidate")
    }

    pub async fn set_answer(&self, data: &serde_json::Value) -> Result<()> {
        let sdp = data
            .get("sdp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("answer without sdp"))?;
        let desc = RTCSessionDescription::answer(sdp.to_string()).context("parse answer")?;
        self.pc
            .set_remote_description(desc)
            .await
            .context("set remote answer")
    }

    /// Liveness ping. Errors only when no data channel was ever negotiated.
    pub async fn ping(&self) -> Result<()> {
        let ch = self
            .channel()
            .await
            .ok_or_else(|| anyhow!("no data channel for {}", self.remote))?;
        send_ping(ch.as_ref()).await
    }

    /// Closes the data channel, then the session. The channel's error wins.
    pub async fn close(&self) -> Result<()> {
        let ch = self.dc.lock().await.take();
        let dc_res = match ch {
            Some(ch) => ch.close().await,
            None => Ok(()),
        };
        let pc_res = self.pc.close().await.context("close peer connection");
        dc_res.and(pc_res)
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let channel = self.dc.lock().await.as_ref().map(|c| c.ready_state());
        HealthSnapshot {
            peer: self.pc.connection_state(),
            ice: self.pc.ice_connection_state(),
            gathering: self.pc.ice_gathering_state(),
            channel,
            age: self.created.elapsed(),
        }
    }

    pub async fn stats(&self) -> ConnectionStat {
        let channel = match self.channel().await {
            Some(ch) => Some(ChannelStat {
                key: ch.key().to_string(),
                id: ch.id(),
                label: ch.label(),
                state: ch.ready_state().to_string(),
                buffered: ch.buffered_amount().await,
            }),
            None => None,
        };
        ConnectionStat {
            created_ms: self.created_ms,
            connection_state: self.pc.connection_state().to_string(),
            ice_connection_state: self.pc.ice_connection_state().to_string(),
            ice_gathering_state: self.pc.ice_gathering_state().to_string(),
            channel,
        }
    }

    /// Wires handlers on `dc` and makes it the current channel. The previous
    /// channel is closed first.
    async fn install_channel(&self, dc: Arc<RTCDataChannel>) {
        let ch = PeerChannel::new(&self.remote, dc);
        wire_channel(&ch, &self.ctx.workers);
        let mut slot = self.dc.lock().await;
        if let Some(old) = slot.take() {
            if let Err(e) = old.close().await {
                debug!(channel=%old.key(), "close replaced channel: {e:#}");
            }
        }
        *slot = Some(ch);
    }

    fn trickle_to(&self, to: &str) {
        let signaling = self.ctx.signaling.clone();
        let to = to.to_string();
        self.pc
            .on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
                let signaling = signaling.clone();
                let to = to.clone();
                Box::pin(async move {
                    let Some(c) = c else { return };
                    let data = c
                        .to_json()
                        .map_err(anyhow::Error::from)
                        .and_then(|init| serde_json::to_value(init).map_err(Into::into));
                    match data {
                        Ok(v) => signaling.relay("candidate", &to, v),
                        Err(e) => warn!(peer=%to, "candidate encode: {e:#}"),
                    }
                })
            }));
    }
}

async fn send_ping(sink: &dyn ChunkSink) -> Result<()> {
    if sink.is_closed() {
        return Ok(());
    }
    sink.send_text(DcEvent::Ping.to_json()).await?;
    Ok(())
}

fn wire_channel(ch: &Arc<PeerChannel>, workers: &DcWorkers) {
    let dc = ch.raw().clone();
    let weak: Weak<PeerChannel> = Arc::downgrade(ch);

    let on_open = weak.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let Some(ch) = on_open.upgrade() else { return };
            info!(channel=%ch.key(), label=%ch.label(), id=ch.id(), "data channel open");
            if let Err(e) = send_ping(ch.as_ref()).await {
                warn!(channel=%ch.key(), "initial ping: {e:#}");
            }
        })
    }));

    let key = ch.key().to_string();
    dc.on_close(Box::new(move || {
        info!(channel=%key, "data channel closed");
        Box::pin(async {})
    }));

    let key = ch.key().to_string();
    dc.on_error(Box::new(move |e| {
        warn!(channel=%key, "data channel error: {e}");
        Box::pin(async {})
    }));

    let workers = workers.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let weak = weak.clone();
        let workers = workers.clone();
        Box::pin(async move {
            let Some(ch) = weak.upgrade() else { return };
            if !msg.is_string {
                debug!(channel=%ch.key(), len=msg.data.len(), "binary dc message ignored");
                return;
            }
            let sink: Arc<dyn ChunkSink> = ch;
            workers.submit(sink, &msg.data).await;
        })
    }));
}
