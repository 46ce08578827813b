/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Live connections keyed by remote peer id.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionStat, PeerContext};
use crate::health::HealthPolicy;
use crate::signaling::RelayMessage;

#[derive(Debug, Clone, Serialize)]
pub struct PeerStat {
    pub id: String,
    #[serde(flatten)]
    pub conn: ConnectionStat,
}

pub struct Registry {
    peers: RwLock<HashMap<String, Arc<Connection>>>,
    ctx: Arc<PeerContext>,
    policy: HealthPolicy,
}

impl Registry {
    pub fn new(ctx: Arc<PeerContext>, policy: HealthPolicy) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            ctx,
            policy,
        }
    }

    pub fn self_id(&self) -> &str {
        self.ctx.signaling.self_id()
    }

    pub async fn get(&self, remote: &str) -> Option<Arc<Connection>> {
        self.peers.read().await.get(remote).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns the live connection for `remote`, creating one when there is
    /// none or the current one is unhealthy. `true` means newly created.
    pub async fn ensure(&self, remote: &str) -> Result<(Arc<Connection>, bool)> {
        self.sweep().await;

        if let Some(existing) = self.get(remote).await {
            if self.policy.is_healthy(&existing.snapshot().await) {
                return Ok((existing, false));
            }
            info!(peer=%remote, "replacing unhealthy connection");
            self.drop_if_same(remote, &existing).await;
            if let Err(e) = existing.close().await {
                debug!(peer=%remote, "close unhealthy: {e:#}");
            }
        }

        let fresh = Connection::new(remote, self.ctx.clone()).await?;
        let mut peers = self.peers.write().await;
        if let Some(other) = peers.get(remote).cloned() {
            if self.policy.is_healthy(&other.snapshot().await) {
                drop(peers);
                if let Err(e) = fresh.close().await {
                    debug!(peer=%remote, "close lost race: {e:#}");
                }
                return Ok((other, false));
            }
        }
        if let Some(old) = peers.insert(remote.to_string(), fresh.clone()) {
            tokio::spawn(async move {
                if let Err(e) = old.close().await {
                    debug!(peer=%old.remote(), "close replaced: {e:#}");
                }
            });
        }
        self.ctx.metrics.webrtc_sessions_set(peers.len() as u64);
        Ok((fresh, true))
    }

    async fn drop_if_same(&self, remote: &str, conn: &Arc<Connection>) {
        let mut peers = self.peers.write().await;
        if peers.get(remote).is_some_and(|c| Arc::ptr_eq(c, conn)) {
            peers.remove(remote);
        }
        self.ctx.metrics.webrtc_sessions_set(peers.len() as u64);
    }

    /// Drops and closes unhealthy connections. Health is read with no map
    /// lock held; an entry replaced in the meantime is left alone.
    pub async fn sweep(&self) -> usize {
        let conns: Vec<(String, Arc<Connection>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        let mut dead = Vec::new();
        for (id, conn) in conns {
            if !self.policy.is_healthy(&conn.snapshot().await) {
                dead.push((id, conn));
            }
        }
        if dead.is_empty() {
            return 0;
        }

        let mut closed = Vec::with_capacity(dead.len());
        {
            let mut peers = self.peers.write().await;
            for (id, conn) in dead {
                if peers.get(&id).is_some_and(|c| Arc::ptr_eq(c, &conn)) {
                    peers.remove(&id);
                    closed.push(conn);
                }
            }
            self.ctx.metrics.webrtc_sessions_set(peers.len() as u64);
        }
        let n = closed.len();
        for conn in closed {
            if let Err(e) = conn.close().await {
                debug!(peer=%conn.remote(), "close swept: {e:#}");
            } else {
                debug!(peer=%conn.remote(), "swept connection");
            }
        }
        n
    }

    /// Routes one relayed signaling message to its connection.
    pub async fn dispatch(&self, msg: RelayMessage) -> Result<()> {
        if msg.from == self.self_id() {
            return Ok(());
        }
        match msg.event.as_str() {
            "offer" => {
                let (conn, _) = self.ensure(&msg.from).await?;
                conn.accept(&msg.data, &msg.from).await
            }
            "answer" => {
                let conn = self.require(&msg.from).await?;
                conn.set_answer(&msg.data).await
            }
            "candidate" => {
                let conn = self.require(&msg.from).await?;
                conn.add_candidate(msg.data).await
            }
            other => {
                debug!(event=%other, from=%msg.from, "unhandled signal");
                Ok(())
            }
        }
    }

    async fn require(&self, remote: &str) -> Result<Arc<Connection>> {
        self.get(remote)
            .await
            .ok_or_else(|| anyhow!("peer not found: {remote}"))
    }

    /// Brings up a session with a peer that just appeared. A new connection
    /// starts negotiating; an existing one gets a liveness ping.
    pub async fn greet(&self, remote: &str) -> Result<()> {
        if remote == self.self_id() {
            return Ok(());
        }
        let (conn, created) = self.ensure(remote).await?;
        if created {
            conn.connect(remote).await
        } else {
            conn.ping().await
        }
    }

    /// For the `init` roster: existing connections are pinged, nothing is dialed.
    pub async fn touch(&self, remote: &str) -> Result<()> {
        if remote == self.self_id() {
            return Ok(());
        }
        let (conn, created) = self.ensure(remote).await?;
        if !created {
            conn.ping().await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> Vec<PeerStat> {
        let conns: Vec<_> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        let mut out = Vec::with_capacity(conns.len());
        for (id, conn) in conns {
            out.push(PeerStat {
                id,
                conn: conn.stats().await,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Closes everything. Used on shutdown.
    pub async fn close_all(&self) {
        let conns: Vec<_> = self.peers.write().await.drain().collect();
        self.ctx.metrics.webrtc_sessions_set(0);
        for (id, conn) in conns {
            if let Err(e) = conn.close().await {
                warn!(peer=%id, "close: {e:#}");
            }
        }
    }
}
