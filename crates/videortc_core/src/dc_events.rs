/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Data-channel text events, handled off the channel's callback on a small
//! worker pool.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use videortc_protocol::DcEvent;

use crate::channel::ChunkSink;
use crate::net_metrics::NetMetrics;
use crate::resolver::Resolver;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct DcJob {
    pub sink: Arc<dyn ChunkSink>,
    pub event: DcEvent,
}

/// Parses a text frame. Binary or unknown payloads yield `None`.
pub fn classify(payload: &[u8]) -> Option<DcEvent> {
    serde_json::from_slice::<DcEvent>(payload).ok()
}

/// At most `workers` jobs run on pool permits; a job that cannot get one
/// within a second runs without.
#[derive(Clone)]
pub struct DcWorkers {
    permits: Arc<Semaphore>,
    resolver: Arc<Resolver>,
    metrics: Arc<NetMetrics>,
}

impl DcWorkers {
    pub fn start(workers: usize, resolver: Arc<Resolver>, metrics: Arc<NetMetrics>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            resolver,
            metrics,
        }
    }

    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Hands one inbound message to the pool. Waits at most a second for a
    /// free worker, then runs the job on its own task instead.
    pub async fn submit(&self, sink: Arc<dyn ChunkSink>, payload: &[u8]) {
        self.metrics.dc_rx_add();
        let Some(event) = classify(payload) else {
            debug!(channel=%sink.key(), raw=%String::from_utf8_lossy(payload), "unhandled dc message");
            return;
        };
        let job = DcJob { sink, event };
        let permit = match tokio::time::timeout(SUBMIT_TIMEOUT, self.permits.clone().acquire_owned()).await {
            Ok(Ok(p)) => Some(p),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(channel=%job.sink.key(), "workers busy, running job ad hoc");
                None
            }
        };
        let resolver = self.resolver.clone();
        tokio::spawn(async move {
            run_job(&resolver, job).await;
            drop(permit);
        });
    }
}

async fn run_job(resolver: &Resolver, job: DcJob) {
    let key = job.sink.key().to_string();
    if let Err(e) = handle(resolver, job).await {
        warn!(channel=%key, "dc event failed: {e:#}");
    }
}

pub async fn handle(resolver: &Resolver, job: DcJob) -> Result<()> {
    let DcJob { sink, event } = job;
    match event {
        DcEvent::Query(r) => {
            if resolver.ok(&r.id).await && sink.is_open() {
                sink.send_text(DcEvent::Found(r).to_json()).await?;
            }
        }
        DcEvent::Resolve(r) => resolver.response(&sink, &r.id, r.index).await?,
        DcEvent::Quit(r) => resolver.quit_response(sink.as_ref(), &r),
        DcEvent::Ping => {
            if !sink.is_closed() {
                sink.send_text(DcEvent::Pong.to_json()).await?;
            }
        }
        DcEvent::Pong => {}
        DcEvent::Found(r) => debug!(channel=%sink.key(), id=%r.id, "unexpected found"),
    }
    Ok(())
}
