/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::connection::PeerContext;
use crate::dc_events::DcWorkers;
use crate::fetch::{HttpFetch, RequestCache};
use crate::http_api::{self, HttpState};
use crate::ice::{build_api, rtc_configuration};
use crate::net_metrics::NetMetrics;
use crate::queue::{QueueManager, QueueSettings};
use crate::registry::Registry;
use crate::resolver::Resolver;
use crate::signaling::{self, SignalEvent, Signaling};

const SWEEP_EVERY: Duration = Duration::from_secs(60);
const FETCH_ATTEMPTS: u32 = 3;
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Runs the node until `shutdown` flips to true.
pub async fn run(cfg: AppConfig, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let started = Instant::now();
    let metrics = Arc::new(NetMetrics::new());

    let fetch = HttpFetch::new(cfg.http_timeout, FETCH_ATTEMPTS, metrics.clone())?;
    let requests = Arc::new(RequestCache::new(Arc::new(fetch)));
    let queues = QueueManager::new(QueueSettings::default(), metrics.clone());
    let resolver = Arc::new(Resolver::new(cfg.upstream.clone(), requests, queues.clone()));
    let workers = DcWorkers::start(cfg.workers, resolver.clone(), metrics.clone());

    let (signaling, outbound) = Signaling::channel(&cfg.peer_id);
    let ctx = Arc::new(PeerContext {
        api: build_api(&cfg.ice).await?,
        rtc_config: rtc_configuration(&cfg.ice),
        signaling,
        workers,
        metrics: metrics.clone(),
    });
    let registry = Arc::new(Registry::new(ctx, cfg.health));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let url = signaling::signal_url(&cfg.signal_url, &cfg.peer_id);
    info!(peer_id=%cfg.peer_id, %url, "starting node");
    let (reader, writer) =
        signaling::spawn_client(url, outbound, events_tx, metrics.clone(), shutdown.clone());

    let dispatcher = tokio::spawn(dispatch_loop(registry.clone(), events_rx));
    let sweeper = tokio::spawn(sweep_loop(
        registry.clone(),
        queues.clone(),
        resolver.clone(),
        shutdown.clone(),
    ));

    let app = http_api::router(
        HttpState {
            registry: registry.clone(),
            queues,
            resolver,
            metrics,
            started,
        },
        &cfg.public_dir,
    );
    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    info!("http listening on http://{}", cfg.bind);
    let mut server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let stop = async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        };
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(stop)
            .await
    });

    loop {
        if *shutdown.borrow() {
            break;
        }
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    info!("shutting down");

    // The reader owns the event sender, so the dispatcher drains and stops after it.
    for lane in [reader, writer, dispatcher, sweeper] {
        if tokio::time::timeout(STOP_GRACE, lane).await.is_err() {
            warn!("background task did not stop in time");
        }
    }
    registry.close_all().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("http server: {e}"),
        Err(e) => warn!("http server task: {e}"),
    }
    Ok(())
}

async fn dispatch_loop(registry: Arc<Registry>, mut events: mpsc::UnboundedReceiver<SignalEvent>) {
    while let Some(ev) = events.recv().await {
        handle_signal(&registry, ev).await;
    }
    debug!("signal dispatch stopped");
}

/// Applies one signaling event. Errors are logged, never propagated.
pub async fn handle_signal(registry: &Registry, ev: SignalEvent) {
    match ev {
        SignalEvent::Init(ids) => {
            info!(count = ids.len(), "roster received");
            for id in ids {
                if let Err(e) = registry.touch(&id).await {
                    warn!(peer=%id, "init: {e:#}");
                }
            }
        }
        SignalEvent::Online(id) => {
            if let Err(e) = registry.greet(&id).await {
                warn!(peer=%id, "online: {e:#}");
            }
        }
        SignalEvent::Relay(msg) => {
            let (event, from) = (msg.event.clone(), msg.from.clone());
            if let Err(e) = registry.dispatch(msg).await {
                warn!(peer=%from, event=%event, "signal: {e:#}");
            }
        }
    }
}

async fn sweep_loop(
    registry: Arc<Registry>,
    queues: Arc<QueueManager>,
    resolver: Arc<Resolver>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(SWEEP_EVERY);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                let peers = registry.sweep().await;
                let queues = queues.clean();
                let cached = resolver.sweep();
                debug!(peers, queues, cached, "sweep");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{next_event, test_context};
    use crate::health::HealthPolicy;

    #[tokio::test]
    async fn online_dials_and_init_only_registers() {
        let (ctx, mut outbox) = test_context();
        let registry = Registry::new(ctx, HealthPolicy::default());

        handle_signal(&registry, SignalEvent::Init(vec!["quiet".into(), "self-node".into()])).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("quiet").await.is_some());

        handle_signal(&registry, SignalEvent::Online("loud".into())).await;
        let offer = next_event(&mut outbox, "offer").await;
        assert_eq!(offer["to"], "loud");
        assert_eq!(registry.len().await, 2);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn bad_relay_message_is_logged_not_fatal() {
        let (ctx, _outbox) = test_context();
        let registry = Registry::new(ctx, HealthPolicy::default());
        handle_signal(
            &registry,
            SignalEvent::Relay(crate::signaling::RelayMessage {
                event: "answer".into(),
                from: "nobody".into(),
                to: "self-node".into(),
                data: serde_json::json!({}),
            }),
        )
        .await;
        assert!(registry.is_empty().await);
    }
}
