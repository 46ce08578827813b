/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Read-only HTTP front door: process status, peer stats and the static app.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::info_span;

use crate::net_metrics::NetMetrics;
use crate::queue::QueueManager;
use crate::registry::Registry;
use crate::resolver::Resolver;

#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<Registry>,
    pub queues: Arc<QueueManager>,
    pub resolver: Arc<Resolver>,
    pub metrics: Arc<NetMetrics>,
    pub started: Instant,
}

pub fn router(state: HttpState, public_dir: &Path) -> Router {
    let index = public_dir.join("index.html");
    let files = ServeDir::new(public_dir).fallback(ServeFile::new(index));
    Router::new()
        .route("/status", get(status))
        .route("/peers", get(peers))
        .fallback_service(files)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                info_span!("http", method = %req.method(), uri = %req.uri())
            }),
        )
        .with_state(state)
}

async fn status(State(state): State<HttpState>) -> impl IntoResponse {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    Json(json!({
        "ok": true,
        "id": state.registry.self_id(),
        "version": env!("CARGO_PKG_VERSION"),
        "pid": std::process::id(),
        "cpus": cpus,
        "uptime_secs": state.started.elapsed().as_secs(),
        "metrics": state.metrics.snapshot_json(),
    }))
}

async fn peers(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "peers": state.registry.stats().await,
        "queues": state.queues.stats().await,
        "videos": state.resolver.stats(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_context;
    use crate::fetch::tests::FakeFetch;
    use crate::fetch::RequestCache;
    use crate::health::HealthPolicy;
    use crate::queue::QueueSettings;
    use crate::resolver::Upstream;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> HttpState {
        let (ctx, _outbox) = test_context();
        let metrics = ctx.metrics.clone();
        let queues = QueueManager::new(QueueSettings::default(), metrics.clone());
        let resolver = Arc::new(Resolver::new(
            Upstream::Base("http://up".into()),
            Arc::new(RequestCache::new(Arc::new(FakeFetch::default()))),
            queues.clone(),
        ));
        HttpState {
            registry: Arc::new(Registry::new(ctx, HealthPolicy::default())),
            queues,
            resolver,
            metrics,
            started: Instant::now(),
        }
    }

    fn public_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("videortc-http-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<html>app</html>").unwrap();
        std::fs::write(dir.join("app.js"), "console.log(1)").unwrap();
        dir
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn status_reports_identity_and_metrics() {
        let app = router(state(), &public_dir("status"));
        let (code, body) = get_body(app, "/status").await;
        assert_eq!(code, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(v["id"], "self-node");
        assert!(v["metrics"].is_object());
    }

    #[tokio::test]
    async fn peers_lists_empty_tables() {
        let app = router(state(), &public_dir("peers"));
        let (code, body) = get_body(app, "/peers").await;
        assert_eq!(code, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["peers"], json!([]));
        assert_eq!(v["queues"], json!([]));
        assert_eq!(v["videos"], json!([]));
    }

    #[tokio::test]
    async fn unknown_paths_fall_back_to_index() {
        let dir = public_dir("spa");
        let (code, body) = get_body(router(state(), &dir), "/app.js").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, "console.log(1)");
        let (code, body) = get_body(router(state(), &dir), "/watch/abc").await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.contains("app"));
    }
}
