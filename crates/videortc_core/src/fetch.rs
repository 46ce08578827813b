/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rand::{thread_rng, Rng};
use reqwest::{header, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::flight::SingleFlight;
use crate::net_metrics::NetMetrics;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_6) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/86.0.4240.75 Safari/537.36";

/// Leader fetches are abandoned after this long; followers get the timeout error.
pub const FLIGHT_WAIT_LIMIT: Duration = Duration::from_secs(60);
const ERROR_TTL: Duration = Duration::from_secs(5);
const SWEEP_EVERY: Duration = Duration::from_secs(5);

/// One upstream GET, body fully buffered.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<Bytes>;
}

pub struct HttpFetch {
    http: reqwest::Client,
    attempts: u32,
    metrics: Arc<NetMetrics>,
}

impl HttpFetch {
    pub fn new(timeout: Duration, attempts: u32, metrics: Arc<NetMetrics>) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT_LANGUAGE,
            header::HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("http client init")?;
        Ok(Self {
            http,
            attempts,
            metrics,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetch {
    async fn get(&self, url: &str) -> Result<Bytes> {
        self.metrics.upstream_fetch();
        let resp = send_with_retry(|| self.http.get(url), self.attempts, &self.metrics).await?;
        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            self.metrics.upstream_error();
            return Err(anyhow!("{url}: {status}"));
        }
        resp.bytes().await.with_context(|| format!("read body {url}"))
    }
}

async fn send_with_retry<F>(mut build: F, attempts: u32, metrics: &NetMetrics) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Duration::from_millis(200);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match build().send().await {
            Ok(resp) => {
                if should_retry_status(resp.status()) && attempt < max_attempts {
                    metrics.upstream_error();
                    sleep_with_jitter(backoff).await;
                    backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
                    continue;
                }
                return Ok(resp);
            }
            Err(e) => {
                if e.is_timeout() {
                    metrics.upstream_timeout();
                } else {
                    metrics.upstream_error();
                }
                if attempt >= max_attempts {
                    return Err(e.into());
                }
                sleep_with_jitter(backoff).await;
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
            }
        }
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}

/// Single-flight, TTL-cached GET keyed by URL.
///
/// Returned [`Bytes`] are shared with the cache entry and every concurrent
/// caller; they are immutable and released once the last holder drops them.
pub struct RequestCache {
    fetch: Arc<dyn Fetch>,
    flights: SingleFlight<String, Bytes>,
}

impl RequestCache {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self::with_wait_limit(fetch, FLIGHT_WAIT_LIMIT)
    }

    pub fn with_wait_limit(fetch: Arc<dyn Fetch>, wait_limit: Duration) -> Self {
        Self {
            fetch,
            flights: SingleFlight::new(wait_limit, ERROR_TTL, SWEEP_EVERY),
        }
    }

    pub async fn get(&self, url: &str, ttl: Duration) -> Result<Bytes> {
        let fetch = self.fetch.clone();
        let owned = url.to_string();
        let bytes = self
            .flights
            .get(url.to_string(), ttl, || async move { fetch.get(&owned).await })
            .await?;
        Ok(bytes)
    }

    pub fn sweep(&self) -> usize {
        self.flights.sweep()
    }

    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}
