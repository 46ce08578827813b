/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub struct NetMetrics {
    pub signal_connected: AtomicBool,
    pub signal_rx_bytes: AtomicU64,
    pub signal_tx_bytes: AtomicU64,
    pub signal_last_change_ms: AtomicU64,
    pub signal_rtt_ema_ms: AtomicU64,
    signal_last_error: Mutex<Option<String>>,

    pub webrtc_sessions: AtomicU64,
    pub dc_rx_messages: AtomicU64,
    pub dc_tx_frames: AtomicU64,
    pub dc_tx_bytes: AtomicU64,
    pub tasks_done: AtomicU64,
    pub tasks_cancelled: AtomicU64,

    pub upstream_fetches: AtomicU64,
    pub upstream_timeouts: AtomicU64,
    pub upstream_errors: AtomicU64,
}

impl NetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_signal_connected(&self, v: bool) {
        self.signal_connected.store(v, Ordering::Relaxed);
        self.signal_last_change_ms.store(now_ms(), Ordering::Relaxed);
        if v {
            if let Ok(mut g) = self.signal_last_error.lock() {
                *g = None;
            }
        }
    }

    pub fn set_signal_error(&self, err: String) {
        self.set_signal_connected(false);
        if let Ok(mut g) = self.signal_last_error.lock() {
            *g = Some(err);
        }
    }

    pub fn signal_rx_add(&self, n: u64) {
        self.signal_rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn signal_tx_add(&self, n: u64) {
        self.signal_tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn signal_rtt_update(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        let prev = self.signal_rtt_ema_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            ms
        } else {
            (prev.saturating_mul(7).saturating_add(ms)) / 8
        };
        self.signal_rtt_ema_ms.store(next, Ordering::Relaxed);
    }

    pub fn webrtc_sessions_set(&self, n: u64) {
        self.webrtc_sessions.store(n, Ordering::Relaxed);
    }

    pub fn dc_rx_add(&self) {
        self.dc_rx_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dc_tx_add(&self, bytes: u64) {
        self.dc_tx_frames.fetch_add(1, Ordering::Relaxed);
        self.dc_tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn task_done(&self) {
        self.tasks_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_fetch(&self) {
        self.upstream_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_timeout(&self) {
        self.upstream_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let last_error = self
            .signal_last_error
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default();
        serde_json::json!({
            "ts_ms": now_ms(),
            "signal": {
                "connected": self.signal_connected.load(Ordering::Relaxed),
                "rx_bytes": self.signal_rx_bytes.load(Ordering::Relaxed),
                "tx_bytes": self.signal_tx_bytes.load(Ordering::Relaxed),
                "last_change_ms": self.signal_last_change_ms.load(Ordering::Relaxed),
                "rtt_ms": self.signal_rtt_ema_ms.load(Ordering::Relaxed),
                "last_error": last_error,
            },
            "webrtc": {
                "sessions": self.webrtc_sessions.load(Ordering::Relaxed),
                "rx_messages": self.dc_rx_messages.load(Ordering::Relaxed),
                "tx_frames": self.dc_tx_frames.load(Ordering::Relaxed),
                "tx_bytes": self.dc_tx_bytes.load(Ordering::Relaxed),
                "tasks_done": self.tasks_done.load(Ordering::Relaxed),
                "tasks_cancelled": self.tasks_cancelled.load(Ordering::Relaxed),
            },
            "upstream": {
                "fetches": self.upstream_fetches.load(Ordering::Relaxed),
                "timeouts": self.upstream_timeouts.load(Ordering::Relaxed),
                "errors": self.upstream_errors.load(Ordering::Relaxed),
            },
        })
    }
}
