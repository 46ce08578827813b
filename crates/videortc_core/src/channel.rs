/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(1);

/// Outbound side of a data channel as seen by the queue manager and resolver.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Process-unique identity; SCTP stream ids repeat across peers.
    fn key(&self) -> &str;
    fn label(&self) -> String;
    fn ready_state(&self) -> RTCDataChannelState;
    async fn buffered_amount(&self) -> usize;
    async fn send(&self, frame: Bytes) -> Result<usize>;
    async fn send_text(&self, text: String) -> Result<usize>;

    fn is_open(&self) -> bool {
        self.ready_state() == RTCDataChannelState::Open
    }

    fn is_closed(&self) -> bool {
        matches!(
            self.ready_state(),
            RTCDataChannelState::Closing | RTCDataChannelState::Closed
        )
    }
}

/// A negotiated `RTCDataChannel` plus the key the queue manager files it under.
pub struct PeerChannel {
    key: String,
    remote: String,
    dc: Arc<RTCDataChannel>,
}

impl PeerChannel {
    pub fn new(remote: &str, dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let seq = CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            key: format!("{remote}#{seq}"),
            remote: remote.to_string(),
            dc,
        })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn id(&self) -> u16 {
        self.dc.id()
    }

    pub fn raw(&self) -> &Arc<RTCDataChannel> {
        &self.dc
    }

    pub async fn close(&self) -> Result<()> {
        self.dc.close().await.context("close data channel")
    }
}

#[async_trait]
impl ChunkSink for PeerChannel {
    fn key(&self) -> &str {
        &self.key
    }

    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn ready_state(&self) -> RTCDataChannelState {
        self.dc.ready_state()
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send(&self, frame: Bytes) -> Result<usize> {
        self.dc.send(&frame).await.context("data channel send")
    }

    async fn send_text(&self, text: String) -> Result<usize> {
        self.dc.send_text(text).await.context("data channel send_text")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Records every frame; state and buffered amount are set by the test.
    pub(crate) struct FakeSink {
        key: String,
        state: Mutex<RTCDataChannelState>,
        pub buffered: AtomicUsize,
        pub frames: Mutex<Vec<Bytes>>,
        pub texts: Mutex<Vec<String>>,
    }

    impl FakeSink {
        pub fn open(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                state: Mutex::new(RTCDataChannelState::Open),
                buffered: AtomicUsize::new(0),
                frames: Mutex::new(Vec::new()),
                texts: Mutex::new(Vec::new()),
            })
        }

        pub fn set_state(&self, s: RTCDataChannelState) {
            *self.state.lock().unwrap() = s;
        }

        pub fn frames(&self) -> Vec<Bytes> {
            self.frames.lock().unwrap().clone()
        }

        pub fn texts(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChunkSink for FakeSink {
        fn key(&self) -> &str {
            &self.key
        }

        fn label(&self) -> String {
            "dc".to_string()
        }

        fn ready_state(&self) -> RTCDataChannelState {
            *self.state.lock().unwrap()
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn send(&self, frame: Bytes) -> Result<usize> {
            let n = frame.len();
            self.frames.lock().unwrap().push(frame);
            Ok(n)
        }

        async fn send_text(&self, text: String) -> Result<usize> {
            let n = text.len();
            self.texts.lock().unwrap().push(text);
            Ok(n)
        }
    }

    #[test]
    fn closing_counts_as_closed() {
        let sink = FakeSink::open("a#1");
        assert!(sink.is_open());
        sink.set_state(RTCDataChannelState::Closing);
        assert!(sink.is_closed());
        assert!(!sink.is_open());
        sink.set_state(RTCDataChannelState::Connecting);
        assert!(!sink.is_closed());
        assert!(!sink.is_open());
    }
}
