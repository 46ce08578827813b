/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! One FIFO of chunk deliveries per data channel, each drained by its own
//! background loop that paces sends against the channel's buffered amount.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use videortc_protocol::{encode_chunk_header, ChunkRef, CHUNK_FRAGMENT_SIZE};

use crate::channel::ChunkSink;
use crate::net_metrics::NetMetrics;

#[derive(Clone, Copy, Debug)]
pub struct QueueSettings {
    /// Buffered bytes above which the channel counts as backed up.
    pub high_water: usize,
    /// Unit of the proportional sleep between fragments and while backed up.
    pub pace_step: Duration,
    pub idle_poll: Duration,
    pub task_expiry: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            high_water: 1024 * 1024,
            pace_step: Duration::from_millis(100),
            idle_poll: Duration::from_secs(1),
            task_expiry: Duration::from_secs(5 * 60),
        }
    }
}

impl QueueSettings {
    /// `step * max(1, buffered / high_water)`.
    fn pace(&self, buffered: usize) -> Duration {
        let hw = self.high_water.max(1);
        let n = (buffered / hw).clamp(1, u32::MAX as usize) as u32;
        self.pace_step.saturating_mul(n)
    }
}

/// One chunk delivery: a payload already split into wire fragments.
pub struct Task {
    pub id: String,
    pub part: u64,
    fragments: Vec<Bytes>,
    cancel: CancellationToken,
    created: Instant,
}

impl Task {
    pub fn new(id: impl Into<String>, part: u64, payload: Bytes) -> Self {
        Self::with_cancel(id, part, payload, CancellationToken::new())
    }

    /// Task driven by an existing token, typically a [`Reservation`]'s.
    pub fn with_cancel(id: impl Into<String>, part: u64, payload: Bytes, cancel: CancellationToken) -> Self {
        Self {
            id: id.into(),
            part,
            fragments: split_fragments(payload, CHUNK_FRAGMENT_SIZE),
            cancel,
            created: Instant::now(),
        }
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn matches(&self, target: &ChunkRef) -> bool {
        target.is_wildcard() || (self.id == target.id && self.part == target.index)
    }
}

fn split_fragments(payload: Bytes, size: usize) -> Vec<Bytes> {
    if payload.is_empty() {
        return vec![payload];
    }
    let size = size.max(1);
    let mut out = Vec::with_capacity(payload.len().div_ceil(size));
    let mut start = 0;
    while start < payload.len() {
        let end = (start + size).min(payload.len());
        out.push(payload.slice(start..end));
        start = end;
    }
    out
}

struct ChannelQueue {
    key: String,
    label: String,
    sink: Weak<dyn ChunkSink>,
    pending: Mutex<VecDeque<Arc<Task>>>,
    current: Mutex<Option<Arc<Task>>>,
    cancel: CancellationToken,
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ChannelQueue {
    /// Returns false when an identical (id, part) is already pending.
    fn push(&self, task: Arc<Task>) -> bool {
        let mut pending = lock(&self.pending);
        if pending.iter().any(|t| t.id == task.id && t.part == task.part) {
            return false;
        }
        pending.push_back(task);
        true
    }

    fn pop(&self) -> Option<Arc<Task>> {
        lock(&self.pending).pop_front()
    }

    fn remove(&self, target: &ChunkRef) -> usize {
        let mut removed = 0;
        lock(&self.pending).retain(|t| {
            if t.matches(target) {
                t.cancel();
                removed += 1;
                false
            } else {
                true
            }
        });
        if let Some(cur) = lock(&self.current).as_ref() {
            if cur.matches(target) {
                cur.cancel();
            }
        }
        removed
    }

    fn aborted(&self, task: &Task) -> bool {
        task.is_cancelled() || self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStat {
    pub key: String,
    pub label: String,
    pub state: String,
    pub tasks: usize,
    pub buffered: usize,
}

struct Reserved {
    seq: u64,
    target: ChunkRef,
    token: CancellationToken,
}

/// A delivery that is still being fetched. `quit` cancels its token even
/// though no task is queued yet; dropping it unregisters it.
pub struct Reservation<'a> {
    mgr: &'a QueueManager,
    channel: String,
    seq: u64,
    token: CancellationToken,
}

impl Reservation<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut reserved = lock(&self.mgr.reserved);
        if let Some(list) = reserved.get_mut(&self.channel) {
            list.retain(|r| r.seq != self.seq);
            if list.is_empty() {
                reserved.remove(&self.channel);
            }
        }
    }
}

pub struct QueueManager {
    queues: Mutex<HashMap<String, Arc<ChannelQueue>>>,
    reserved: Mutex<HashMap<String, Vec<Reserved>>>,
    reserve_seq: AtomicU64,
    settings: QueueSettings,
    metrics: Arc<NetMetrics>,
}

impl QueueManager {
    pub fn new(settings: QueueSettings, metrics: Arc<NetMetrics>) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashMap::new()),
            reserve_seq: AtomicU64::new(0),
            settings,
            metrics,
        })
    }

    /// Enqueues `task` for `sink`, starting a drain loop if this is the
    /// channel's first queue.
    pub fn send(self: &Arc<Self>, sink: &Arc<dyn ChunkSink>, task: Task) {
        if task.is_cancelled() {
            debug!(channel=%sink.key(), id=%task.id, part=task.part, "cancelled before enqueue");
            self.metrics.task_cancelled();
            return;
        }
        let (queue, created) = {
            let mut queues = lock(&self.queues);
            match queues.get(sink.key()) {
                Some(q) => (q.clone(), false),
                None => {
                    let q = Arc::new(ChannelQueue {
                        key: sink.key().to_string(),
                        label: sink.label(),
                        sink: Arc::downgrade(sink),
                        pending: Mutex::new(VecDeque::new()),
                        current: Mutex::new(None),
                        cancel: CancellationToken::new(),
                    });
                    queues.insert(q.key.clone(), q.clone());
                    (q, true)
                }
            }
        };

        let task = Arc::new(task);
        if !queue.push(task.clone()) {
            debug!(channel=%queue.key, id=%task.id, part=task.part, "duplicate task dropped");
            task.cancel();
            return;
        }

        if created {
            let mgr = self.clone();
            tokio::spawn(async move {
                mgr.drain(queue).await;
                mgr.clean();
            });
        }
    }

    /// Registers a delivery for `target` on the channel before its payload
    /// exists, so a `quit` racing the fetch is not lost.
    pub fn reserve(&self, channel_key: &str, target: ChunkRef) -> Reservation<'_> {
        let seq = self.reserve_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        lock(&self.reserved)
            .entry(channel_key.to_string())
            .or_default()
            .push(Reserved {
                seq,
                target,
                token: token.clone(),
            });
        Reservation {
            mgr: self,
            channel: channel_key.to_string(),
            seq,
            token,
        }
    }

    /// Cancels reserved, pending and in-flight deliveries of `target` on the
    /// channel; the wildcard ref cancels everything there.
    pub fn quit(&self, channel_key: &str, target: &ChunkRef) -> usize {
        let mut removed = 0;
        if let Some(list) = lock(&self.reserved).get(channel_key) {
            for r in list {
                if (target.is_wildcard() || r.target == *target) && !r.token.is_cancelled() {
                    r.token.cancel();
                    removed += 1;
                }
            }
        }
        let queue = lock(&self.queues).get(channel_key).cloned();
        if let Some(queue) = queue {
            removed += queue.remove(target);
        }
        if removed > 0 {
            debug!(channel=%channel_key, id=%target.id, part=target.index, removed, "deliveries cancelled");
        }
        removed
    }

    /// Removes queues whose channel is closed, closing or gone.
    pub fn clean(&self) -> usize {
        let mut queues = lock(&self.queues);
        let before = queues.len();
        queues.retain(|key, q| {
            let closed = q.sink.upgrade().map(|s| s.is_closed()).unwrap_or(true);
            if closed {
                q.cancel.cancel();
                debug!(channel=%key, "queue removed");
            }
            !closed
        });
        before - queues.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.queues).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn stats(&self) -> Vec<QueueStat> {
        let queues: Vec<Arc<ChannelQueue>> = lock(&self.queues).values().cloned().collect();
        let mut out = Vec::with_capacity(queues.len());
        for q in queues {
            let tasks = lock(&q.pending).len();
            let (state, buffered) = match q.sink.upgrade() {
                Some(s) => (s.ready_state().to_string(), s.buffered_amount().await),
                None => ("closed".to_string(), 0),
            };
            out.push(QueueStat {
                key: q.key.clone(),
                label: q.label.clone(),
                state,
                tasks,
                buffered,
            });
        }
        out
    }

    async fn drain(&self, queue: Arc<ChannelQueue>) {
        info!(channel=%queue.key, "queue started");
        loop {
            if queue.cancel.is_cancelled() {
                break;
            }
            let Some(sink) = queue.sink.upgrade() else { break };
            if sink.is_closed() {
                break;
            }

            let buffered = sink.buffered_amount().await;
            if buffered > self.settings.high_water {
                drop(sink);
                self.nap(&queue, self.settings.pace(buffered)).await;
                continue;
            }

            let Some(task) = queue.pop() else {
                drop(sink);
                self.nap(&queue, self.settings.idle_poll).await;
                continue;
            };
            self.execute(&queue, sink.as_ref(), task).await;
        }
        info!(channel=%queue.key, "queue stopped");
    }

    async fn nap(&self, queue: &ChannelQueue, d: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(d) => {}
            _ = queue.cancel.cancelled() => {}
        }
    }

    async fn execute(&self, queue: &ChannelQueue, sink: &dyn ChunkSink, task: Arc<Task>) {
        if task.created.elapsed() > self.settings.task_expiry {
            debug!(channel=%queue.key, id=%task.id, part=task.part, "stale task skipped");
            task.cancel();
            self.metrics.task_cancelled();
            return;
        }
        *lock(&queue.current) = Some(task.clone());
        let finished = self.send_fragments(queue, sink, &task).await;
        *lock(&queue.current) = None;
        if finished {
            self.metrics.task_done();
        } else {
            self.metrics.task_cancelled();
        }
    }

    /// True when every fragment went out.
    async fn send_fragments(&self, queue: &ChannelQueue, sink: &dyn ChunkSink, task: &Task) -> bool {
        let count = task.fragments.len();
        for (i, frag) in task.fragments.iter().enumerate() {
            if queue.aborted(task) || !sink.is_open() {
                debug!(channel=%queue.key, id=%task.id, part=task.part, sent=i, count, "delivery aborted");
                return false;
            }
            let Some(header) = encode_chunk_header(&task.id, task.part, i, count) else {
                warn!(id=%task.id, part=task.part, "chunk header overflow");
                return false;
            };
            let mut frame = BytesMut::with_capacity(header.len() + frag.len());
            frame.extend_from_slice(&header);
            frame.extend_from_slice(frag);
            match sink.send(frame.freeze()).await {
                Ok(n) => self.metrics.dc_tx_add(n as u64),
                Err(e) => {
                    warn!(channel=%queue.key, "send failed: {e:#}");
                    return false;
                }
            }
            let pause = self.settings.pace(sink.buffered_amount().await);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = task.cancel.cancelled() => {}
                _ = queue.cancel.cancelled() => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::FakeSink;
    use std::sync::atomic::Ordering;
    use videortc_protocol::{decode_chunk_frame, CHUNK_HEADER_LEN};
    use webrtc::data_channel::data_channel_state::RTCDataChannelState;

    fn manager() -> Arc<QueueManager> {
        QueueManager::new(QueueSettings::default(), Arc::new(NetMetrics::new()))
    }

    fn headers(sink: &FakeSink) -> Vec<(String, usize, usize)> {
        sink.frames()
            .iter()
            .map(|f| {
                let (h, _) = decode_chunk_frame(f).unwrap();
                (h.key, h.fragment, h.count)
            })
            .collect()
    }

    #[test]
    fn payload_is_split_into_fragments() {
        let t = Task::new("v:18", 0, Bytes::from(vec![1u8; CHUNK_FRAGMENT_SIZE * 2 + 5]));
        assert_eq!(t.fragment_count(), 3);
        assert_eq!(t.fragments[2].len(), 5);
        assert_eq!(Task::new("v:18", 0, Bytes::new()).fragment_count(), 1);
    }

    #[test]
    fn pacing_scales_with_buffered_multiples() {
        let s = QueueSettings::default();
        assert_eq!(s.pace(0), Duration::from_millis(100));
        assert_eq!(s.pace(s.high_water * 3 + 1), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_go_out_in_submission_order() {
        let mgr = manager();
        let fake = FakeSink::open("p#1");
        let sink: Arc<dyn ChunkSink> = fake.clone();
        mgr.send(&sink, Task::new("v:18", 1, Bytes::from(vec![0u8; CHUNK_FRAGMENT_SIZE + 1])));
        mgr.send(&sink, Task::new("v:18", 2, Bytes::from_static(b"tail")));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            headers(&fake),
            vec![
                ("v:18|1".to_string(), 0, 2),
                ("v:18|1".to_string(), 1, 2),
                ("v:18|2".to_string(), 0, 1),
            ]
        );
        let last = &fake.frames()[2];
        assert_eq!(&last[CHUNK_HEADER_LEN..], b"tail");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_pending_task_is_dropped() {
        let mgr = manager();
        let fake = FakeSink::open("p#2");
        fake.buffered.store(QueueSettings::default().high_water * 4, Ordering::SeqCst);
        let sink: Arc<dyn ChunkSink> = fake.clone();
        mgr.send(&sink, Task::new("v:18", 1, Bytes::from_static(b"a")));
        let dup = Task::new("v:18", 1, Bytes::from_static(b"a"));
        let dup_token = dup.cancel.clone();
        mgr.send(&sink, dup);
        assert!(dup_token.is_cancelled());
        assert_eq!(mgr.stats().await[0].tasks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_is_idempotent() {
        let mgr = manager();
        let fake = FakeSink::open("p#3");
        fake.buffered.store(QueueSettings::default().high_water * 4, Ordering::SeqCst);
        let sink: Arc<dyn ChunkSink> = fake.clone();
        mgr.send(&sink, Task::new("v:18", 1, Bytes::from_static(b"a")));
        mgr.send(&sink, Task::new("v:18", 2, Bytes::from_static(b"b")));

        assert_eq!(mgr.quit("p#3", &ChunkRef::new("v:18", 9)), 0);
        assert_eq!(mgr.quit("p#3", &ChunkRef::new("v:18", 1)), 1);
        assert_eq!(mgr.quit("p#3", &ChunkRef::new("v:18", 1)), 0);
        assert_eq!(mgr.quit("nope", &ChunkRef::new("v:18", 2)), 0);
        assert_eq!(mgr.stats().await[0].tasks, 1);

        assert_eq!(mgr.quit("p#3", &ChunkRef::new("", 0)), 1);
        assert_eq!(mgr.stats().await[0].tasks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_aborts_delivery_in_flight() {
        let mgr = manager();
        let fake = FakeSink::open("p#4");
        let sink: Arc<dyn ChunkSink> = fake.clone();
        mgr.send(&sink, Task::new("v:18", 2, Bytes::from(vec![7u8; CHUNK_FRAGMENT_SIZE * 10])));

        // First fragment goes out right away, then 100ms between fragments.
        tokio::time::sleep(Duration::from_millis(250)).await;
        mgr.quit("p#4", &ChunkRef::new("v:18", 2));
        let sent = fake.frames().len();
        assert!(sent > 0 && sent < 10, "sent {sent}");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fake.frames().len(), sent);
        let hs = headers(&fake);
        for (i, h) in hs.iter().enumerate() {
            assert_eq!(h.1, i);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quit_before_enqueue_cancels_the_reservation() {
        let mgr = manager();
        let fake = FakeSink::open("p#8");
        let sink: Arc<dyn ChunkSink> = fake.clone();

        let held = mgr.reserve("p#8", ChunkRef::new("v:18", 3));
        let other = mgr.reserve("p#8", ChunkRef::new("v:18", 4));
        assert_eq!(mgr.quit("p#8", &ChunkRef::new("v:18", 3)), 1);
        assert!(held.is_cancelled());
        assert!(!other.is_cancelled());

        mgr.send(&sink, Task::with_cancel("v:18", 3, Bytes::from_static(b"x"), held.token().clone()));
        drop(held);
        assert!(mgr.is_empty());

        assert_eq!(mgr.quit("p#8", &ChunkRef::default()), 1);
        assert!(other.is_cancelled());
        drop(other);
        assert_eq!(mgr.quit("p#8", &ChunkRef::default()), 0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(fake.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backed_up_channel_holds_sends() {
        let mgr = manager();
        let fake = FakeSink::open("p#5");
        let hw = QueueSettings::default().high_water;
        fake.buffered.store(hw * 4, Ordering::SeqCst);
        let sink: Arc<dyn ChunkSink> = fake.clone();
        mgr.send(&sink, Task::new("v:18", 0, Bytes::from_static(b"x")));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fake.frames().is_empty());

        fake.buffered.store(0, Ordering::SeqCst);
        // At most one 400ms back-off is still pending.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fake.frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_queue_is_removed() {
        let mgr = manager();
        let fake = FakeSink::open("p#6");
        let sink: Arc<dyn ChunkSink> = fake.clone();
        mgr.send(&sink, Task::new("v:18", 0, Bytes::from_static(b"x")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.len(), 1);

        fake.set_state(RTCDataChannelState::Closed);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(mgr.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_tasks_are_skipped() {
        let mgr = manager();
        let fake = FakeSink::open("p#7");
        let sink: Arc<dyn ChunkSink> = fake.clone();
        let old = Task::new("v:18", 0, Bytes::from_static(b"x"));
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        mgr.send(&sink, old);
        mgr.send(&sink, Task::new("v:18", 1, Bytes::from_static(b"y")));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(headers(&fake), vec![("v:18|1".to_string(), 0, 1)]);
    }
}
