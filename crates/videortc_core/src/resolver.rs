/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use videortc_protocol::ChunkRef;

use crate::channel::ChunkSink;
use crate::fetch::RequestCache;
use crate::flight::SingleFlight;
use crate::manifest::{split_resource_id, StreamItem, VideoInfo};
use crate::queue::{QueueManager, Task};
use crate::segment_index::{parse_for_mime, ByteRange, SegmentIndex};

const VIDEO_TTL: Duration = Duration::from_secs(3600);
const VIDEO_SWEEP_EVERY: Duration = Duration::from_secs(60);
/// Indexes never change for a given (video, quality); keep them for the process lifetime.
const INDEX_TTL: Duration = Duration::from_secs(365 * 24 * 3600);
const CHUNK_TTL: Duration = Duration::from_secs(5);
const ERROR_TTL: Duration = Duration::from_secs(5);

/// Where manifests and byte ranges come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// `<base>/<vid>.json` and `<base>/<vid>/<quality>/<start>-<last>.ts`.
    Base(String),
    /// Manifest URL template with a `{vid}` placeholder; ranges come from
    /// the stream's own URL with `&range=<start>-<last>`.
    Manifest(String),
}

impl Upstream {
    fn manifest_url(&self, vid: &str) -> String {
        match self {
            Upstream::Base(base) => format!("{}/{}.json", base.trim_end_matches('/'), vid),
            Upstream::Manifest(tpl) => tpl.replace("{vid}", &urlencoding::encode(vid)),
        }
    }

    fn range_url(&self, vid: &str, quality: &str, item: &StreamItem, range: ByteRange) -> String {
        match self {
            Upstream::Base(base) => format!(
                "{}/{}/{}/{}-{}.ts",
                base.trim_end_matches('/'),
                vid,
                quality,
                range.start,
                range.last()
            ),
            Upstream::Manifest(_) => format!("{}&range={}-{}", item.url, range.start, range.last()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoStat {
    pub id: String,
    pub title: String,
    pub qualities: Vec<String>,
    pub error: Option<String>,
}

pub struct Resolver {
    upstream: Upstream,
    requests: Arc<RequestCache>,
    videos: SingleFlight<String, Arc<VideoInfo>>,
    indexes: SingleFlight<String, Arc<SegmentIndex>>,
    queues: Arc<QueueManager>,
}

impl Resolver {
    pub fn new(upstream: Upstream, requests: Arc<RequestCache>, queues: Arc<QueueManager>) -> Self {
        Self {
            upstream,
            requests,
            videos: SingleFlight::new(crate::fetch::FLIGHT_WAIT_LIMIT, ERROR_TTL, VIDEO_SWEEP_EVERY),
            indexes: SingleFlight::new(crate::fetch::FLIGHT_WAIT_LIMIT, ERROR_TTL, VIDEO_SWEEP_EVERY),
            queues,
        }
    }

    /// Whether `"<vid>:<quality>"` can be served by range. Lookup failures count as no.
    pub async fn ok(&self, id: &str) -> bool {
        match self.stream_item(id).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                debug!(id=%id, "resolve failed: {e:#}");
                false
            }
        }
    }

    /// Manifest of `vid`; concurrent callers share one upstream request.
    pub async fn video_info(&self, vid: &str) -> Result<Arc<VideoInfo>> {
        let url = self.upstream.manifest_url(vid);
        let (requests, url) = (&self.requests, &url);
        let info = self
            .videos
            .get(vid.to_string(), VIDEO_TTL, move || async move {
                let bytes = requests.get(url, CHUNK_TTL).await?;
                let info: VideoInfo =
                    serde_json::from_slice(&bytes).with_context(|| format!("parse manifest {url}"))?;
                Ok(Arc::new(info))
            })
            .await?;
        Ok(info)
    }

    /// The servable stream for a resource id, `None` if the id is malformed or
    /// the variant lacks range metadata.
    pub async fn stream_item(&self, id: &str) -> Result<Option<(String, String, StreamItem)>> {
        let Some((vid, quality)) = split_resource_id(id) else {
            return Ok(None);
        };
        let info = self.video_info(vid).await?;
        Ok(info
            .streams
            .get(quality)
            .filter(|s| s.is_servable())
            .map(|s| (vid.to_string(), quality.to_string(), s.clone())))
    }

    async fn segment_index(&self, vid: &str, quality: &str, item: &StreamItem) -> Result<Arc<SegmentIndex>> {
        let index_range = item
            .index_range_bytes()
            .ok_or_else(|| anyhow!("{vid}:{quality}: no index range"))?;
        let total = item
            .total_len()
            .ok_or_else(|| anyhow!("{vid}:{quality}: no content length"))?;
        let url = self.upstream.range_url(vid, quality, item, index_range);
        let (requests, url) = (&self.requests, &url);
        let idx = self
            .indexes
            .get(format!("{vid}:{quality}"), INDEX_TTL, move || async move {
                let bytes = requests.get(url, INDEX_TTL).await?;
                let idx = parse_for_mime(&item.mime_type, &bytes, index_range, total)
                    .with_context(|| format!("{vid}:{quality} index"))?;
                debug!(vid=%vid, quality=%quality, parts=idx.len(), "segment index parsed");
                Ok(Arc::new(idx))
            })
            .await?;
        Ok(idx)
    }

    /// Fetches `part` of `id` and queues it for delivery on `sink`. A resource
    /// that is not servable is a silent no-op.
    pub async fn response(&self, sink: &Arc<dyn ChunkSink>, id: &str, part: u64) -> Result<()> {
        let reservation = self.queues.reserve(sink.key(), ChunkRef::new(id, part));
        let Some((vid, quality, item)) = self.stream_item(id).await? else {
            return Ok(());
        };
        let index = self.segment_index(&vid, &quality, &item).await?;
        let range = index
            .part(part)
            .ok_or_else(|| anyhow!("{id}: no byte range for part {part}"))?;
        let url = self.upstream.range_url(&vid, &quality, &item, range);
        let payload = self.requests.get(&url, CHUNK_TTL).await?;
        if payload.len() as u64 != range.len() {
            debug!(id=%id, part, want=range.len(), got=payload.len(), "short range body");
        }
        if reservation.is_cancelled() {
            debug!(id=%id, part, "quit while fetching");
            return Ok(());
        }
        let task = Task::with_cancel(id, part, payload, reservation.token().clone());
        self.queues.send(sink, task);
        Ok(())
    }

    pub fn quit_response(&self, sink: &dyn ChunkSink, target: &ChunkRef) {
        self.queues.quit(sink.key(), target);
        self.videos.maybe_sweep();
    }

    pub fn sweep(&self) -> usize {
        self.videos.sweep() + self.indexes.sweep() + self.requests.sweep()
    }

    pub fn stats(&self) -> Vec<VideoStat> {
        let mut out: Vec<VideoStat> = self
            .videos
            .entries()
            .into_iter()
            .map(|(vid, res)| match res {
                Some(Ok(info)) => {
                    let mut qualities: Vec<String> = info.streams.keys().cloned().collect();
                    qualities.sort();
                    VideoStat {
                        id: vid,
                        title: info.title.clone(),
                        qualities,
                        error: None,
                    }
                }
                Some(Err(e)) => VideoStat {
                    id: vid,
                    title: String::new(),
                    qualities: Vec::new(),
                    error: Some(e.to_string()),
                },
                None => VideoStat {
                    id: vid,
                    title: String::new(),
                    qualities: Vec::new(),
                    error: None,
                },
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
