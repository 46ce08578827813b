/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Byte ranges of the media segments of one stream, read from the container's
//! own index: the `sidx` box for fragmented MP4, the `Cues` element for WebM.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;

/// Half-open `[start, end)` byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// From an inclusive pair, as manifests write them.
    pub fn inclusive(first: u64, last: u64) -> Self {
        Self {
            start: first,
            end: last.saturating_add(1),
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inclusive last byte, for `start-last` style range requests.
    pub fn last(&self) -> u64 {
        self.end.saturating_sub(1)
    }
}

/// Part `i` of a stream is `ranges[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentIndex {
    pub ranges: Vec<ByteRange>,
}

impl SegmentIndex {
    pub fn part(&self, part: u64) -> Option<ByteRange> {
        let i = usize::try_from(part).ok()?;
        self.ranges.get(i).copied().filter(|r| !r.is_empty())
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// `index` is where `bytes` were read from; `total` the stream's content length.
pub fn parse_for_mime(mime: &str, bytes: &[u8], index: ByteRange, total: u64) -> Result<SegmentIndex> {
    let mime = mime.to_ascii_lowercase();
    if mime.contains("mp4") {
        return parse_mp4(bytes, index.start);
    }
    if mime.contains("webm") {
        return parse_webm(bytes, index.last(), total);
    }
    Err(anyhow!("unsupported container {mime}"))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.buf.len());
        let end = end.ok_or_else(|| anyhow!("truncated at byte {}", self.pos))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }
}

/// `index_start` is the absolute offset of `bytes[0]` in the stream.
pub fn parse_mp4(bytes: &[u8], index_start: u64) -> Result<SegmentIndex> {
    let mut pos = 0usize;
    while bytes.len().saturating_sub(pos) >= 8 {
        let mut r = Reader::new(&bytes[pos..]);
        let size32 = r.u32()?;
        let kind = r.take(4)?;
        let size = match size32 {
            0 => (bytes.len() - pos) as u64,
            1 => r.u64()?,
            n => n as u64,
        };
        let header = r.pos;
        let size = usize::try_from(size).context("box too large")?;
        if size < header {
            bail!("bad box size {size} at {pos}");
        }
        if kind == b"sidx" {
            let end = pos.checked_add(size).filter(|e| *e <= bytes.len());
            let end = end.ok_or_else(|| anyhow!("truncated sidx"))?;
            let anchor = index_start
                .checked_add(end as u64)
                .ok_or_else(|| anyhow!("sidx anchor overflows"))?;
            return parse_sidx_body(&bytes[pos + header..end], anchor);
        }
        pos = pos.saturating_add(size);
    }
    Err(anyhow!("no sidx box in {} bytes", bytes.len()))
}

fn parse_sidx_body(body: &[u8], anchor: u64) -> Result<SegmentIndex> {
    let mut r = Reader::new(body);
    let version = r.take(4)?[0];
    let _reference_id = r.u32()?;
    let _timescale = r.u32()?;
    let first_offset = if version == 0 {
        let _earliest = r.u32()?;
        r.u32()? as u64
    } else {
        let _earliest = r.u64()?;
        r.u64()?
    };
    let _reserved = r.u16()?;
    let count = r.u16()?;
    let mut offset = anchor
        .checked_add(first_offset)
        .ok_or_else(|| anyhow!("sidx first offset {first_offset} overflows"))?;
    let mut ranges = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let referenced = r.u32()? & 0x7fff_ffff;
        let _duration = r.u32()?;
        let _sap = r.u32()?;
        let end = offset
            .checked_add(referenced as u64)
            .ok_or_else(|| anyhow!("sidx reference past end of stream"))?;
        ranges.push(ByteRange::new(offset, end));
        offset = end;
    }
    Ok(SegmentIndex { ranges })
}

const EBML_CUES: u32 = 0x1C53_BB6B;
const EBML_CUE_POINT: u32 = 0xBB;
const EBML_CUE_TRACK_POSITIONS: u32 = 0xB7;
const EBML_CUE_CLUSTER_POSITION: u32 = 0xF1;

struct Element {
    id: u32,
    data_start: usize,
    data_end: usize,
}

fn read_id(buf: &[u8], pos: usize) -> Result<(u32, usize)> {
    let first = *buf.get(pos).ok_or_else(|| anyhow!("truncated id"))?;
    let len = first.leading_zeros() as usize + 1;
    if len > 4 {
        bail!("bad element id at {pos}");
    }
    let bytes = buf
        .get(pos..pos + len)
        .ok_or_else(|| anyhow!("truncated id"))?;
    let id = bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);
    Ok((id, pos + len))
}

/// Returns `None` as size for the reserved all-ones "unknown size" value.
fn read_size(buf: &[u8], pos: usize) -> Result<(Option<u64>, usize)> {
    let first = *buf.get(pos).ok_or_else(|| anyhow!("truncated size"))?;
    let len = first.leading_zeros() as usize + 1;
    if len > 8 {
        bail!("bad element size at {pos}");
    }
    let bytes = buf
        .get(pos..pos + len)
        .ok_or_else(|| anyhow!("truncated size"))?;
    let mask = if len == 8 { 0 } else { 0xFFu8 >> len };
    let mut value = (first & mask) as u64;
    let mut all_ones = value == mask as u64;
    for b in &bytes[1..] {
        value = (value << 8) | *b as u64;
        all_ones &= *b == 0xFF;
    }
    Ok((if all_ones { None } else { Some(value) }, pos + len))
}

fn read_element(buf: &[u8], pos: usize, parent_end: usize) -> Result<Element> {
    let (id, p) = read_id(buf, pos)?;
    let (size, data_start) = read_size(buf, p)?;
    let data_end = match size {
        Some(n) => data_start
            .checked_add(usize::try_from(n).context("element too large")?)
            .filter(|e| *e <= parent_end)
            .ok_or_else(|| anyhow!("element 0x{id:X} overruns its parent"))?,
        None => parent_end,
    };
    Ok(Element {
        id,
        data_start,
        data_end,
    })
}

fn children(buf: &[u8], start: usize, end: usize) -> Result<Vec<Element>> {
    let mut out = Vec::new();
    let mut pos = start;
    while pos < end {
        let el = read_element(buf, pos, end)?;
        pos = el.data_end;
        out.push(el);
    }
    Ok(out)
}

fn read_uint(buf: &[u8], el: &Element) -> u64 {
    buf[el.data_start..el.data_end]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

/// `index_last` is the inclusive end of the index range; the first cluster is
/// taken to start on the byte after it. `total` closes the last segment.
pub fn parse_webm(bytes: &[u8], index_last: u64, total: u64) -> Result<SegmentIndex> {
    let cues = children(bytes, 0, bytes.len())
        .context("scan webm index")?
        .into_iter()
        .find(|el| el.id == EBML_CUES)
        .ok_or_else(|| anyhow!("no Cues element in {} bytes", bytes.len()))?;

    let mut positions = Vec::new();
    for point in children(bytes, cues.data_start, cues.data_end)? {
        if point.id != EBML_CUE_POINT {
            continue;
        }
        let pos = children(bytes, point.data_start, point.data_end)?
            .into_iter()
            .filter(|el| el.id == EBML_CUE_TRACK_POSITIONS)
            .find_map(|tp| {
                children(bytes, tp.data_start, tp.data_end)
                    .ok()?
                    .into_iter()
                    .find(|el| el.id == EBML_CUE_CLUSTER_POSITION)
                    .map(|el| read_uint(bytes, &el))
            });
        if let Some(p) = pos {
            if positions.last() != Some(&p) {
                positions.push(p);
            }
        }
    }
    let Some(&first) = positions.first() else {
        bail!("Cues without cluster positions");
    };

    let base = index_last
        .checked_add(1)
        .ok_or_else(|| anyhow!("index range ends at u64::MAX"))?;
    let at = |p: u64| {
        base.checked_add(p.saturating_sub(first))
            .ok_or_else(|| anyhow!("cluster position {p} overflows"))
    };
    let mut ranges = Vec::with_capacity(positions.len());
    for (i, p) in positions.iter().enumerate() {
        let start = at(*p)?;
        let end = match positions.get(i + 1) {
            Some(next) => at(*next)?,
            None => total,
        };
        if end <= start {
            bail!("cluster positions out of order at {i}");
        }
        ranges.push(ByteRange::new(start, end));
    }
    Ok(SegmentIndex { ranges })
}
