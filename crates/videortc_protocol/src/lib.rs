/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Width of the ASCII JSON header in front of every binary chunk fragment.
pub const CHUNK_HEADER_LEN: usize = 30;
/// Payload bytes carried by one fragment.
pub const CHUNK_FRAGMENT_SIZE: usize = 51_200;

const MAX_INFLIGHT_ASSEMBLIES: usize = 64;

/// Envelope exchanged with the signaling relay.
///
/// Inbound `init` and `online` frames carry `ids` / `id` instead of the
/// addressing fields, so everything except `event` is optional on the way in.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SignalEnvelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl SignalEnvelope {
    pub fn relay(event: &str, from: &str, to: &str, data: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            data,
            ..Default::default()
        }
    }
}

/// `"<video>:<quality>"` plus a part index.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Default)]
pub struct ChunkRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub index: u64,
}

impl ChunkRef {
    pub fn new(id: impl Into<String>, index: u64) -> Self {
        Self {
            id: id.into(),
            index,
        }
    }

    /// Empty id with index zero addresses every task of a queue.
    pub fn is_wildcard(&self) -> bool {
        self.id.is_empty() && self.index == 0
    }
}

/// JSON text frames carried over the data channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum DcEvent {
    Query(ChunkRef),
    Found(ChunkRef),
    Resolve(ChunkRef),
    Quit(ChunkRef),
    Ping,
    Pong,
}

impl DcEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub fn chunk_key(id: &str, part: u64) -> String {
    format!("{id}|{part}")
}

/// Header layout: `["<id>|<part>",<fragment>,<count>]` right-padded with
/// spaces to [`CHUNK_HEADER_LEN`]. Returns `None` when the key is too long to fit.
pub fn encode_chunk_header(
    id: &str,
    part: u64,
    fragment: usize,
    count: usize,
) -> Option<[u8; CHUNK_HEADER_LEN]> {
    let meta = serde_json::to_string(&(chunk_key(id, part), fragment, count)).ok()?;
    if meta.len() > CHUNK_HEADER_LEN {
        return None;
    }
    let mut out = [b' '; CHUNK_HEADER_LEN];
    out[..meta.len()].copy_from_slice(meta.as_bytes());
    Some(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub key: String,
    pub fragment: usize,
    pub count: usize,
}

pub fn decode_chunk_frame(frame: &[u8]) -> Option<(ChunkHeader, &[u8])> {
    if frame.len() < CHUNK_HEADER_LEN {
        return None;
    }
    let (head, payload) = frame.split_at(CHUNK_HEADER_LEN);
    let (key, fragment, count): (String, usize, usize) = serde_json::from_slice(head).ok()?;
    if count == 0 || fragment >= count {
        return None;
    }
    Some((
        ChunkHeader {
            key,
            fragment,
            count,
        },
        payload,
    ))
}

/// Receiver side of the chunk protocol: collects fragments per key until all
/// `count` of them arrived. The node only sends chunks; this is the reference
/// reassembly for receiving peers and for round-trip tests of the framing.
#[derive(Default)]
pub struct ChunkAssembler {
    parts: HashMap<String, Assembly>,
    seq: u64,
}

struct Assembly {
    count: usize,
    fragments: HashMap<usize, Vec<u8>>,
    seq: u64,
}

impl ChunkAssembler {
    pub fn ingest(&mut self, frame: &[u8]) -> Option<(String, Vec<u8>)> {
        let (header, payload) = decode_chunk_frame(frame)?;
        self.seq += 1;
        let seq = self.seq;
        let entry = self
            .parts
            .entry(header.key.clone())
            .or_insert_with(|| Assembly {
                count: header.count,
                fragments: HashMap::new(),
                seq,
            });
        if entry.count != header.count {
            self.parts.remove(&header.key);
            return None;
        }
        entry
            .fragments
            .entry(header.fragment)
            .or_insert_with(|| payload.to_vec());
        if entry.fragments.len() < entry.count {
            self.bound();
            return None;
        }
        let mut done = self.parts.remove(&header.key)?;
        let mut out = Vec::new();
        for i in 0..done.count {
            out.extend_from_slice(&done.fragments.remove(&i)?);
        }
        Some((header.key, out))
    }

    pub fn pending(&self) -> usize {
        self.parts.len()
    }

    fn bound(&mut self) {
        if self.parts.len() <= MAX_INFLIGHT_ASSEMBLIES {
            return;
        }
        let mut keys = self
            .parts
            .iter()
            .map(|(k, v)| (k.clone(), v.seq))
            .collect::<Vec<_>>();
        keys.sort_by_key(|(_, seq)| *seq);
        let drop_n = self.parts.len() - MAX_INFLIGHT_ASSEMBLIES;
        for (k, _) in keys.into_iter().take(drop_n) {
            self.parts.remove(&k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dc_events_use_event_and_data_fields() {
        let q: DcEvent =
            serde_json::from_str(r#"{"event":"query","data":{"id":"abc:18","index":2}}"#).unwrap();
        assert_eq!(q, DcEvent::Query(ChunkRef::new("abc:18", 2)));

        let ping: DcEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(ping, DcEvent::Ping);
        assert_eq!(DcEvent::Pong.to_json(), r#"{"event":"pong"}"#);

        let found = DcEvent::Found(ChunkRef::new("abc:18", 2)).to_json();
        assert_eq!(found, r#"{"event":"found","data":{"id":"abc:18","index":2}}"#);

        assert!(serde_json::from_str::<DcEvent>(r#"{"event":"dance"}"#).is_err());
    }

    #[test]
    fn quit_with_empty_data_is_wildcard() {
        let quit: DcEvent = serde_json::from_str(r#"{"event":"quit","data":{}}"#).unwrap();
        match quit {
            DcEvent::Quit(r) => assert!(r.is_wildcard()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn header_is_padded_to_fixed_width() {
        let h = encode_chunk_header("abc:18", 2, 0, 5).unwrap();
        assert_eq!(h.len(), CHUNK_HEADER_LEN);
        let text = std::str::from_utf8(&h).unwrap();
        assert_eq!(text.trim_end(), r#"["abc:18|2",0,5]"#);

        let mut frame = h.to_vec();
        frame.extend_from_slice(b"xyz");
        let (header, payload) = decode_chunk_frame(&frame).unwrap();
        assert_eq!(header.key, "abc:18|2");
        assert_eq!((header.fragment, header.count), (0, 5));
        assert_eq!(payload, b"xyz");
    }

    #[test]
    fn header_rejects_oversized_keys() {
        assert!(encode_chunk_header("a-very-long-video-identifier:137", 12, 3, 9).is_none());
    }

    #[test]
    fn signal_envelope_skips_empty_fields() {
        let env = SignalEnvelope::relay("answer", "me", "you", serde_json::json!({"sdp": "x"}));
        let v: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"event":"answer","from":"me","to":"you","data":{"sdp":"x"}})
        );
    }

    #[test]
    fn assembler_joins_fragments_in_index_order() {
        let mut asm = ChunkAssembler::default();
        let frame = |i: usize, body: &[u8]| {
            let mut f = encode_chunk_header("v:1", 0, i, 3).unwrap().to_vec();
            f.extend_from_slice(body);
            f
        };
        assert!(asm.ingest(&frame(2, b"cc")).is_none());
        assert!(asm.ingest(&frame(0, b"aa")).is_none());
        assert_eq!(asm.pending(), 1);
        let (key, data) = asm.ingest(&frame(1, b"bb")).unwrap();
        assert_eq!(key, "v:1|0");
        assert_eq!(data, b"aabbcc");
        assert_eq!(asm.pending(), 0);
    }
}
