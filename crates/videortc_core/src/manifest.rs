/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::segment_index::ByteRange;

/// Stream manifest of one video as produced by the upstream metadata parser.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VideoInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub streams: HashMap<String, StreamItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamItem {
    #[serde(default, deserialize_with = "string_or_number")]
    pub itag: String,
    #[serde(default, rename = "type", alias = "mimeType")]
    pub mime_type: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub init_range: Option<RangeField>,
    #[serde(default)]
    pub index_range: Option<RangeField>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub content_length: String,
}

/// Inclusive `start`/`end` pair; upstreams send either strings or numbers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RangeField {
    #[serde(default, deserialize_with = "string_or_number")]
    pub start: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub end: String,
}

impl RangeField {
    pub fn to_range(&self) -> Option<ByteRange> {
        let start = self.start.trim().parse::<u64>().ok()?;
        let end = self.end.trim().parse::<u64>().ok()?;
        if end < start {
            return None;
        }
        Some(ByteRange::inclusive(start, end))
    }
}

impl StreamItem {
    /// Range-addressed fetch needs the init range, a parseable index range and
    /// the content length.
    pub fn is_servable(&self) -> bool {
        self.init_range.is_some()
            && self.index_range_bytes().is_some()
            && self.total_len().is_some()
    }

    pub fn index_range_bytes(&self) -> Option<ByteRange> {
        let r = self.index_range.as_ref()?;
        if r.end.trim().is_empty() {
            return None;
        }
        r.to_range()
    }

    pub fn total_len(&self) -> Option<u64> {
        self.content_length.trim().parse::<u64>().ok()
    }
}

/// Splits `"<video>:<quality>"`. Anything but exactly two non-empty parts is rejected.
pub fn split_resource_id(id: &str) -> Option<(&str, &str)> {
    let mut it = id.split(':');
    let vid = it.next()?;
    let quality = it.next()?;
    if it.next().is_some() || vid.is_empty() || quality.is_empty() {
        return None;
    }
    Some((vid, quality))
}

fn string_or_number<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(de)?;
    Ok(match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upstream_manifest() {
        let raw = r#"{
            "id": "abc",
            "title": "t",
            "streams": {
                "18": {"itag": 18, "type": "video/mp4", "url": "http://cdn/v?x=1"},
                "137": {
                    "itag": "137",
                    "type": "video/mp4; codecs=\"avc1.640028\"",
                    "url": "http://cdn/v?x=2",
                    "initRange": {"start": "0", "end": "740"},
                    "indexRange": {"start": 741, "end": 1400},
                    "contentLength": "9000000"
                }
            }
        }"#;
        let info: VideoInfo = serde_json::from_str(raw).unwrap();
        let s18 = &info.streams["18"];
        assert_eq!(s18.itag, "18");
        assert!(!s18.is_servable());

        let s137 = &info.streams["137"];
        assert!(s137.is_servable());
        assert_eq!(s137.index_range_bytes(), Some(ByteRange::new(741, 1401)));
        assert_eq!(s137.total_len(), Some(9_000_000));
    }

    #[test]
    fn empty_index_end_is_not_servable() {
        let item = StreamItem {
            init_range: Some(RangeField::default()),
            index_range: Some(RangeField {
                start: "10".into(),
                end: "".into(),
            }),
            content_length: "100".into(),
            ..Default::default()
        };
        assert!(!item.is_servable());
    }

    #[test]
    fn resource_ids_need_video_and_quality() {
        assert_eq!(split_resource_id("abc:18"), Some(("abc", "18")));
        assert_eq!(split_resource_id("abc"), None);
        assert_eq!(split_resource_id("abc:18:x"), None);
        assert_eq!(split_resource_id(":18"), None);
    }
}
