/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::health::HealthPolicy;
use crate::ice::{parse_public_ip, IceSettings, DEFAULT_STUN};
use crate::resolver::Upstream;

const PEER_ID_GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub signal_url: String,
    pub peer_id: String,
    pub upstream: Upstream,
    pub ice: IceSettings,
    pub public_dir: PathBuf,
    pub workers: usize,
    pub http_timeout: Duration,
    pub health: HealthPolicy,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Reads every setting through `get`. Blank values count as unset.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind = var("VIDEORTC_BIND")
            .unwrap_or_else(|| "0.0.0.0:6060".to_string())
            .parse::<SocketAddr>()
            .context("parse VIDEORTC_BIND")?;

        let signal_url = var("VIDEORTC_SIGNAL_URL").ok_or_else(|| anyhow!("missing VIDEORTC_SIGNAL_URL"))?;
        if !(signal_url.starts_with("ws://") || signal_url.starts_with("wss://")) {
            bail!("VIDEORTC_SIGNAL_URL must be ws:// or wss://: {signal_url}");
        }

        let peer_id = match var("VIDEORTC_PEER_ID") {
            Some(id) => {
                if !is_valid_peer_id(&id) {
                    bail!("invalid VIDEORTC_PEER_ID: {id}");
                }
                id
            }
            None => random_peer_id(),
        };

        let upstream = match (var("BASE_URL"), var("VIDEORTC_MANIFEST_URL")) {
            (Some(base), _) => Upstream::Base(base.trim_end_matches('/').to_string()),
            (None, Some(tpl)) => {
                if !tpl.contains("{vid}") {
                    bail!("VIDEORTC_MANIFEST_URL needs a {{vid}} placeholder");
                }
                Upstream::Manifest(tpl)
            }
            (None, None) => bail!("no upstream: set BASE_URL or VIDEORTC_MANIFEST_URL"),
        };

        let public_ip = var("PUBLICIP");
        if let Some(raw) = public_ip.as_deref() {
            parse_public_ip(raw).context("parse PUBLICIP")?;
        }
        let urls = var("VIDEORTC_ICE_URLS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| vec![DEFAULT_STUN.to_string()]);
        let ice = IceSettings {
            urls,
            username: var("VIDEORTC_ICE_USERNAME"),
            credential: var("VIDEORTC_ICE_CREDENTIAL"),
            public_ip,
        };

        let public_dir = var("VIDEORTC_PUBLIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./public"));

        let workers = parse_num::<usize>(&var, "VIDEORTC_WORKERS", 4)?;
        if !(1..=64).contains(&workers) {
            bail!("VIDEORTC_WORKERS out of range 1..=64: {workers}");
        }
        let timeout_secs = parse_num::<u64>(&var, "VIDEORTC_HTTP_TIMEOUT_SECS", 15)?;
        if timeout_secs == 0 {
            bail!("VIDEORTC_HTTP_TIMEOUT_SECS must be positive");
        }
        let stale_secs = parse_num::<u64>(&var, "VIDEORTC_STALE_NEGOTIATION_SECS", 60)?;

        Ok(Self {
            bind,
            signal_url,
            peer_id,
            upstream,
            ice,
            public_dir,
            workers,
            http_timeout: Duration::from_secs(timeout_secs),
            health: HealthPolicy {
                stale_after: (stale_secs > 0).then(|| Duration::from_secs(stale_secs)),
            },
        })
    }
}

fn parse_num<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(v) => v.parse::<T>().with_context(|| format!("parse {key}")),
        None => Ok(default),
    }
}

/// `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` over lowercase alphanumerics.
pub fn is_valid_peer_id(id: &str) -> bool {
    let groups: Vec<&str> = id.split('-').collect();
    groups.len() == PEER_ID_GROUPS.len()
        && groups.iter().zip(PEER_ID_GROUPS).all(|(g, n)| {
            g.len() == n && g.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
        })
}

pub fn random_peer_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    PEER_ID_GROUPS
        .iter()
        .map(|&n| {
            (0..n)
                .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| env.get(k).cloned())
    }

    const MIN: [(&str, &str); 2] = [
        ("VIDEORTC_SIGNAL_URL", "wss://relay.example/ws"),
        ("BASE_URL", "http://up/"),
    ];

    #[test]
    fn defaults_fill_in() {
        let cfg = load(&MIN).unwrap();
        assert_eq!(cfg.bind.port(), 6060);
        assert!(is_valid_peer_id(&cfg.peer_id));
        assert!(matches!(cfg.upstream, Upstream::Base(ref b) if b == "http://up"));
        assert_eq!(cfg.ice.urls, vec![DEFAULT_STUN.to_string()]);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.http_timeout, Duration::from_secs(15));
        assert_eq!(cfg.health.stale_after, Some(Duration::from_secs(60)));
    }

    #[test]
    fn peer_id_format_is_enforced() {
        assert!(is_valid_peer_id("0a1b2c3d-aaaa-bbbb-cccc-0123456789az"));
        assert!(!is_valid_peer_id("0A1B2C3D-aaaa-bbbb-cccc-0123456789ab"));
        assert!(!is_valid_peer_id("0a1b2c3d-aaaa-bbbb-cccc"));
        assert!(!is_valid_peer_id("0a1b2c3d_aaaa-bbbb-cccc-0123456789ab"));

        let mut env = MIN.to_vec();
        env.push(("VIDEORTC_PEER_ID", "not-a-peer"));
        assert!(load(&env).is_err());
    }

    #[test]
    fn fatal_settings() {
        assert!(load(&[("BASE_URL", "http://up")]).is_err());
        assert!(load(&[("VIDEORTC_SIGNAL_URL", "http://relay"), ("BASE_URL", "http://up")]).is_err());
        assert!(load(&[("VIDEORTC_SIGNAL_URL", "ws://relay")]).is_err());
        assert!(load(&[
            ("VIDEORTC_SIGNAL_URL", "ws://relay"),
            ("VIDEORTC_MANIFEST_URL", "http://meta/no-placeholder")
        ])
        .is_err());

        let mut env = MIN.to_vec();
        env.push(("VIDEORTC_WORKERS", "0"));
        assert!(load(&env).is_err());
        let mut env = MIN.to_vec();
        env.push(("PUBLICIP", "1.2.3.4:nope"));
        assert!(load(&env).is_err());
    }

    #[test]
    fn overrides() {
        let cfg = load(&[
            ("VIDEORTC_SIGNAL_URL", "ws://relay"),
            ("VIDEORTC_MANIFEST_URL", "http://meta/{vid}"),
            ("VIDEORTC_ICE_URLS", "stun:a:1, turn:b:2 ,"),
            ("VIDEORTC_STALE_NEGOTIATION_SECS", "0"),
            ("VIDEORTC_WORKERS", " 8 "),
        ])
        .unwrap();
        assert!(matches!(cfg.upstream, Upstream::Manifest(_)));
        assert_eq!(cfg.ice.urls, vec!["stun:a:1".to_string(), "turn:b:2".to_string()]);
        assert_eq!(cfg.health.stale_after, None);
        assert_eq!(cfg.workers, 8);
    }
}
