/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use tracing::info;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Default)]
pub struct IceSettings {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
    /// `PUBLICIP`: `ip` or `ip:port`.
    pub public_ip: Option<String>,
}

/// Splits `ip[:port]`. The port, when present, must be a valid u16.
pub fn parse_public_ip(raw: &str) -> Result<(String, Option<u16>)> {
    let raw = raw.trim();
    match raw.split_once(':') {
        None if !raw.is_empty() => Ok((raw.to_string(), None)),
        None => Err(anyhow!("empty public ip")),
        Some((ip, port)) => {
            if ip.is_empty() {
                return Err(anyhow!("public ip missing before port: {raw}"));
            }
            let port: u16 = port.parse().with_context(|| format!("bad public ip port: {raw}"))?;
            Ok((ip.to_string(), Some(port)))
        }
    }
}

pub fn rtc_configuration(ice: &IceSettings) -> RTCConfiguration {
    if ice.urls.is_empty() {
        return RTCConfiguration::default();
    }
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: ice.urls.clone(),
            username: ice.username.clone().unwrap_or_default(),
            credential: ice.credential.clone().unwrap_or_default(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Builds the shared webrtc API. With a public IP, host candidates advertise
/// it; with a port too, every session shares one UDP socket bound there.
pub async fn build_api(ice: &IceSettings) -> Result<API> {
    let Some(raw) = ice.public_ip.as_deref() else {
        return Ok(APIBuilder::new().build());
    };
    let (ip, port) = parse_public_ip(raw)?;
    let mut setting = SettingEngine::default();
    setting.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
    if let Some(port) = port {
        let socket = tokio::net::UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("bind ice udp port {port}"))?;
        let mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
        setting.set_udp_network(UDPNetwork::Muxed(mux));
        info!(ip=%ip, port, "ice udp mux enabled");
    } else {
        info!(ip=%ip, "ice nat 1:1 enabled");
    }
    Ok(APIBuilder::new().with_setting_engine(setting).build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_ip_with_and_without_port() {
        assert_eq!(parse_public_ip("1.2.3.4").unwrap(), ("1.2.3.4".to_string(), None));
        assert_eq!(
            parse_public_ip(" 1.2.3.4:5000 ").unwrap(),
            ("1.2.3.4".to_string(), Some(5000))
        );
        assert!(parse_public_ip("1.2.3.4:http").is_err());
        assert!(parse_public_ip(":5000").is_err());
        assert!(parse_public_ip("").is_err());
    }

    #[test]
    fn credentials_ride_along_with_urls() {
        let cfg = rtc_configuration(&IceSettings {
            urls: vec!["turn:t.example:3478".into()],
            username: Some("u".into()),
            credential: Some("p".into()),
            public_ip: None,
        });
        assert_eq!(cfg.ice_servers.len(), 1);
        assert_eq!(cfg.ice_servers[0].username, "u");
        assert!(rtc_configuration(&IceSettings::default()).ice_servers.is_empty());
    }

    #[tokio::test]
    async fn nat_mapping_builds_an_api() {
        let api = build_api(&IceSettings {
            public_ip: Some("203.0.113.7".into()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(api.new_peer_connection(RTCConfiguration::default()).await.is_ok());
    }
}
