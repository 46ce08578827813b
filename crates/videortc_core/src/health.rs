/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - VideoRTC Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Point-in-time view of a connection's negotiation state.
#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    pub peer: RTCPeerConnectionState,
    pub ice: RTCIceConnectionState,
    pub gathering: RTCIceGatheringState,
    pub channel: Option<RTCDataChannelState>,
    pub age: Duration,
}

/// Replacement policy. `stale_after: None` disables the limbo rule.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub stale_after: Option<Duration>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            stale_after: Some(Duration::from_secs(60)),
        }
    }
}

impl HealthPolicy {
    pub fn is_healthy(&self, s: &HealthSnapshot) -> bool {
        if matches!(
            s.peer,
            RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Closed
                | RTCPeerConnectionState::Failed
        ) {
            return false;
        }
        if matches!(
            s.ice,
            RTCIceConnectionState::Disconnected
                | RTCIceConnectionState::Failed
                | RTCIceConnectionState::Closed
        ) {
            return false;
        }
        let Some(dc) = s.channel else { return true };
        if matches!(dc, RTCDataChannelState::Closing | RTCDataChannelState::Closed) {
            return false;
        }
        // Candidates are gathered but nothing ever answered.
        let limbo = dc == RTCDataChannelState::Connecting
            && s.peer == RTCPeerConnectionState::New
            && s.ice == RTCIceConnectionState::New
            && s.gathering == RTCIceGatheringState::Complete;
        match self.stale_after {
            Some(limit) if limbo => s.age <= limit,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> HealthSnapshot {
        HealthSnapshot {
            peer: RTCPeerConnectionState::New,
            ice: RTCIceConnectionState::New,
            gathering: RTCIceGatheringState::New,
            channel: None,
            age: Duration::ZERO,
        }
    }

    #[test]
    fn terminal_states_are_unhealthy() {
        let p = HealthPolicy::default();
        assert!(p.is_healthy(&fresh()));
        assert!(!p.is_healthy(&HealthSnapshot {
            peer: RTCPeerConnectionState::Failed,
            ..fresh()
        }));
        assert!(!p.is_healthy(&HealthSnapshot {
            ice: RTCIceConnectionState::Disconnected,
            ..fresh()
        }));
        assert!(!p.is_healthy(&HealthSnapshot {
            channel: Some(RTCDataChannelState::Closing),
            ..fresh()
        }));
        assert!(p.is_healthy(&HealthSnapshot {
            peer: RTCPeerConnectionState::Connected,
            ice: RTCIceConnectionState::Connected,
            channel: Some(RTCDataChannelState::Open),
            age: Duration::from_secs(3600),
            ..fresh()
        }));
    }

    #[test]
    fn negotiation_limbo_expires() {
        let limbo = HealthSnapshot {
            gathering: RTCIceGatheringState::Complete,
            channel: Some(RTCDataChannelState::Connecting),
            age: Duration::from_secs(30),
            ..fresh()
        };
        let p = HealthPolicy::default();
        assert!(p.is_healthy(&limbo));
        let old = HealthSnapshot {
            age: Duration::from_secs(61),
            ..limbo
        };
        assert!(!p.is_healthy(&old));
        assert!(HealthPolicy { stale_after: None }.is_healthy(&old));
        // Still gathering is not limbo.
        assert!(p.is_healthy(&HealthSnapshot {
            gathering: RTCIceGatheringState::Gathering,
            ..old
        }));
    }
}
