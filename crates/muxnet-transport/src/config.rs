use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest channel count a peer may negotiate.
pub const MAX_CHANNEL_COUNT: usize = 255;

/// Configuration for a transport host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Maximum number of peers (connecting or connected) the host tracks.
    pub peer_limit: usize,
    /// Maximum channel count accepted from a connecting peer.
    pub channel_limit: usize,
    /// Incoming bandwidth in bytes/second. 0 = unlimited.
    pub incoming_bandwidth: u32,
    /// Outgoing bandwidth in bytes/second. 0 = unlimited.
    pub outgoing_bandwidth: u32,
    /// Give up on an outgoing handshake after this long.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_limit: 64,
            channel_limit: MAX_CHANNEL_COUNT,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: HostConfig =
            serde_json::from_str(r#"{"peer_limit": 4, "connect_timeout": 250}"#).unwrap();
        assert_eq!(cfg.peer_limit, 4);
        assert_eq!(cfg.connect_timeout, Duration::from_millis(250));
        assert_eq!(cfg.channel_limit, MAX_CHANNEL_COUNT);
    }

    #[test]
    fn durations_serialize_as_millis() {
        let json = serde_json::to_value(HostConfig::default()).unwrap();
        assert_eq!(json["connect_timeout"], 5000);
        assert_eq!(json["incoming_bandwidth"], 0);
    }
}
