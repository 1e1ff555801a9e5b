use std::time::Duration;

use muxnet_transport::config::duration_ms;
use muxnet_transport::HostConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Configuration for a [`NetworkRuntime`](crate::NetworkRuntime).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Run the receiver loop and per-channel sender workers on background
    /// threads. When false, the application pumps with `service_network()`.
    pub threaded: bool,
    /// Pause between passes of the receiver loop over every host.
    #[serde(with = "duration_ms")]
    pub communication_interval: Duration,
    /// How long an idle sender worker sleeps before re-checking for shutdown.
    #[serde(with = "duration_ms")]
    pub sender_idle_wait: Duration,
    /// How long a graceful disconnect waits for the other side.
    #[serde(with = "duration_ms")]
    pub disconnect_timeout: Duration,
    /// Template for every host the runtime creates. Per-server and per-client
    /// arguments override the peer limit, channel limit and bandwidths.
    pub host: HostConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            threaded: true,
            communication_interval: Duration::from_millis(2),
            sender_idle_wait: Duration::from_millis(8),
            disconnect_timeout: Duration::from_secs(3),
            host: HostConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Cooperative mode: no background threads.
    pub fn cooperative() -> Self {
        Self {
            threaded: false,
            ..Self::default()
        }
    }
}
