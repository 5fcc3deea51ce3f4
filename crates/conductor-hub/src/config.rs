use serde::Deserialize;
use std::time::Duration;

/// Timeouts and buffer sizes for the [`CommunicationHub`](crate::CommunicationHub).
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// How long a requires-response send waits for its correlated reply.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Interval between heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence after which an endpoint is marked offline.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Capacity of the inbound broadcast channel.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

fn default_inbound_capacity() -> usize {
    1024
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

impl HubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}
