//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    8899
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_tx_queue_capacity() -> usize {
    20
}

fn default_inter_frame_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_retries() -> u32 {
    3
}

/// Connection and pacing parameters for a [`crate::client::Client`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Bound on the number of frames queued for transmission before
    /// `send_request_and_await_response` starts backing off.
    #[serde(default = "default_tx_queue_capacity")]
    pub tx_queue_capacity: usize,

    /// Minimum delay enforced between consecutive frame writes.
    #[serde(default = "default_inter_frame_delay")]
    pub inter_frame_delay: Duration,

    /// Default per-request timeout used when a caller doesn't override it.
    #[serde(default = "default_timeout")]
    pub default_timeout: Duration,

    /// Default retry count used when a caller doesn't override it.
    #[serde(default = "default_retries")]
    pub default_retries: u32,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_port(),
            connect_timeout: default_connect_timeout(),
            tx_queue_capacity: default_tx_queue_capacity(),
            inter_frame_delay: default_inter_frame_delay(),
            default_timeout: default_timeout(),
            default_retries: default_retries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== ClientConfig Default tests ==========

    #[test]
    fn default_has_expected_values() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.port, 8899);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(2));
        assert_eq!(cfg.tx_queue_capacity, 20);
        assert_eq!(cfg.inter_frame_delay, Duration::from_millis(250));
        assert_eq!(cfg.default_retries, 3);
    }

    #[test]
    fn new_overrides_host_only() {
        let cfg = ClientConfig::new("192.168.1.50");
        assert_eq!(cfg.host, "192.168.1.50");
        assert_eq!(cfg.port, 8899);
    }

    // ========== serde round-trip ==========

    #[test]
    fn deserializes_with_missing_fields_using_defaults() {
        let json = r#"{"host": "10.0.0.1"}"#;
        let cfg: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.host, "10.0.0.1");
        assert_eq!(cfg.port, 8899);
        assert_eq!(cfg.tx_queue_capacity, 20);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = ClientConfig::new("inverter.local");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, cfg.host);
        assert_eq!(back.port, cfg.port);
    }
}
