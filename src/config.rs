//! Runtime configuration for a [`crate::DhtPeer`].
//!
//! The defaults mirror the constants every node in the overlay is expected to
//! agree on. Tests shrink the intervals; the binary only overrides the
//! identity-related fields from the command line.

use std::net::{IpAddr, SocketAddr};

use tokio::time::Duration;

/// How often every known peer is probed.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// How long a single probe waits for a `RESPONSE` before counting a miss.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive misses after which a peer is evicted.
pub const MISSED_HEARTBEAT_THRESHOLD: u32 = 3;

/// Delay between start-up and the outbound join request.
pub const JOIN_DELAY: Duration = Duration::from_secs(1);

/// Default interval for the telemetry log line emitted by the binary.
pub const TELEMETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Settings for one running node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Human-readable label sent in join requests and welcome messages.
    pub name: String,
    /// Bootstrap peer to join through, if any.
    pub bootstrap: Option<SocketAddr>,
    /// Address to listen on. `None` picks the first non-loopback IPv4 address.
    pub bind_ip: Option<IpAddr>,
    pub heartbeat_interval: Duration,
    pub response_timeout: Duration,
    pub miss_threshold: u32,
    pub join_delay: Duration,
    pub telemetry_interval: Duration,
}

impl NodeConfig {
    /// Create a configuration with the default timings for the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: SocketAddr) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = Some(ip);
        self
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "peer".to_string(),
            bootstrap: None,
            bind_ip: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            response_timeout: RESPONSE_TIMEOUT,
            miss_threshold: MISSED_HEARTBEAT_THRESHOLD,
            join_delay: JOIN_DELAY,
            telemetry_interval: TELEMETRY_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_overlay_constants() {
        let config = NodeConfig::new("alice");
        assert_eq!(config.name, "alice");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert_eq!(config.miss_threshold, 3);
        assert!(config.bootstrap.is_none());
    }

    #[test]
    fn builders_set_optional_fields() {
        let target: SocketAddr = "10.0.0.7:4000".parse().unwrap();
        let config = NodeConfig::new("bob")
            .with_bootstrap(target)
            .with_bind_ip("127.0.0.1".parse().unwrap());
        assert_eq!(config.bootstrap, Some(target));
        assert_eq!(config.bind_ip, Some("127.0.0.1".parse().unwrap()));
    }
}
