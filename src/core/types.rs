use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tracing::warn;

use super::{Error, Result};

/// Node identifier in the mesh network
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u8);

impl NodeId {
    /// Broadcast address, also used for messages that do not target a node
    pub const BROADCAST: NodeId = NodeId(0xFF);

    /// Returns the raw wire value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Whether this id addresses a single node
    pub fn is_unicast(&self) -> bool {
        self.0 != 0 && self.0 != Self::BROADCAST.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for NodeId {
    fn from(value: u8) -> Self {
        NodeId(value)
    }
}

/// Configuration for the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Serial device path, or `host:port` of a network bridge
    pub port: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// How long the send worker waits for a transaction to complete
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub response_timeout: Duration,
    /// Period of the worker liveness check
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub watchdog_period: Duration,
    /// How long a node may sit in one initialization stage
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub query_stage_timeout: Duration,
    /// Whether this controller should be the static update controller
    pub is_suc: bool,
    /// Send a soft reset to the stick when the link opens
    pub soft_reset: bool,
    /// Directory for persisted node state
    pub store_dir: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: super::DEFAULT_BAUD_RATE,
            response_timeout: super::DEFAULT_RESPONSE_TIMEOUT,
            watchdog_period: Duration::from_secs(10),
            query_stage_timeout: Duration::from_secs(120),
            is_suc: false,
            soft_reset: false,
            store_dir: PathBuf::from("etc/meshcoord"),
        }
    }
}

impl ControllerConfig {
    /// Creates a config for the given port with default settings
    pub fn with_port(port: impl Into<String>) -> Self {
        ControllerConfig {
            port: port.into(),
            ..Default::default()
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(Error::config("Port must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(Error::config("Baud rate must be positive"));
        }
        if self.watchdog_period.is_zero() {
            return Err(Error::config("Watchdog period must be positive"));
        }
        Ok(())
    }

    /// Response timeout actually used by the send worker.
    ///
    /// Out of range values fall back to the default.
    pub fn effective_response_timeout(&self) -> Duration {
        if super::RESPONSE_TIMEOUT_RANGE.contains(&self.response_timeout) {
            self.response_timeout
        } else {
            warn!(
                requested_ms = self.response_timeout.as_millis() as u64,
                "response timeout out of range, using default"
            );
            super::DEFAULT_RESPONSE_TIMEOUT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id() {
        assert!(NodeId(5).is_unicast());
        assert!(!NodeId::BROADCAST.is_unicast());
        assert!(!NodeId(0).is_unicast());
        assert_eq!(NodeId::from(12).to_string(), "12");
    }

    #[test]
    fn test_config_validation() {
        assert!(ControllerConfig::default().validate().is_ok());

        let config = ControllerConfig::with_port("  ");
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ControllerConfig {
            watchdog_period: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_response_timeout_clamp() {
        let mut config = ControllerConfig::default();
        config.response_timeout = Duration::from_millis(2000);
        assert_eq!(config.effective_response_timeout(), Duration::from_millis(2000));

        config.response_timeout = Duration::from_millis(500);
        assert_eq!(config.effective_response_timeout(), Duration::from_millis(5000));

        config.response_timeout = Duration::from_millis(10_001);
        assert_eq!(config.effective_response_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ControllerConfig::with_port("10.0.0.2:2540");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"response_timeout\":5000"));

        let back: ControllerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, "10.0.0.2:2540");
        assert_eq!(back.watchdog_period, Duration::from_secs(10));
    }
}
