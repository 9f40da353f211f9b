//! Configuration types for the VPN engine

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Instance topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Exactly one remote endpoint
    P2p,
    /// Many remote endpoints multiplexed over one interface
    MultiPeer,
}

/// Engine configuration
///
/// The configuration file uses TOML format:
///
/// ```toml
/// mode = "multi-peer"
///
/// # Applied to every new peer; the control plane can override per peer.
/// keepalive-interval = 25
/// keepalive-timeout = 120
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Instance topology
    pub mode: Mode,

    /// Default outgoing keepalive interval in seconds, applied to new peers
    #[serde(default)]
    pub keepalive_interval: Option<u64>,

    /// Default peer receive timeout in seconds, applied to new peers
    #[serde(default)]
    pub keepalive_timeout: Option<u64>,

    /// Receive buffer size for a single datagram or stream read
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer: usize,

    /// Capacity of the per-peer control-message queue (TCP transports)
    #[serde(default = "default_control_queue")]
    pub control_queue: usize,
}

fn default_recv_buffer() -> usize {
    65536
}

fn default_control_queue() -> usize {
    64
}

impl Config {
    /// Point-to-point configuration with defaults
    pub fn p2p() -> Self {
        Self {
            mode: Mode::P2p,
            keepalive_interval: None,
            keepalive_timeout: None,
            recv_buffer: default_recv_buffer(),
            control_queue: default_control_queue(),
        }
    }

    /// Multi-peer configuration with defaults
    pub fn multi_peer() -> Self {
        Self {
            mode: Mode::MultiPeer,
            ..Self::p2p()
        }
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.recv_buffer < ovpn_protocol::MIN_PACKET_SIZE {
            return Err(Error::InvalidConfig(format!(
                "recv-buffer of {} bytes cannot hold a minimum packet",
                self.recv_buffer
            )));
        }

        if self.control_queue == 0 {
            return Err(Error::InvalidConfig(
                "control-queue must hold at least one message".to_string(),
            ));
        }

        match (self.keepalive_interval, self.keepalive_timeout) {
            (Some(0), _) | (_, Some(0)) => Err(Error::InvalidConfig(
                "keepalive values must be non-zero when set".to_string(),
            )),
            (Some(i), Some(t)) if t < i => Err(Error::InvalidConfig(format!(
                "keepalive-timeout {t}s is shorter than keepalive-interval {i}s"
            ))),
            (Some(_), None) | (None, Some(_)) => Err(Error::InvalidConfig(
                "keepalive-interval and keepalive-timeout must be set together".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn keepalive(&self) -> Option<(Duration, Duration)> {
        match (self.keepalive_interval, self.keepalive_timeout) {
            (Some(i), Some(t)) => Some((Duration::from_secs(i), Duration::from_secs(t))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config = Config::from_toml("mode = \"p2p\"").unwrap();
        assert_eq!(config.mode, Mode::P2p);
        assert_eq!(config.keepalive(), None);
        assert_eq!(config.recv_buffer, 65536);
    }

    #[test]
    fn test_parse_full() {
        let config = Config::from_toml(
            r#"
            mode = "multi-peer"
            keepalive-interval = 25
            keepalive-timeout = 120
            recv-buffer = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::MultiPeer);
        assert_eq!(
            config.keepalive(),
            Some((Duration::from_secs(25), Duration::from_secs(120)))
        );
        assert_eq!(config.recv_buffer, 9000);
    }

    #[test]
    fn test_keepalive_must_be_paired() {
        assert!(Config::from_toml("mode = \"p2p\"\nkeepalive-interval = 10").is_err());
    }

    #[test]
    fn test_timeout_shorter_than_interval_rejected() {
        let toml = "mode = \"p2p\"\nkeepalive-interval = 60\nkeepalive-timeout = 10";
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_zero_keepalive_rejected() {
        let toml = "mode = \"p2p\"\nkeepalive-interval = 0\nkeepalive-timeout = 60";
        assert!(Config::from_toml(toml).is_err());
    }
}
