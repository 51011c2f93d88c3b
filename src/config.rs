//! Bridge configuration
//!
//! Loaded from a JSON file or built in code from `Default`. Every timeout and
//! threshold the bridge uses lives here.

use crate::network::message::Capabilities;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// This bridge's instance id, unique within the trust network
    pub instance_id: String,
    /// Interface to listen on
    pub listen_host: String,
    /// Listen port; `None` disables inbound connections, 0 picks a free port
    pub listen_port: Option<u16>,
    /// Address peers should dial back on, when it differs from the bound one
    pub advertise_addr: Option<String>,
    /// `host:port` peers to dial at startup
    pub bootstrap_peers: Vec<String>,
    /// Features advertised at handshake
    pub capabilities: Capabilities,
    pub send_timeout_ms: u64,
    pub health_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub degrade_after_failures: u32,
    pub close_after_failures: u32,
    /// Run a periodic health check every this many seconds
    pub health_interval_secs: Option<u64>,
    /// secp256k1 identity key (hex); generated at startup when absent
    pub private_key_hex: Option<String>,
    /// Facility name stamped on facility updates and milestones
    pub facility: String,
    /// Capacity of the event loop's command queue
    pub command_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("bridge-{}", hex::encode(rand::thread_rng().gen::<[u8; 4]>())),
            listen_host: "0.0.0.0".to_string(),
            listen_port: Some(7700),
            advertise_addr: None,
            bootstrap_peers: Vec::new(),
            capabilities: Capabilities::default(),
            send_timeout_ms: 10_000,
            health_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            degrade_after_failures: crate::network::peer::DEFAULT_DEGRADE_AFTER,
            close_after_failures: crate::network::peer::DEFAULT_CLOSE_AFTER,
            health_interval_secs: None,
            private_key_hex: None,
            facility: "TELSTP Life Science Park".to_string(),
            command_buffer: 1000,
        }
    }
}

impl BridgeConfig {
    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        log::debug!("Loaded config for {} from {:?}", config.instance_id, path);
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Invalid("instance_id must not be empty".into()));
        }

        let timeouts = [
            ("send_timeout_ms", self.send_timeout_ms),
            ("health_timeout_ms", self.health_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{} must be positive", name)));
        }
        if self.health_timeout_ms >= self.send_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "health_timeout_ms ({}) must be shorter than send_timeout_ms ({})",
                self.health_timeout_ms, self.send_timeout_ms
            )));
        }

        if self.degrade_after_failures == 0
            || self.close_after_failures < self.degrade_after_failures
        {
            return Err(ConfigError::Invalid(format!(
                "need 0 < degrade_after_failures ({}) <= close_after_failures ({})",
                self.degrade_after_failures, self.close_after_failures
            )));
        }

        if self.command_buffer == 0 {
            return Err(ConfigError::Invalid("command_buffer must be positive".into()));
        }

        if self.health_interval_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "health_interval_secs must be positive".into(),
            ));
        }

        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.instance_id.starts_with("bridge-"));
        assert_eq!(config.send_timeout(), Duration::from_secs(10));
        assert_eq!(config.capabilities, Capabilities::all());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bridge.json");

        let config = BridgeConfig {
            instance_id: "alpha".to_string(),
            bootstrap_peers: vec!["127.0.0.1:7701".to_string()],
            capabilities: Capabilities::KNOWLEDGE_SYNC | Capabilities::HEALTH_CHECK,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = BridgeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(&path, r#"{"instance_id": "bravo", "listen_port": 0}"#).unwrap();

        let loaded = BridgeConfig::load(&path).unwrap();
        assert_eq!(loaded.instance_id, "bravo");
        assert_eq!(loaded.listen_port, Some(0));
        assert_eq!(loaded.close_after_failures, 5);
    }

    #[test]
    fn test_invalid_thresholds() {
        let config = BridgeConfig {
            degrade_after_failures: 4,
            close_after_failures: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = BridgeConfig {
            send_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_health_timeout_shorter_than_send() {
        let config = BridgeConfig {
            health_timeout_ms: 10_000,
            send_timeout_ms: 10_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = BridgeConfig {
            health_timeout_ms: 9_999,
            send_timeout_ms: 10_000,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
