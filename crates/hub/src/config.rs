use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Errors while loading broker configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Broker configuration. Every field has a default, so a TOML file only
/// needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub bind: String,
    /// Interval within which every connection must produce a heartbeat.
    pub heartbeat_interval_secs: u64,
    /// Consecutive silent intervals before a connection is evicted.
    pub max_missed_heartbeats: u32,
    /// Delay between draining a superseded bridge and force-closing its socket.
    pub supersede_grace_ms: u64,
    /// How long a fresh socket has to send its handshake frame.
    pub handshake_timeout_secs: u64,
    /// Bounded outbound frame queue per connection.
    pub outbound_queue_capacity: usize,
    /// How long a trade intent may wait for room in the bridge's queue
    /// before the bridge is treated as failed.
    pub bridge_send_timeout_ms: u64,
    /// Bounded queue in front of the audit writer.
    pub audit_queue_capacity: usize,
    /// Capacity of the in-process hub event channel.
    pub event_channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            heartbeat_interval_secs: 15,
            max_missed_heartbeats: 2,
            supersede_grace_ms: 250,
            handshake_timeout_secs: 10,
            outbound_queue_capacity: 256,
            bridge_send_timeout_ms: 5000,
            audit_queue_capacity: 4096,
            event_channel_capacity: 1024,
        }
    }
}

impl HubConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be > 0".to_string(),
            ));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ConfigError::Invalid(
                "max_missed_heartbeats must be > 0".to_string(),
            ));
        }
        if self.outbound_queue_capacity == 0 || self.audit_queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be > 0".to_string()));
        }
        if self.bridge_send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "bridge_send_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn supersede_grace(&self) -> Duration {
        Duration::from_millis(self.supersede_grace_ms)
    }

    pub fn bridge_send_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_send_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
