//! Transport Configuration
//!
//! Everything the worker needs is fixed before `start`. Loaded from JSON or
//! built in code; `validate` runs before every start.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::channel::{ChannelMode, ChannelPolicy};
use crate::error::ConfigError;
use crate::pool::{BufferPool, DEFAULT_CLASSES, DEFAULT_RETAIN_PER_CLASS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Channel reliability list; index 0 reliable, index 1 unreliable
    pub channels: Vec<ChannelMode>,
    pub max_packet_size: usize,
    /// Bounded wait of one native service call
    pub poll_wait_ms: u64,
    /// Server peer limit (clients always use 1)
    pub max_connections: usize,
    pub outgoing_capacity: usize,
    pub incoming_capacity: usize,
    pub max_events_per_poll: usize,
    pub stop_timeout_ms: u64,
    pub pool_classes: Vec<usize>,
    pub pool_retain_per_class: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            channels: vec![ChannelMode::Reliable, ChannelMode::Unreliable],
            max_packet_size: 64 * 1024,
            poll_wait_ms: 1,
            max_connections: 64,
            outgoing_capacity: 4096,
            incoming_capacity: 4096,
            max_events_per_poll: 1024,
            stop_timeout_ms: 2000,
            pool_classes: DEFAULT_CLASSES.to_vec(),
            pool_retain_per_class: DEFAULT_RETAIN_PER_CLASS,
        }
    }
}

impl TransportConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: TransportConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel_policy()?;

        let nonzero = [
            ("max_packet_size", self.max_packet_size),
            ("max_connections", self.max_connections),
            ("outgoing_capacity", self.outgoing_capacity),
            ("incoming_capacity", self.incoming_capacity),
            ("max_events_per_poll", self.max_events_per_poll),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        let increasing = self.pool_classes.windows(2).all(|w| w[0] < w[1]);
        if self.pool_classes.is_empty() || !increasing || self.pool_classes[0] == 0 {
            return Err(ConfigError::PoolClasses);
        }
        Ok(())
    }

    pub fn channel_policy(&self) -> Result<ChannelPolicy, ConfigError> {
        ChannelPolicy::new(self.channels.clone())
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn build_pool(&self) -> BufferPool {
        BufferPool::new(&self.pool_classes, self.pool_retain_per_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = TransportConfig::default();
        config.validate().unwrap();
        assert_eq!(config.channel_policy().unwrap().len(), 2);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TransportConfig::from_json(
            r#"{ "channels": ["reliable", "unreliable", "unsequenced"], "poll_wait_ms": 5 }"#,
        )
        .unwrap();
        assert_eq!(config.channels.len(), 3);
        assert_eq!(config.poll_wait(), Duration::from_millis(5));
        assert_eq!(config.max_packet_size, 64 * 1024);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let err = TransportConfig::from_json(r#"{ "channels": ["unreliable", "reliable"] }"#);
        assert!(matches!(err, Err(ConfigError::ChannelConvention { .. })));

        let err = TransportConfig::from_json(r#"{ "max_packet_size": 0 }"#);
        assert!(matches!(err, Err(ConfigError::Zero("max_packet_size"))));

        let err = TransportConfig::from_json(r#"{ "pool_classes": [1024, 256] }"#);
        assert!(matches!(err, Err(ConfigError::PoolClasses)));

        let err = TransportConfig::from_json("{ not json");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "max_connections": 8 }"#).unwrap();
        file.flush().unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_connections, 8);

        let missing = TransportConfig::from_file(Path::new("/nonexistent/netpump.json"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
