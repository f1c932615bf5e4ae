//! Error Types
//!
//! Synchronous errors returned to the host. Worker-loop failures never show up
//! here; they are logged and counted instead.

use thiserror::Error;

use crate::registry::ConnectionId;

/// Facade-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport is already running")]
    AlreadyRunning,
    #[error("Transport is not running")]
    NotRunning,
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Reasons a send is rejected locally, before anything is queued
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendRejected {
    #[error("Transport is not running")]
    NotRunning,
    #[error("Channel {channel} out of range ({count} channels configured)")]
    ChannelOutOfRange { channel: u8, count: usize },
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("Payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Outgoing queue is full")]
    QueueFull,
}

/// Configuration validation and loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("At least 2 channels are required, got {0}")]
    TooFewChannels(usize),
    #[error("At most 255 channels are supported, got {0}")]
    TooManyChannels(usize),
    #[error("Channel {index} must be {expected:?}, got {actual:?}")]
    ChannelConvention {
        index: usize,
        expected: crate::channel::ChannelMode,
        actual: crate::channel::ChannelMode,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("Pool classes must be non-empty and strictly increasing")]
    PoolClasses,
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Buffer return violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Buffer lease {0} was already returned")]
    DoubleReturn(u64),
    #[error("Buffer belongs to another pool")]
    ForeignBuffer,
    #[error("Buffer was allocated outside the pool")]
    Unpooled,
}
