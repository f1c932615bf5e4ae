//! Channel Policy
//!
//! Fixed mapping of channel index to reliability mode. Index 0 is always
//! reliable-ordered and index 1 always unreliable so peers agree on a baseline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConfigError;
use crate::native::SendFlags;

/// Reliability mode carried by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// Delivered once, in order
    Reliable,
    /// May be lost; stale packets are discarded
    Unreliable,
    /// May be lost or arrive out of order
    Unsequenced,
}

impl ChannelMode {
    /// Native send flags for this mode
    pub fn flags(self) -> SendFlags {
        match self {
            ChannelMode::Reliable => SendFlags::RELIABLE,
            ChannelMode::Unreliable => SendFlags::NONE,
            ChannelMode::Unsequenced => SendFlags::UNSEQUENCED,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Channel {channel} out of range ({count} channels configured)")]
pub struct ChannelError {
    pub channel: u8,
    pub count: usize,
}

/// Immutable channel table, validated on construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPolicy {
    modes: Vec<ChannelMode>,
}

impl ChannelPolicy {
    pub fn new(modes: Vec<ChannelMode>) -> Result<Self, ConfigError> {
        if modes.len() < 2 {
            return Err(ConfigError::TooFewChannels(modes.len()));
        }
        if modes.len() > u8::MAX as usize {
            return Err(ConfigError::TooManyChannels(modes.len()));
        }
        for (index, expected) in [(0, ChannelMode::Reliable), (1, ChannelMode::Unreliable)] {
            if modes[index] != expected {
                return Err(ConfigError::ChannelConvention {
                    index,
                    expected,
                    actual: modes[index],
                });
            }
        }
        Ok(ChannelPolicy { modes })
    }

    pub fn lookup(&self, channel: u8) -> Result<ChannelMode, ChannelError> {
        self.modes
            .get(channel as usize)
            .copied()
            .ok_or(ChannelError {
                channel,
                count: self.modes.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        ChannelPolicy {
            modes: vec![ChannelMode::Reliable, ChannelMode::Unreliable],
        }
    }
}
