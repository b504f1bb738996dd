//! Pipeline configuration types
//!
//! This module defines the bus parameters handed to a transport connector and
//! the tuning knobs of the pipeline workers. Both are plain serde structs so the
//! application layer can load them from its own configuration file.

use crate::types::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bus parameters for opening a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Channel name (e.g. "vcan0", "can1")
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Interface / driver name (e.g. "virtual", "socketcan")
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Nominal bitrate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    /// Enable CAN-FD framing
    #[serde(default)]
    pub fd: bool,
}

fn default_channel() -> String {
    "vcan0".to_string()
}

fn default_interface() -> String {
    "virtual".to_string()
}

fn default_bitrate() -> u32 {
    500_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            interface: default_interface(),
            bitrate: default_bitrate(),
            fd: false,
        }
    }
}

impl BusConfig {
    /// Create a bus configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Builder method: set the interface
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// Builder method: set the bitrate
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Builder method: enable or disable CAN-FD
    pub fn with_fd(mut self, enabled: bool) -> Self {
        self.fd = enabled;
        self
    }

    /// Check parameters that no driver could accept
    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(PipelineError::ConfigurationError(
                "channel must not be empty".to_string(),
            ));
        }
        if self.interface.trim().is_empty() {
            return Err(PipelineError::ConfigurationError(
                "interface must not be empty".to_string(),
            ));
        }
        if self.bitrate == 0 {
            return Err(PipelineError::ConfigurationError(
                "bitrate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tuning parameters for the pipeline workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Receive timeout of the bus worker in milliseconds (default: 100ms)
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,

    /// Upper bound on waiting for a worker to finish in milliseconds (default: 1000ms)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    /// Number of frames kept in the receive history (default: 2000)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Shortest allowed generator period in milliseconds (default: 10ms)
    #[serde(default = "default_min_generator_period")]
    pub min_generator_period_ms: u64,

    /// Directory for session recordings (default: "logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_receive_timeout() -> u64 {
    100
}

fn default_stop_timeout() -> u64 {
    1000
}

fn default_history_capacity() -> usize {
    2000
}

fn default_min_generator_period() -> u64 {
    10
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: default_receive_timeout(),
            stop_timeout_ms: default_stop_timeout(),
            history_capacity: default_history_capacity(),
            min_generator_period_ms: default_min_generator_period(),
            log_dir: default_log_dir(),
        }
    }
}

impl PipelineConfig {
    /// Create a pipeline configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the receive timeout
    pub fn with_receive_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.receive_timeout_ms = timeout_ms;
        self
    }

    /// Builder method: set the worker stop timeout
    pub fn with_stop_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.stop_timeout_ms = timeout_ms;
        self
    }

    /// Builder method: set the history capacity
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Builder method: set the recording directory
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn min_generator_period(&self) -> Duration {
        Duration::from_millis(self.min_generator_period_ms.max(1))
    }

    /// Check the configuration for values the workers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            return Err(PipelineError::ConfigurationError(
                "history capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
