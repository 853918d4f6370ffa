//! Configuration for the reference client

use anyhow::Result;
use porthole::{DriverConfig, WaitPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Simulated device and peer
    #[serde(default)]
    pub device: DeviceConfig,

    /// Message sent to the peer
    #[serde(default)]
    pub message: MessageConfig,
}

/// Simulated device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Delay between command polls (nanoseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ns: u64,

    /// Give up on a command after this long (milliseconds); unset waits for
    /// the device's own timeout
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    /// Polls the simulated device takes to service each command
    #[serde(default)]
    pub command_latency: u32,

    /// Time before the peer attaches (milliseconds)
    #[serde(default = "default_peer_delay")]
    pub connect_delay_ms: u64,

    /// Time the peer stays attached after the buffer is released (milliseconds)
    #[serde(default = "default_peer_delay")]
    pub disconnect_delay_ms: u64,

    /// Insert a physical gap after every this many pages (0 = contiguous)
    #[serde(default)]
    pub fragment_stride: u64,

    /// How long the client waits for connect/disconnect (milliseconds)
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ns: default_poll_interval(),
            deadline_ms: None,
            command_latency: 0,
            connect_delay_ms: default_peer_delay(),
            disconnect_delay_ms: default_peer_delay(),
            fragment_stride: 0,
            wait_timeout_ms: default_wait_timeout(),
        }
    }
}

impl DeviceConfig {
    /// Driver configuration derived from these settings
    pub fn driver_config(&self) -> DriverConfig {
        let interval = Duration::from_nanos(self.poll_interval_ns);
        let wait = match self.deadline_ms {
            Some(ms) => WaitPolicy::bounded(interval, Duration::from_millis(ms)),
            None => WaitPolicy::unbounded(interval),
        };
        DriverConfig { wait }
    }

    /// Time before the peer attaches
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    /// Time the peer lingers after the buffer is released
    pub fn disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_delay_ms)
    }

    /// How long to wait on an event
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Message settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageConfig {
    /// Message type tag
    #[serde(rename = "type", default = "default_msg_type")]
    pub msg_type: u32,

    /// Bytes of ring following the setup header
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,

    /// Text repeated through the ring
    #[serde(default = "default_text")]
    pub text: String,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            msg_type: default_msg_type(),
            ring_size: default_ring_size(),
            text: default_text(),
        }
    }
}

fn default_poll_interval() -> u64 {
    100
}

fn default_peer_delay() -> u64 {
    50
}

fn default_wait_timeout() -> u64 {
    5000
}

fn default_msg_type() -> u32 {
    1
}

fn default_ring_size() -> u32 {
    16384
}

fn default_text() -> String {
    "Test message from the guest".to_string()
}

impl ClientConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_yaml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
