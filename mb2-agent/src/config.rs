//! Session configuration.
//!
//! Tuning knobs for one backup session, loadable from a TOML file with
//! sensible defaults matching the reference protocol behavior.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::device::ConnectionMethod;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Protocol versions offered to the device, in preference order
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<f64>,

    /// Timeout for one blocking message receive, in milliseconds
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// Maximum sync-lock acquisition attempts
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,

    /// Sleep between sync-lock attempts, in milliseconds
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,

    /// Preferred device connection method
    #[serde(default)]
    pub connection: ConnectionMethod,
}

// Default values
fn default_supported_versions() -> Vec<f64> {
    vec![2.0, 2.1]
}

fn default_receive_timeout_ms() -> u64 {
    2_000
}

fn default_lock_attempts() -> u32 {
    61
}

fn default_lock_retry_interval_ms() -> u64 {
    1_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            supported_versions: default_supported_versions(),
            receive_timeout_ms: default_receive_timeout_ms(),
            lock_attempts: default_lock_attempts(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            connection: ConnectionMethod::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }
}
