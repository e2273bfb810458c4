//! Configuration for a process-group node
//!
//! Defaults cover the common case; a TOML file can override any field.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PgResult;

/// Lower bound for the waiter's polling interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Node-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgConfig {
    /// Optional human-readable label used in logs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Scopes started when the directory boots
    pub scopes: Vec<String>,
    /// Capacity of each scope's change-event broadcast channel
    pub event_buffer: usize,
    /// Service waiter settings
    pub waiter: WaiterConfig,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            scopes: vec!["pg".to_string()],
            event_buffer: 1024,
            waiter: WaiterConfig::default(),
        }
    }
}

impl PgConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> PgResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> PgResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> PgResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Settings for [`crate::discovery::ServiceWaiter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaiterConfig {
    /// Fallback polling interval in milliseconds
    pub poll_interval_ms: u64,
    /// Timeout used when the caller does not supply one
    pub default_timeout_ms: u64,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            default_timeout_ms: 30_000,
        }
    }
}

impl WaiterConfig {
    /// Polling interval, never below [`MIN_POLL_INTERVAL`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).max(MIN_POLL_INTERVAL)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
