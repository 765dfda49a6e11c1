//! Cluster configuration
//!
//! Plain-data tuning knobs, loadable from YAML. Hooks (discovery source,
//! client factory, observers) are wired separately on `ClusterOptions`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for a cluster instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Delay between topology discovery passes, in milliseconds
    #[serde(default = "default_discover_interval_ms")]
    pub discover_interval_ms: u64,
    /// A discovery pass running longer than this is reported as slow, in
    /// milliseconds
    #[serde(default = "default_discover_warn_ms")]
    pub discover_warn_ms: u64,
    /// Hard ceiling on waiting for a rediscovery, as a multiple of the
    /// discovery interval
    #[serde(default = "default_discover_timeout_factor")]
    pub discover_timeout_factor: u32,
    /// Delay before a coalesced rediscovery actually starts, in
    /// milliseconds
    #[serde(default = "default_rediscover_delay_ms")]
    pub rediscover_delay_ms: u64,
    /// Maximum attempts per logical operation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Replication position staleness bound per connection, in
    /// milliseconds
    #[serde(default = "default_replication_refresh_ms")]
    pub replication_refresh_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            discover_interval_ms: default_discover_interval_ms(),
            discover_warn_ms: default_discover_warn_ms(),
            discover_timeout_factor: default_discover_timeout_factor(),
            rediscover_delay_ms: default_rediscover_delay_ms(),
            max_attempts: default_max_attempts(),
            replication_refresh_ms: default_replication_refresh_ms(),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: ClusterConfig) {
        if other.discover_interval_ms > 0 {
            self.discover_interval_ms = other.discover_interval_ms;
        }
        if other.discover_warn_ms > 0 {
            self.discover_warn_ms = other.discover_warn_ms;
        }
        if other.discover_timeout_factor > 0 {
            self.discover_timeout_factor = other.discover_timeout_factor;
        }
        if other.rediscover_delay_ms > 0 {
            self.rediscover_delay_ms = other.rediscover_delay_ms;
        }
        if other.max_attempts > 0 {
            self.max_attempts = other.max_attempts;
        }
        if other.replication_refresh_ms > 0 {
            self.replication_refresh_ms = other.replication_refresh_ms;
        }
    }

    /// Get discovery interval as Duration
    pub fn discover_interval(&self) -> Duration {
        Duration::from_millis(self.discover_interval_ms)
    }

    /// Get slow-discovery warning threshold as Duration
    pub fn discover_warn(&self) -> Duration {
        Duration::from_millis(self.discover_warn_ms)
    }

    /// Hard ceiling on rediscovery waits
    pub fn discover_timeout(&self) -> Duration {
        self.discover_interval() * self.discover_timeout_factor
    }

    /// Get coalesced rediscovery delay as Duration
    pub fn rediscover_delay(&self) -> Duration {
        Duration::from_millis(self.rediscover_delay_ms)
    }

    /// Get replication refresh interval as Duration
    pub fn replication_refresh(&self) -> Duration {
        Duration::from_millis(self.replication_refresh_ms)
    }
}

// Default value functions

fn default_discover_interval_ms() -> u64 {
    10_000
}

fn default_discover_warn_ms() -> u64 {
    5_000
}

fn default_discover_timeout_factor() -> u32 {
    3
}

fn default_rediscover_delay_ms() -> u64 {
    50
}

fn default_max_attempts() -> usize {
    5
}

fn default_replication_refresh_ms() -> u64 {
    1_000
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}
