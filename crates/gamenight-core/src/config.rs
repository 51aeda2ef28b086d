//! Configuration for the cache and realtime layers
//!
//! Loaded from an optional TOML file; every field has a default so an
//! empty or missing file yields a working configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the tiered cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix put in front of every durable-tier key
    pub durable_prefix: String,

    /// TTL used when a caller does not pick one
    pub default_ttl_ms: u64,

    /// Interval of the optional expired-entry sweep (None = no sweeper)
    pub sweep_interval_ms: Option<u64>,

    /// Capacity of the cache event broadcast channel
    pub event_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            durable_prefix: "@gamenight_cache:".to_string(),
            default_ttl_ms: 300_000,
            sweep_interval_ms: None,
            event_capacity: 256,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_ms.map(Duration::from_millis)
    }
}

/// Configuration for change subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Database schema the watched tables live in
    pub schema: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub cache: CacheConfig,
    pub realtime: RealtimeConfig,
}

impl CoreConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.default_ttl_ms == 0 {
            return Err(ConfigError::Invalid {
                message: "cache.default_ttl_ms must be positive".to_string(),
            });
        }
        if self.cache.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "cache.event_capacity must be positive".to_string(),
            });
        }
        if self.cache.sweep_interval_ms == Some(0) {
            return Err(ConfigError::Invalid {
                message: "cache.sweep_interval_ms must be positive when set".to_string(),
            });
        }
        if self.realtime.schema.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "realtime.schema must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
