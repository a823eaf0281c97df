//! Configuration management with file persistence

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::cache::ReplacementPolicy;
use crate::error::{Error, Result};

/// Dispatch layer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub maintenance: MaintenanceConfig,
}

/// Retry and backoff tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay for exponential backoff, in milliseconds
    pub base_backoff_ms: u64,
    /// Upper bound (exclusive) for uniform backoff jitter, in milliseconds
    pub max_jitter_ms: u64,
}

/// Circuit breaker defaults applied when a route does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Cooldown before an open circuit allows a half-open trial, in milliseconds
    pub reset_ms: u64,
}

/// Cache sizing and policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum estimated size of all cached values, in bytes
    pub max_size_bytes: usize,
    /// Eviction policy used when an insert would exceed `max_size_bytes`
    pub policy: ReplacementPolicy,
    /// Default TTL applied to cacheable routes without an explicit TTL, in milliseconds
    pub default_ttl_ms: Option<u64>,
}

/// Background maintenance cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Interval between trend-analysis passes, in seconds
    pub trend_interval_secs: u64,
    /// Interval between cache expiry sweeps, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 500,
            max_jitter_ms: 200,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { reset_ms: 60_000 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 16 * 1024 * 1024,
            policy: ReplacementPolicy::Lru,
            default_ttl_ms: Some(300_000),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            trend_interval_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validate that the configuration is internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.retry.base_backoff_ms == 0 {
            return Err(Error::Config("retry.base_backoff_ms must be > 0".into()));
        }
        if self.cache.max_size_bytes == 0 {
            return Err(Error::Config("cache.max_size_bytes must be > 0".into()));
        }
        if self.maintenance.trend_interval_secs == 0 || self.maintenance.sweep_interval_secs == 0 {
            return Err(Error::Config("maintenance intervals must be > 0".into()));
        }
        Ok(())
    }
}
