//! Configuration types for bagcache
//!
//! The composition root loads a [`CacheConfig`] once (usually from TOML) and
//! hands the relevant sections to the handle pool and its per-bag caches.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Root configuration for the bag cache
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of concurrently open bag handles
    pub max_open: usize,
    /// Seconds a handle may stay unused before it is evicted
    pub idle_ttl_secs: u64,
    /// Default log level when `RUST_LOG` is not set
    pub log_level: String,
    /// Per-bag metadata store
    pub metadata: MetadataCacheConfig,
    /// Per-bag raw record cache
    pub records: RecordCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_open: 3,
            idle_ttl_secs: 300,
            log_level: "info".to_string(),
            metadata: MetadataCacheConfig::default(),
            records: RecordCacheConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a TOML file
    ///
    /// Missing keys take their defaults. An unreadable or malformed file is
    /// an error, as is a configuration that fails [`validate`](Self::validate).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&raw)?;
        info!(path = %path.display(), "loaded cache configuration");
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the cache cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_open == 0 {
            return Err(Error::configuration("max_open must be at least 1"));
        }
        if self.metadata.max_bytes == 0 {
            return Err(Error::configuration("metadata.max_bytes must be positive"));
        }
        if self.records.max_bytes == 0 || self.records.max_per_series == 0 {
            return Err(Error::configuration("record cache budgets must be positive"));
        }
        if self.records.max_per_series > self.records.max_bytes {
            return Err(Error::configuration(format!(
                "records.max_per_series ({}) exceeds records.max_bytes ({})",
                self.records.max_per_series, self.records.max_bytes
            )));
        }
        Ok(())
    }

    /// Idle time after which a handle is evicted
    #[must_use]
    pub const fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// Byte budget and TTL for the per-bag metadata store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataCacheConfig {
    /// Total bytes of metadata kept per bag
    pub max_bytes: u64,
    /// Default entry lifetime in seconds
    pub ttl_secs: u64,
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024, // 1 MB
            ttl_secs: 60 * 60,      // 1 hour
        }
    }
}

impl MetadataCacheConfig {
    /// Default entry lifetime
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Limits for the per-bag raw record cache
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordCacheConfig {
    /// Total bytes of records kept per bag
    pub max_bytes: u64,
    /// Bytes allowed for a single series
    pub max_per_series: u64,
    /// Series whose first record is larger than this are never cached
    pub raw_size_gate: u64,
}

impl Default for RecordCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024,     // 512 MB
            max_per_series: 50 * 1024 * 1024, // 50 MB
            raw_size_gate: 100_000,           // 100 KB
        }
    }
}
