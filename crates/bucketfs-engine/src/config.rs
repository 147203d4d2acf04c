//! Engine and cache configuration.
//!
//! Defaults suit an object store a few milliseconds away. Tests usually
//! shrink `capacity_bytes` to force eviction and set `write_back(false)`
//! to observe backend puts synchronously.

use std::time::Duration;

use bucketfs_core::ConfigError;
use serde::{Deserialize, Serialize};

/// Default block sizes: 4 KiB, 16 KiB, 64 KiB, 256 KiB, 1 MiB.
pub const DEFAULT_SIZE_CLASSES: [usize; 5] = [4 << 10, 16 << 10, 64 << 10, 256 << 10, 1 << 20];

/// Default total cache capacity (256 MiB).
pub const DEFAULT_CAPACITY: u64 = 256 << 20;

/// Default validity of cached reads and reply attributes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Cache pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Block sizes, strictly increasing. Capacity is split evenly between them.
    pub size_classes: Vec<usize>,

    /// Total bytes of block storage across all classes.
    pub capacity_bytes: u64,

    /// How long a clean block (and a clean file's length) stays valid.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Acknowledge writes against the cache and flush later.
    ///
    /// When false every write is put to the backend before it returns.
    pub write_back: bool,

    /// A file dirty for longer than this is flushed by the background sweep.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Period of the background sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Maximum files the sweep flushes or expires per tick.
    pub sweep_batch: usize,

    /// Background flush attempts before a file waits for an explicit fsync.
    pub max_flush_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_classes: DEFAULT_SIZE_CLASSES.to_vec(),
            capacity_bytes: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
            write_back: true,
            flush_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(500),
            sweep_batch: 64,
            max_flush_retries: 5,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn size_classes(mut self, classes: impl Into<Vec<usize>>) -> Self {
        self.size_classes = classes.into();
        self
    }

    #[must_use]
    pub fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn write_back(mut self, enabled: bool) -> Self {
        self.write_back = enabled;
        self
    }

    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn max_flush_retries(mut self, retries: u32) -> Self {
        self.max_flush_retries = retries;
        self
    }

    /// Number of blocks each size class gets (at least one).
    pub fn slots_per_class(&self, block_size: usize) -> usize {
        let classes = self.size_classes.len().max(1) as u64;
        let share = self.capacity_bytes / classes;
        usize::try_from(share / block_size as u64)
            .unwrap_or(usize::MAX)
            .clamp(1, u32::MAX as usize - 1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_classes.is_empty() {
            return Err(invalid("cache.size_classes", "at least one size class is required"));
        }
        if self.size_classes.contains(&0) {
            return Err(invalid("cache.size_classes", "block sizes must be non-zero"));
        }
        if self.size_classes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("cache.size_classes", "block sizes must be strictly increasing"));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid("cache.sweep_interval", "must be greater than zero"));
        }
        if self.sweep_batch == 0 {
            return Err(invalid("cache.sweep_batch", "must be at least 1"));
        }
        Ok(())
    }
}

/// Operation engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,

    /// Validity transports may give to returned attributes.
    #[serde(with = "humantime_serde")]
    pub attr_ttl: Duration,

    /// Validity transports may give to returned name lookups.
    #[serde(with = "humantime_serde")]
    pub entry_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            attr_ttl: DEFAULT_TTL,
            entry_ttl: DEFAULT_TTL,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    #[must_use]
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.size_classes, vec![4096, 16384, 65536, 262144, 1048576]);
        assert_eq!(config.cache.capacity_bytes, 256 * 1024 * 1024);
        assert_eq!(config.cache.ttl, Duration::from_secs(5));
        assert!(config.cache.write_back);
        assert_eq!(config.attr_ttl, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let cache = CacheConfig::default()
            .size_classes(vec![4096])
            .capacity_bytes(64 * 1024)
            .write_back(false);
        assert_eq!(cache.slots_per_class(4096), 16);
        assert!(!cache.write_back);
    }

    #[test]
    fn test_validate_rejects_unsorted_classes() {
        let cache = CacheConfig::default().size_classes(vec![16384, 4096]);
        assert!(matches!(
            cache.validate(),
            Err(ConfigError::InvalidValue {
                field: "cache.size_classes",
                ..
            })
        ));
    }

    #[test]
    fn test_tiny_capacity_still_gets_one_block() {
        let cache = CacheConfig::default().capacity_bytes(1);
        assert_eq!(cache.slots_per_class(1 << 20), 1);
    }

    #[test]
    fn test_deserialize_humantime() {
        let json = r#"{ "cache": { "ttl": "250ms", "write_back": false }, "entry_ttl": "1s" }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cache.ttl, Duration::from_millis(250));
        assert!(!config.cache.write_back);
        assert_eq!(config.cache.sweep_batch, 64);
        assert_eq!(config.entry_ttl, Duration::from_secs(1));
    }
}
