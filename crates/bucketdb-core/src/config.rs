//! Store configuration.
//!
//! One immutable [`StoreConfig`] is validated once and shared (behind an
//! `Arc`) by everything built from it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Embedded engine backing every instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// One hash-table file per bucket
    Hash,
    /// One LSM-tree directory per instance, buckets multiplexed by key prefix
    Lsm,
}

/// Sync mode for log writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Call fsync after every write (strongest durability)
    Sync,
    /// Flush to the OS after every write, fsync on rotation and close
    Async,
    /// No fsync (fastest, unsafe for power loss)
    None,
}

/// Hash engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Append buffer size in bytes
    pub map_size: u64,
    /// Expected number of keys; pre-sizes the index
    pub bucket_size: u64,
    /// Record alignment in bytes; every frame is padded to a multiple
    pub record_align: u64,
    /// Durability of each write
    pub sync_mode: SyncMode,
    /// Dead bytes a data file must hold before it is merged; a merge also
    /// needs more dead than live bytes
    pub merge_min_bytes: u64,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            map_size: 10 * 1024 * 1024, // 10MB
            bucket_size: 1_048_583,
            record_align: 128,
            sync_mode: SyncMode::Async,
            merge_min_bytes: 1024 * 1024,
        }
    }
}

/// LSM engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LsmConfig {
    /// Memtable size that triggers a flush
    pub memtable_size: u64,
    /// Level-0 table count that triggers a compaction
    pub level0_trigger: usize,
    /// Durability of each WAL append
    pub sync_mode: SyncMode,
    /// Maximum WAL segment size before rotation
    pub max_segment_size: u64,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            memtable_size: 4 * 1024 * 1024,
            level0_trigger: 4,
            sync_mode: SyncMode::Async,
            max_segment_size: 64 * 1024 * 1024,
        }
    }
}

/// Read/write cache in front of the LSM engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the cache is created at all
    pub enabled: bool,
    /// Capacity in megabytes
    pub size_mb: u64,
    /// Puts refresh the cached record instead of invalidating it
    pub put_fill_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size_mb: 256,
            put_fill_cache: false,
        }
    }
}

/// Complete store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for all engine files
    pub data_dir: PathBuf,
    /// Engine used by every instance
    pub engine: EngineKind,
    /// Number of physical instances; buckets route by `bucket % instance_count`
    pub instance_count: u32,
    /// Store-wide switch for version checking; ANDed with the request flag
    pub version_care: bool,
    /// Stripe count of each instance's write lock
    pub lock_stripes: usize,
    /// Hash engine section
    pub hash: HashConfig,
    /// LSM engine section
    pub lsm: LsmConfig,
    /// Cache section
    pub cache: CacheConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            engine: EngineKind::Lsm,
            instance_count: 1,
            version_care: true,
            lock_stripes: 128,
            hash: HashConfig::default(),
            lsm: LsmConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Configuration rooted at `data_dir` with defaults elsewhere.
    pub fn new(data_dir: impl Into<PathBuf>, engine: EngineKind) -> Self {
        Self {
            data_dir: data_dir.into(),
            engine,
            ..Default::default()
        }
    }

    /// Rejects settings no instance can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("data_dir is empty".into()));
        }
        if self.instance_count == 0 {
            return Err(Error::InvalidConfig("instance_count must be > 0".into()));
        }
        if self.lock_stripes == 0 {
            return Err(Error::InvalidConfig("lock_stripes must be > 0".into()));
        }
        if self.hash.record_align == 0 {
            return Err(Error::InvalidConfig("record_align must be > 0".into()));
        }
        if self.lsm.level0_trigger == 0 {
            return Err(Error::InvalidConfig("level0_trigger must be > 0".into()));
        }
        Ok(())
    }

    /// Cache capacity in bytes, or `None` when the cache is disabled.
    pub fn cache_bytes(&self) -> Option<u64> {
        (self.cache.enabled && self.cache.size_mb > 0).then(|| self.cache.size_mb * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.instance_count, 1);
        assert_eq!(config.lock_stripes, 128);
        assert!(config.version_care);
        assert_eq!(config.hash.map_size, 10 * 1024 * 1024);
        assert_eq!(config.hash.bucket_size, 1_048_583);
        assert_eq!(config.hash.record_align, 128);
        assert_eq!(config.cache_bytes(), Some(256 * 1024 * 1024));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_instances() {
        let config = StoreConfig {
            instance_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_stripes_and_align() {
        let mut config = StoreConfig::default();
        config.lock_stripes = 0;
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.hash.record_align = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_cache() {
        let mut config = StoreConfig::new("/tmp/x", EngineKind::Hash);
        config.cache.enabled = false;
        assert_eq!(config.cache_bytes(), None);
    }
}
