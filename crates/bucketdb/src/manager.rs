//! Instance manager - routes buckets to storage instances
//!
//! Routing is `bucket % instance_count` followed by an ownership check on
//! the chosen instance. Bucket-set changes and scan sessions are serialized
//! by one manager-wide lock; ordinary traffic never takes it.

use crate::cache::{MemoryCache, RecordCache};
use crate::instance::{StorageInstance, StoredValue};
use crate::scan::{RangeItem, RangeScan, ScanStep};
use crate::stats::StoreStats;
use bucketdb_core::{DataKey, Error, RecordMeta, Result, StoreConfig, TransferItem};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Outcome of [`InstanceManager::get_next_items`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanBatch {
    /// Items appended to the buffer
    pub items: usize,
    /// True when the bucket has no more records
    pub exhausted: bool,
}

/// The bucket an active scan session reads from
#[derive(Debug, Clone, Copy)]
struct ScanTarget {
    instance: usize,
    bucket: u32,
}

pub struct InstanceManager {
    config: Arc<StoreConfig>,
    instances: Vec<StorageInstance>,
    cache: Option<Arc<dyn RecordCache>>,
    /// Serializes bucket-set changes
    admin: Mutex<()>,
    scan: Mutex<Option<ScanTarget>>,
}

impl InstanceManager {
    /// Opens every instance described by `config`. The LSM backend gets a
    /// [`MemoryCache`] when the cache is enabled.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let cache = match (config.engine, config.cache_bytes()) {
            (bucketdb_core::EngineKind::Lsm, Some(bytes)) => {
                Some(Arc::new(MemoryCache::new(bytes)) as Arc<dyn RecordCache>)
            }
            _ => None,
        };
        Self::build(config, cache)
    }

    /// Opens every instance with a caller-supplied cache.
    pub fn with_cache(config: StoreConfig, cache: Arc<dyn RecordCache>) -> Result<Self> {
        Self::build(config, Some(cache))
    }

    fn build(config: StoreConfig, cache: Option<Arc<dyn RecordCache>>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let config = Arc::new(config);

        let mut instances = Vec::with_capacity(config.instance_count as usize);
        for index in 0..config.instance_count {
            instances.push(StorageInstance::open(
                index,
                Arc::clone(&config),
                cache.clone(),
            )?);
        }
        tracing::warn!(
            data_dir = ?config.data_dir,
            engine = ?config.engine,
            instances = instances.len(),
            version_care = config.version_care,
            cache = cache.as_ref().map(|c| c.stats().capacity),
            "instance manager ready"
        );

        Ok(Self {
            config,
            instances,
            cache,
            admin: Mutex::new(()),
            scan: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Index of the instance `bucket` maps to, owned or not.
    pub fn instance_index(&self, bucket: u32) -> usize {
        (bucket % self.config.instance_count) as usize
    }

    /// The instance serving `bucket`, if one currently owns it.
    pub fn route(&self, bucket: u32) -> Option<&StorageInstance> {
        self.instances
            .get(self.instance_index(bucket))
            .filter(|instance| instance.exist(bucket))
    }

    fn owner(&self, bucket: u32) -> Result<&StorageInstance> {
        self.route(bucket).ok_or_else(|| {
            tracing::error!(bucket, "bucket not served by any instance");
            Error::BucketNotOwned(bucket)
        })
    }

    pub fn exist(&self, bucket: u32) -> bool {
        self.route(bucket).is_some()
    }

    pub fn put(
        &self,
        bucket: u32,
        key: &DataKey,
        value: &[u8],
        version_care: bool,
        expire: u32,
    ) -> Result<RecordMeta> {
        tracing::debug!(bucket, area = key.area, len = value.len(), "put");
        self.owner(bucket)?
            .put(bucket, key, value, version_care, expire)
    }

    pub fn get(&self, bucket: u32, key: &DataKey) -> Result<StoredValue> {
        tracing::debug!(bucket, area = key.area, "get");
        self.owner(bucket)?.get(bucket, key)
    }

    pub fn remove(&self, bucket: u32, key: &DataKey, version_care: bool) -> Result<()> {
        tracing::debug!(bucket, area = key.area, "remove");
        self.owner(bucket)?.remove(bucket, key, version_care)
    }

    /// Clears `area` on every instance. Every instance is attempted; the
    /// first failure is returned.
    pub fn clear(&self, area: u16) -> Result<usize> {
        let mut removed = 0;
        let mut first_error = None;
        for instance in &self.instances {
            match instance.clear_area(area) {
                Ok(count) => removed += count,
                Err(e) => {
                    tracing::error!(instance = instance.index(), area, error = %e, "clear failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(removed), Err)
    }

    fn partition(&self, buckets: &[u32]) -> BTreeMap<usize, Vec<u32>> {
        let mut parts: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
        for &bucket in buckets {
            parts
                .entry(self.instance_index(bucket))
                .or_default()
                .push(bucket);
        }
        parts
    }

    fn for_each_partition<F>(&self, buckets: &[u32], op: F) -> Result<()>
    where
        F: Fn(&StorageInstance, &[u32]) -> Result<()>,
    {
        let _admin = self.admin.lock().map_err(|_| Error::LockPoisoned)?;
        for (index, part) in self.partition(buckets) {
            let Some(instance) = self.instances.get(index) else {
                continue;
            };
            op(instance, &part)?;
        }
        Ok(())
    }

    /// Assigns `buckets` to the instances they route to.
    pub fn init_buckets(&self, buckets: &[u32]) -> Result<()> {
        self.for_each_partition(buckets, |instance, part| instance.init_buckets(part))
    }

    /// Unassigns `buckets`, keeping their data.
    pub fn close_buckets(&self, buckets: &[u32]) -> Result<()> {
        self.for_each_partition(buckets, |instance, part| instance.close_buckets(part))
    }

    /// Unassigns `buckets` and deletes their data.
    pub fn destroy_buckets(&self, buckets: &[u32]) -> Result<()> {
        self.for_each_partition(buckets, |instance, part| instance.destroy_buckets(part))
    }

    /// Starts the manager-wide scan session over `bucket`, ending any
    /// previous one.
    pub fn begin_scan(&self, bucket: u32) -> Result<()> {
        let mut slot = self.scan.lock().map_err(|_| Error::LockPoisoned)?;
        if let Some(previous) = slot.take() {
            if let Some(instance) = self.instances.get(previous.instance) {
                instance.end_scan()?;
            }
        }
        let instance = self.owner(bucket)?;
        instance.begin_scan(bucket)?;
        *slot = Some(ScanTarget {
            instance: self.instance_index(bucket),
            bucket,
        });
        Ok(())
    }

    fn scan_owner(&self) -> Result<&StorageInstance> {
        let target = (*self.scan.lock().map_err(|_| Error::LockPoisoned)?)
            .ok_or(Error::ScanNotStarted)?;
        self.instances
            .get(target.instance)
            .ok_or(Error::BucketNotOwned(target.bucket))
    }

    /// Next live record of the active scan.
    pub fn get_next(&self) -> Result<ScanStep> {
        self.scan_owner()?.get_next()
    }

    /// Appends up to `limit` transfer-encoded items to `buf`.
    pub fn get_next_items(&self, buf: &mut Vec<u8>, limit: usize) -> Result<ScanBatch> {
        let instance = self.scan_owner()?;
        let mut items = 0;
        while items < limit {
            match instance.get_next()? {
                ScanStep::Item(item) => {
                    item.encode_into(buf);
                    items += 1;
                }
                ScanStep::End => {
                    return Ok(ScanBatch {
                        items,
                        exhausted: true,
                    })
                }
            }
        }
        Ok(ScanBatch {
            items,
            exhausted: false,
        })
    }

    /// Convenience over [`InstanceManager::get_next_items`] that decodes
    /// the batch again.
    pub fn next_batch(&self, limit: usize) -> Result<(Vec<TransferItem>, bool)> {
        let mut buf = Vec::new();
        let batch = self.get_next_items(&mut buf, limit)?;
        Ok((TransferItem::decode_all(&buf)?, batch.exhausted))
    }

    /// Ends the active scan session. Calling it without one is a no-op.
    pub fn end_scan(&self) -> Result<()> {
        let mut slot = self.scan.lock().map_err(|_| Error::LockPoisoned)?;
        if let Some(target) = slot.take() {
            if let Some(instance) = self.instances.get(target.instance) {
                instance.end_scan()?;
            }
        }
        Ok(())
    }

    /// Advances a caller-owned range scan by one record.
    pub fn get_range(&self, scan: &mut RangeScan) -> Result<Option<RangeItem>> {
        self.owner(scan.bucket())?.get_range(scan)
    }

    /// Caps the cache bytes of `area`; a no-op without a cache.
    pub fn set_area_quota(&self, area: u16, quota: u64) {
        if let Some(cache) = &self.cache {
            cache.set_area_quota(area, quota);
        }
    }

    pub fn set_area_quotas(&self, quotas: &HashMap<u16, u64>) {
        if let Some(cache) = &self.cache {
            cache.set_area_quotas(quotas);
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats::new(
            self.instances.iter().map(|i| i.stats()).collect(),
            self.cache.as_ref().map(|c| c.stats()),
        )
    }

    /// Makes every acknowledged write durable.
    pub fn flush(&self) -> Result<()> {
        for instance in &self.instances {
            instance.flush()?;
        }
        Ok(())
    }

    /// Ends the scan session and closes every instance, returning the first
    /// failure.
    pub fn close(&self) -> Result<()> {
        self.end_scan()?;
        let mut first_error = None;
        for instance in &self.instances {
            if let Err(e) = instance.close() {
                tracing::error!(instance = instance.index(), error = %e, "close failed");
                first_error.get_or_insert(e);
            }
        }
        tracing::info!(instances = self.instances.len(), "instance manager closed");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketdb_core::EngineKind;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, instances: u32) -> InstanceManager {
        let mut config = StoreConfig::new(dir.path(), EngineKind::Hash);
        config.instance_count = instances;
        InstanceManager::open(config).unwrap()
    }

    #[test]
    fn test_routing_checks_ownership() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 3);
        manager.init_buckets(&[0, 1, 2, 4]).unwrap();

        assert_eq!(manager.route(4).map(|i| i.index()), Some(1));
        assert_eq!(manager.route(2).map(|i| i.index()), Some(2));
        assert!(manager.route(5).is_none());
        assert!(!manager.exist(7));
        assert_eq!(manager.stats().total.buckets, 4);
    }

    #[test]
    fn test_zero_instances_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = StoreConfig::new(temp_dir.path(), EngineKind::Lsm);
        config.instance_count = 0;
        assert!(matches!(
            InstanceManager::open(config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_hash_backend_has_no_cache() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);
        manager.set_area_quota(1, 100);
        assert!(manager.stats().cache.is_none());
    }

    #[test]
    fn test_scan_requires_owned_bucket() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 2);
        assert!(matches!(
            manager.begin_scan(3),
            Err(Error::BucketNotOwned(3))
        ));
        assert!(matches!(manager.get_next(), Err(Error::ScanNotStarted)));
        manager.end_scan().unwrap();
    }
}
