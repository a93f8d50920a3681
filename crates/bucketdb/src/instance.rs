//! Storage instance - one physical store and the buckets it serves
//!
//! Puts and removes run as read-modify-write under the stripe lock of the
//! physical key. Gets take no lock and rely on the engine's single-key
//! atomicity, so a get racing a put sees either the old or the new record.
//! The one exception is a cache miss on the LSM backend: the fill runs under
//! the stripe lock so it cannot overwrite a newer put's invalidation.

use crate::cache::RecordCache;
use crate::lock::StripedLock;
use crate::scan::{RangeItem, RangeScan, ScanCursor, ScanStep};
use crate::stats::{InstanceCounters, InstanceStats};
use bucketdb_core::key::{area_key, bucket_key, bucket_prefix, prefix_end};
use bucketdb_core::{
    now_secs, record, DataKey, EngineKind, Error, KeyLayout, RecordMeta, Result, StoreConfig,
};
use bucketdb_engine::{HashEngine, KvEngine, LsmEngine};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

type BucketMap = BTreeMap<u32, Arc<dyn KvEngine>>;

/// A live record returned by a get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub meta: RecordMeta,
}

/// Hash engine data file of `bucket`
pub fn hash_file_path(config: &StoreConfig, bucket: u32) -> PathBuf {
    config.data_dir.join(format!("kdb_{:06}.dat", bucket))
}

/// LSM engine directory of instance `index`
pub fn lsm_dir_path(config: &StoreConfig, index: u32) -> PathBuf {
    config.data_dir.join(format!("ldb_{:03}", index))
}

pub struct StorageInstance {
    index: u32,
    config: Arc<StoreConfig>,
    layout: KeyLayout,
    /// Replaced wholesale on every change so readers never wait on
    /// reassignment
    buckets: RwLock<Arc<BucketMap>>,
    /// Serializes bucket set changes; engines open outside `buckets`
    reassign: Mutex<()>,
    /// The single engine all buckets share (LSM only)
    shared: Option<Arc<LsmEngine>>,
    locks: StripedLock,
    cache: Option<Arc<dyn RecordCache>>,
    scan: Mutex<Option<ScanCursor>>,
    counters: InstanceCounters,
}

impl StorageInstance {
    /// Opens instance `index`. The cache is only wired in for the LSM
    /// backend.
    pub fn open(
        index: u32,
        config: Arc<StoreConfig>,
        cache: Option<Arc<dyn RecordCache>>,
    ) -> Result<Self> {
        let (layout, shared, cache) = match config.engine {
            EngineKind::Hash => (KeyLayout::Area, None, None),
            EngineKind::Lsm => {
                let dir = lsm_dir_path(&config, index);
                let engine = LsmEngine::open(&dir, &config.lsm).map_err(|e| {
                    tracing::error!(instance = index, dir = ?dir, error = %e, "failed to open lsm engine");
                    e
                })?;
                (KeyLayout::BucketArea, Some(Arc::new(engine)), cache)
            }
        };
        tracing::info!(
            instance = index,
            engine = ?config.engine,
            stripes = config.lock_stripes,
            cached = cache.is_some(),
            "storage instance opened"
        );

        Ok(Self {
            index,
            layout,
            buckets: RwLock::new(Arc::new(BucketMap::new())),
            reassign: Mutex::new(()),
            shared,
            locks: StripedLock::new(config.lock_stripes),
            cache,
            scan: Mutex::new(None),
            counters: InstanceCounters::default(),
            config,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn layout(&self) -> KeyLayout {
        self.layout
    }

    fn bucket_map(&self) -> Result<Arc<BucketMap>> {
        Ok(Arc::clone(
            &*self.buckets.read().map_err(|_| Error::LockPoisoned)?,
        ))
    }

    fn engine_for(&self, bucket: u32) -> Result<Arc<dyn KvEngine>> {
        self.bucket_map()?
            .get(&bucket)
            .cloned()
            .ok_or(Error::BucketNotOwned(bucket))
    }

    /// Whether this instance currently serves `bucket`.
    pub fn exist(&self, bucket: u32) -> bool {
        self.bucket_map()
            .map(|map| map.contains_key(&bucket))
            .unwrap_or(false)
    }

    /// Buckets currently served, ascending
    pub fn buckets(&self) -> Vec<u32> {
        self.bucket_map()
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Reads the encoded record, through the cache when there is one.
    /// Callers hold the stripe lock of `physical`; cache fills only happen
    /// under it.
    fn read_raw(
        &self,
        engine: &dyn KvEngine,
        area: u16,
        physical: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if let Some(cache) = &self.cache {
            if let Some(raw) = cache.get(physical) {
                return Ok(Some(raw));
            }
        }
        let raw = engine.get(physical)?;
        if let (Some(cache), Some(raw)) = (&self.cache, &raw) {
            cache.put(area, physical, raw);
        }
        Ok(raw)
    }

    /// Writes `value` for `key`, returning the stored metadata.
    ///
    /// `version_care` is honoured only when the store is configured for
    /// it. `expire` is a TTL in seconds; 0 never expires.
    pub fn put(
        &self,
        bucket: u32,
        key: &DataKey,
        value: &[u8],
        version_care: bool,
        expire: u32,
    ) -> Result<RecordMeta> {
        let engine = self.engine_for(bucket)?;
        let version_care = version_care && self.config.version_care;
        let physical = self.layout.encode(bucket, key);

        let _stripe = self.locks.lock(&physical)?;
        let now = now_secs();

        let mut current: Option<RecordMeta> = None;
        if let Some(raw) = self.read_raw(engine.as_ref(), key.area, &physical)? {
            let view = record::decode(&raw)?;
            if !view.meta.is_expired(now) {
                current = Some(view.meta);
            }
        }

        if let Some(stored) = &current {
            if version_care && key.meta.version != 0 && key.meta.version != stored.version {
                InstanceCounters::incr(&self.counters.version_conflicts);
                tracing::debug!(
                    bucket,
                    expected = key.meta.version,
                    stored = stored.version,
                    "version conflict on put"
                );
                return Err(Error::VersionConflict {
                    expected: key.meta.version,
                    stored: stored.version,
                });
            }
        }

        let version = if version_care {
            current.as_ref().map_or(0, |m| m.version).wrapping_add(1).max(1)
        } else {
            key.meta.version
        };
        let meta = if version_care || key.meta.create_time == 0 {
            RecordMeta {
                version,
                create_time: current.as_ref().map_or(now, |m| m.create_time),
                modify_time: now,
                expire_time: if expire > 0 { now.saturating_add(expire) } else { 0 },
            }
        } else {
            RecordMeta {
                version,
                ..key.meta
            }
        };

        let encoded = record::encode(&meta, value);
        if let Err(e) = engine.put(&physical, &encoded) {
            InstanceCounters::incr(&self.counters.write_failures);
            tracing::error!(instance = self.index, bucket, error = %e, "engine put failed");
            if let Some(cache) = &self.cache {
                cache.remove(&physical);
            }
            return Err(e);
        }
        if let Some(cache) = &self.cache {
            if self.config.cache.put_fill_cache {
                cache.put(key.area, &physical, &encoded);
            } else {
                cache.remove(&physical);
            }
        }
        InstanceCounters::incr(&self.counters.puts);
        Ok(meta)
    }

    /// Reads the live record for `key`. Expired records are reported as
    /// [`Error::Expired`], absent ones as [`Error::NotFound`].
    pub fn get(&self, bucket: u32, key: &DataKey) -> Result<StoredValue> {
        let engine = self.engine_for(bucket)?;
        let physical = self.layout.encode(bucket, key);
        InstanceCounters::incr(&self.counters.gets);

        let raw = match &self.cache {
            None => engine.get(&physical)?,
            Some(cache) => match cache.get(&physical) {
                Some(raw) => Some(raw),
                None => {
                    let _stripe = self.locks.lock(&physical)?;
                    self.read_raw(engine.as_ref(), key.area, &physical)?
                }
            },
        };
        let raw = raw.ok_or(Error::NotFound)?;
        let view = record::decode(&raw)?;
        if view.meta.is_expired(now_secs()) {
            InstanceCounters::incr(&self.counters.expired_reads);
            return Err(Error::Expired);
        }
        InstanceCounters::incr(&self.counters.get_hits);
        Ok(StoredValue {
            value: view.value.to_vec(),
            meta: view.meta,
        })
    }

    /// Deletes `key`. An expired record is deleted without a version check.
    pub fn remove(&self, bucket: u32, key: &DataKey, version_care: bool) -> Result<()> {
        let engine = self.engine_for(bucket)?;
        let version_care = version_care && self.config.version_care;
        let physical = self.layout.encode(bucket, key);

        let _stripe = self.locks.lock(&physical)?;
        let raw = self
            .read_raw(engine.as_ref(), key.area, &physical)?
            .ok_or(Error::NotFound)?;
        let view = record::decode(&raw)?;
        let stored = view.meta.version;
        if version_care
            && !view.meta.is_expired(now_secs())
            && key.meta.version != 0
            && key.meta.version != stored
        {
            InstanceCounters::incr(&self.counters.version_conflicts);
            return Err(Error::VersionConflict {
                expected: key.meta.version,
                stored,
            });
        }

        let removed = engine.remove(&physical);
        if let Some(cache) = &self.cache {
            cache.remove(&physical);
        }
        if let Err(e) = removed {
            InstanceCounters::incr(&self.counters.write_failures);
            tracing::error!(instance = self.index, bucket, error = %e, "engine remove failed");
            return Err(e);
        }
        InstanceCounters::incr(&self.counters.removes);
        Ok(())
    }

    /// Deletes every record of `area` in every served bucket, returning
    /// how many were removed.
    pub fn clear_area(&self, area: u16) -> Result<usize> {
        let map = self.bucket_map()?;
        let mut removed = 0;
        match self.layout {
            KeyLayout::Area => {
                let start = area_key(area, b"");
                let end = prefix_end(&start);
                for engine in map.values() {
                    removed += engine.delete_range(&start, end.as_deref())?;
                }
            }
            KeyLayout::BucketArea => {
                for (bucket, engine) in map.iter() {
                    let start = bucket_key(*bucket, area, b"");
                    let end = prefix_end(&start);
                    removed += engine.delete_range(&start, end.as_deref())?;
                }
            }
        }
        if let Some(cache) = &self.cache {
            cache.clear_area(area);
        }
        tracing::info!(instance = self.index, area, removed, "area cleared");
        Ok(removed)
    }

    fn open_bucket(&self, bucket: u32) -> Result<Arc<dyn KvEngine>> {
        match &self.shared {
            Some(shared) => Ok(Arc::clone(shared) as Arc<dyn KvEngine>),
            None => {
                let path = hash_file_path(&self.config, bucket);
                let engine = HashEngine::open(&path, &self.config.hash).map_err(|e| {
                    tracing::error!(bucket, path = ?path, error = %e, "failed to open bucket file");
                    e
                })?;
                Ok(Arc::new(engine))
            }
        }
    }

    /// Starts serving `buckets`. Already served buckets are left alone.
    /// Nothing is published if any bucket fails to open.
    pub fn init_buckets(&self, buckets: &[u32]) -> Result<()> {
        let _reassign = self.reassign.lock().map_err(|_| Error::LockPoisoned)?;
        let current = self.bucket_map()?;
        let mut opened: Vec<(u32, Arc<dyn KvEngine>)> = Vec::new();
        for &bucket in buckets {
            if current.contains_key(&bucket) || opened.iter().any(|(b, _)| *b == bucket) {
                continue;
            }
            match self.open_bucket(bucket) {
                Ok(engine) => opened.push((bucket, engine)),
                Err(e) => {
                    if self.shared.is_none() {
                        for (_, engine) in &opened {
                            let _ = engine.close();
                        }
                    }
                    return Err(e);
                }
            }
        }

        let added: Vec<u32> = opened.iter().map(|(bucket, _)| *bucket).collect();
        {
            let mut guard = self.buckets.write().map_err(|_| Error::LockPoisoned)?;
            let mut next = BucketMap::clone(&guard);
            next.extend(opened);
            *guard = Arc::new(next);
        }
        tracing::info!(instance = self.index, buckets = ?added, "buckets initialized");
        Ok(())
    }

    fn detach(&self, buckets: &[u32]) -> Result<Vec<(u32, Arc<dyn KvEngine>)>> {
        let _reassign = self.reassign.lock().map_err(|_| Error::LockPoisoned)?;
        let mut guard = self.buckets.write().map_err(|_| Error::LockPoisoned)?;
        let mut next = BucketMap::clone(&guard);
        let detached = buckets
            .iter()
            .filter_map(|bucket| next.remove(bucket).map(|engine| (*bucket, engine)))
            .collect();
        *guard = Arc::new(next);
        Ok(detached)
    }

    /// Stops serving `buckets`; their data stays on disk.
    pub fn close_buckets(&self, buckets: &[u32]) -> Result<()> {
        let detached = self.detach(buckets)?;
        let closed: Vec<u32> = detached.iter().map(|(bucket, _)| *bucket).collect();
        if self.shared.is_none() {
            for (bucket, engine) in &detached {
                if let Err(e) = engine.close() {
                    tracing::error!(bucket, error = %e, "failed to close bucket file");
                }
            }
        }
        tracing::info!(instance = self.index, buckets = ?closed, "buckets closed");
        Ok(())
    }

    /// Stops serving `buckets` and deletes their data.
    pub fn destroy_buckets(&self, buckets: &[u32]) -> Result<()> {
        let detached = self.detach(buckets)?;
        let mut first_error = None;
        for (bucket, engine) in &detached {
            let outcome = match &self.shared {
                Some(shared) => {
                    let start = bucket_prefix(*bucket);
                    let end = prefix_end(&start);
                    shared.delete_range(&start, end.as_deref()).map(|_| ())
                }
                None => engine.destroy(),
            };
            if let Some(cache) = &self.cache {
                cache.remove_prefix(&bucket_prefix(*bucket));
            }
            if let Err(e) = outcome {
                tracing::error!(bucket, error = %e, "failed to destroy bucket");
                first_error.get_or_insert(e);
            }
        }
        tracing::info!(instance = self.index, count = detached.len(), "buckets destroyed");
        first_error.map_or(Ok(()), Err)
    }

    /// Opens a fresh scan over `bucket`, replacing any previous one.
    pub fn begin_scan(&self, bucket: u32) -> Result<()> {
        let engine = self.engine_for(bucket)?;
        let inner = match self.layout {
            KeyLayout::Area => engine.cursor(None)?,
            KeyLayout::BucketArea => engine.cursor(Some(&bucket_prefix(bucket)))?,
        };
        *self.scan.lock().map_err(|_| Error::LockPoisoned)? =
            Some(ScanCursor::new(bucket, self.layout, inner));
        tracing::debug!(instance = self.index, bucket, "scan started");
        Ok(())
    }

    /// Next live record of the active scan.
    pub fn get_next(&self) -> Result<ScanStep> {
        let mut slot = self.scan.lock().map_err(|_| Error::LockPoisoned)?;
        let cursor = slot.as_mut().ok_or(Error::ScanNotStarted)?;
        let expired_before = cursor.skipped_expired();
        let step = cursor.next_item(now_secs())?;

        let skipped = cursor.skipped_expired() - expired_before;
        if skipped > 0 {
            self.counters
                .expired_reads
                .fetch_add(skipped, std::sync::atomic::Ordering::Relaxed);
        }
        if matches!(step, ScanStep::Item(_)) {
            InstanceCounters::incr(&self.counters.scanned_items);
        }
        Ok(step)
    }

    /// Drops the active scan, if any.
    pub fn end_scan(&self) -> Result<()> {
        if let Some(cursor) = self.scan.lock().map_err(|_| Error::LockPoisoned)?.take() {
            tracing::debug!(
                instance = self.index,
                bucket = cursor.bucket(),
                yielded = cursor.yielded(),
                "scan ended"
            );
        }
        Ok(())
    }

    /// Advances `scan` by one record. Only ordered backends support it.
    pub fn get_range(&self, scan: &mut RangeScan) -> Result<Option<RangeItem>> {
        let engine = self.engine_for(scan.bucket())?;
        scan.step(engine.as_ref(), now_secs())
    }

    /// Flushes every engine this instance holds.
    pub fn flush(&self) -> Result<()> {
        match &self.shared {
            Some(shared) => shared.flush(),
            None => {
                for engine in self.bucket_map()?.values() {
                    engine.flush()?;
                }
                Ok(())
            }
        }
    }

    /// Ends any scan and closes every engine.
    pub fn close(&self) -> Result<()> {
        self.end_scan()?;
        let detached = self.detach(&self.buckets())?;
        match &self.shared {
            Some(shared) => shared.close()?,
            None => {
                for (_, engine) in &detached {
                    engine.close()?;
                }
            }
        }
        tracing::info!(instance = self.index, "storage instance closed");
        Ok(())
    }

    pub fn stats(&self) -> InstanceStats {
        self.counters
            .snapshot(self.index, self.bucket_map().map(|m| m.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn instance(dir: &TempDir, engine: EngineKind) -> StorageInstance {
        let config = Arc::new(StoreConfig::new(dir.path(), engine));
        let instance = StorageInstance::open(0, config, None).unwrap();
        instance.init_buckets(&[1, 2]).unwrap();
        instance
    }

    #[test]
    fn test_versions_increment() {
        let temp_dir = TempDir::new().unwrap();
        for kind in [EngineKind::Hash, EngineKind::Lsm] {
            let instance = instance(&temp_dir, kind);
            let key = DataKey::new(1, format!("{:?}", kind));
            assert_eq!(instance.put(1, &key, b"a", true, 0).unwrap().version, 1);
            assert_eq!(instance.put(1, &key, b"b", true, 0).unwrap().version, 2);

            let stored = instance.get(1, &key).unwrap();
            assert_eq!(stored.value, b"b");
            assert_eq!(stored.meta.version, 2);
            instance.close().unwrap();
        }
    }

    #[test]
    fn test_unowned_bucket_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let instance = instance(&temp_dir, EngineKind::Hash);
        let key = DataKey::new(0, "k");
        assert!(matches!(
            instance.put(9, &key, b"v", true, 0),
            Err(Error::BucketNotOwned(9))
        ));
        assert!(!instance.exist(9));
        assert!(instance.exist(2));
    }

    #[test]
    fn test_hash_bucket_files_named_by_bucket() {
        let temp_dir = TempDir::new().unwrap();
        let _instance = instance(&temp_dir, EngineKind::Hash);
        assert!(temp_dir.path().join("kdb_000001.dat").exists());
        assert!(temp_dir.path().join("kdb_000002.dat").exists());
    }

    #[test]
    fn test_version_care_disabled_by_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = StoreConfig::new(temp_dir.path(), EngineKind::Lsm);
        config.version_care = false;
        let instance = StorageInstance::open(0, Arc::new(config), None).unwrap();
        instance.init_buckets(&[1]).unwrap();

        let key = DataKey::new(1, "k").with_version(7);
        assert_eq!(instance.put(1, &key, b"v", true, 0).unwrap().version, 7);
        let stale = DataKey::new(1, "k").with_version(3);
        assert_eq!(instance.put(1, &stale, b"w", true, 0).unwrap().version, 3);
    }

    #[test]
    fn test_replayed_metadata_kept_verbatim() {
        let temp_dir = TempDir::new().unwrap();
        let instance = instance(&temp_dir, EngineKind::Hash);
        let meta = RecordMeta {
            version: 42,
            create_time: 1000,
            modify_time: 2000,
            expire_time: 0,
        };
        let key = DataKey::new(3, "replayed").with_meta(meta);
        assert_eq!(instance.put(2, &key, b"v", false, 0).unwrap(), meta);
        assert_eq!(instance.get(2, &key).unwrap().meta, meta);
    }

    #[test]
    fn test_puts_succeed_while_lsm_flush_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = StoreConfig::new(temp_dir.path(), EngineKind::Lsm);
        config.lsm.memtable_size = 256;
        let config = Arc::new(config);
        let instance = StorageInstance::open(0, Arc::clone(&config), None).unwrap();
        instance.init_buckets(&[0]).unwrap();
        // Directories where the table files belong make every flush fail
        let dir = lsm_dir_path(&config, 0);
        for id in 1..=40 {
            std::fs::create_dir(bucketdb_engine::sstable::table_path(&dir, id)).unwrap();
        }

        for i in 0..30 {
            let key = DataKey::new(1, format!("k{:02}", i));
            assert_eq!(instance.put(0, &key, b"value", true, 0).unwrap().version, 1);
        }
        let key = DataKey::new(1, "k00").with_version(1);
        assert_eq!(instance.put(0, &key, b"again", true, 0).unwrap().version, 2);
        assert_eq!(instance.get(0, &key).unwrap().value, b"again");
        assert_eq!(instance.stats().write_failures, 0);
    }

    #[test]
    fn test_close_buckets_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let instance = instance(&temp_dir, EngineKind::Hash);
        let key = DataKey::new(0, "k");
        instance.put(1, &key, b"v", true, 0).unwrap();

        instance.close_buckets(&[1]).unwrap();
        assert!(matches!(instance.get(1, &key), Err(Error::BucketNotOwned(1))));

        instance.init_buckets(&[1]).unwrap();
        assert_eq!(instance.get(1, &key).unwrap().value, b"v");
    }

    #[test]
    fn test_destroy_buckets_deletes_data() {
        let temp_dir = TempDir::new().unwrap();
        for kind in [EngineKind::Hash, EngineKind::Lsm] {
            let instance = instance(&temp_dir, kind);
            let key = DataKey::new(0, "doomed");
            instance.put(1, &key, b"v", true, 0).unwrap();
            instance.put(2, &key, b"v", true, 0).unwrap();

            instance.destroy_buckets(&[1]).unwrap();
            instance.init_buckets(&[1]).unwrap();
            assert!(matches!(instance.get(1, &key), Err(Error::NotFound)));
            assert!(instance.get(2, &key).is_ok());
            instance.destroy_buckets(&[1, 2]).unwrap();
            instance.close().unwrap();
        }
    }

    #[test]
    fn test_clear_area() {
        let temp_dir = TempDir::new().unwrap();
        for kind in [EngineKind::Hash, EngineKind::Lsm] {
            let instance = instance(&temp_dir, kind);
            for (bucket, area, name) in [(1, 1, "a"), (1, 2, "b"), (2, 1, "c"), (2, 3, "d")] {
                instance
                    .put(bucket, &DataKey::new(area, name), b"v", true, 0)
                    .unwrap();
            }
            assert_eq!(instance.clear_area(1).unwrap(), 2);
            assert!(matches!(
                instance.get(1, &DataKey::new(1, "a")),
                Err(Error::NotFound)
            ));
            assert!(instance.get(1, &DataKey::new(2, "b")).is_ok());
            instance.destroy_buckets(&[1, 2]).unwrap();
            instance.close().unwrap();
        }
    }

    #[test]
    fn test_range_scan_unsupported_on_hash() {
        let temp_dir = TempDir::new().unwrap();
        let instance = instance(&temp_dir, EngineKind::Hash);
        let mut scan = RangeScan::new(1, 0, b"");
        assert!(matches!(
            instance.get_range(&mut scan),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_get_next_without_scan() {
        let temp_dir = TempDir::new().unwrap();
        let instance = instance(&temp_dir, EngineKind::Lsm);
        assert!(matches!(instance.get_next(), Err(Error::ScanNotStarted)));
        instance.end_scan().unwrap();
    }
}
