//! Full-bucket scans and bucket/area-bounded range scans
//!
//! Both walk an engine cursor one owned entry at a time, decode the record
//! and skip anything expired. A [`ScanCursor`] exports a whole bucket; a
//! [`RangeScan`] stops at the first key outside its (bucket, area) pair.

use bucketdb_core::key::{bucket_key, split_bucket_key, BUCKET_PREFIX_SIZE};
use bucketdb_core::{record, Error, KeyLayout, RecordMeta, Result, TransferItem};
use bucketdb_engine::{EngineCursor, KvEngine};

/// One step of a full scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStep {
    Item(TransferItem),
    /// No more records in the bucket
    End,
}

/// Forward iterator over one bucket of a storage instance
pub struct ScanCursor {
    bucket: u32,
    layout: KeyLayout,
    inner: Box<dyn EngineCursor>,
    finished: bool,
    yielded: u64,
    skipped_expired: u64,
}

impl ScanCursor {
    pub(crate) fn new(bucket: u32, layout: KeyLayout, inner: Box<dyn EngineCursor>) -> Self {
        Self {
            bucket,
            layout,
            inner,
            finished: false,
            yielded: 0,
            skipped_expired: 0,
        }
    }

    pub fn bucket(&self) -> u32 {
        self.bucket
    }

    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    pub fn skipped_expired(&self) -> u64 {
        self.skipped_expired
    }

    /// Next live record, exported with its `area || key`.
    pub fn next_item(&mut self, now: u32) -> Result<ScanStep> {
        if self.finished {
            return Ok(ScanStep::End);
        }
        while let Some(entry) = self.inner.next_entry()? {
            let key = match self.layout {
                KeyLayout::Area => entry.key,
                KeyLayout::BucketArea => match split_bucket_key(&entry.key) {
                    Some((bucket, _, _)) if bucket == self.bucket => {
                        entry.key[BUCKET_PREFIX_SIZE..].to_vec()
                    }
                    _ => break,
                },
            };

            let view = record::decode(&entry.value)?;
            if view.meta.is_expired(now) {
                self.skipped_expired += 1;
                continue;
            }
            self.yielded += 1;
            return Ok(ScanStep::Item(TransferItem {
                key,
                value: view.value.to_vec(),
                meta: view.meta,
            }));
        }
        self.finished = true;
        Ok(ScanStep::End)
    }
}

/// A record returned by a range scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeItem {
    /// Key with the bucket and area prefix stripped
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub meta: RecordMeta,
}

/// Caller-owned range iteration over one (bucket, area) pair of an ordered
/// store. Each call to [`RangeScan::step`] makes progress by one record.
pub struct RangeScan {
    bucket: u32,
    area: u16,
    start: Vec<u8>,
    cursor: Option<Box<dyn EngineCursor>>,
    done: Option<bool>,
}

impl RangeScan {
    /// Starts at the first key >= `start` within `bucket`/`area`.
    pub fn new(bucket: u32, area: u16, start: &[u8]) -> Self {
        Self {
            bucket,
            area,
            start: start.to_vec(),
            cursor: None,
            done: None,
        }
    }

    pub fn bucket(&self) -> u32 {
        self.bucket
    }

    pub fn area(&self) -> u16 {
        self.area
    }

    /// `Ok(Some(item))` for the next live record, `Ok(None)` once the store
    /// itself is exhausted, `Err(EndOfRange)` at the first key of another
    /// bucket or area.
    pub(crate) fn step(&mut self, engine: &dyn KvEngine, now: u32) -> Result<Option<RangeItem>> {
        match self.done {
            Some(true) => return Err(Error::EndOfRange),
            Some(false) => return Ok(None),
            None => {}
        }
        if !engine.is_ordered() {
            return Err(Error::InvalidOperation(format!(
                "range scan needs an ordered engine, {} is not",
                engine.name()
            )));
        }
        if self.cursor.is_none() {
            let seek = bucket_key(self.bucket, self.area, &self.start);
            self.cursor = Some(engine.cursor(Some(&seek))?);
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };

        let mut boundary = false;
        let mut found = None;
        while let Some(entry) = cursor.next_entry()? {
            let Some((bucket, area, key)) = split_bucket_key(&entry.key) else {
                boundary = true;
                break;
            };
            if bucket != self.bucket || area != self.area {
                boundary = true;
                break;
            }
            let view = record::decode(&entry.value)?;
            if view.meta.is_expired(now) {
                continue;
            }
            found = Some(RangeItem {
                key: key.to_vec(),
                value: view.value.to_vec(),
                meta: view.meta,
            });
            break;
        }
        if found.is_some() {
            return Ok(found);
        }

        self.cursor = None;
        self.done = Some(boundary);
        if boundary {
            Err(Error::EndOfRange)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketdb_core::key::{area_key, bucket_key};
    use bucketdb_core::LsmConfig;
    use bucketdb_engine::LsmEngine;
    use tempfile::TempDir;

    fn live(value: &[u8]) -> Vec<u8> {
        let meta = RecordMeta {
            version: 1,
            create_time: 10,
            modify_time: 10,
            expire_time: 0,
        };
        record::encode(&meta, value)
    }

    fn expired(value: &[u8]) -> Vec<u8> {
        let meta = RecordMeta {
            version: 1,
            create_time: 10,
            modify_time: 10,
            expire_time: 20,
        };
        record::encode(&meta, value)
    }

    fn engine(dir: &TempDir) -> LsmEngine {
        LsmEngine::open(dir.path(), &LsmConfig::default()).unwrap()
    }

    #[test]
    fn test_scan_stops_at_bucket_edge() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir);
        engine.put(&bucket_key(3, 1, b"a"), &live(b"1")).unwrap();
        engine.put(&bucket_key(3, 1, b"b"), &expired(b"2")).unwrap();
        engine.put(&bucket_key(3, 2, b"c"), &live(b"3")).unwrap();
        engine.put(&bucket_key(4, 1, b"d"), &live(b"4")).unwrap();

        let inner = engine.cursor(Some(&3u32.to_be_bytes())).unwrap();
        let mut scan = ScanCursor::new(3, KeyLayout::BucketArea, inner);

        let mut keys = Vec::new();
        while let ScanStep::Item(item) = scan.next_item(100).unwrap() {
            keys.push(item.key);
        }
        assert_eq!(keys, vec![area_key(1, b"a"), area_key(2, b"c")]);
        assert_eq!(scan.skipped_expired(), 1);
        assert_eq!(scan.next_item(100).unwrap(), ScanStep::End);
    }

    #[test]
    fn test_range_scan_end_of_range() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir);
        engine.put(&bucket_key(5, 2, b"k1"), &live(b"1")).unwrap();
        engine.put(&bucket_key(5, 2, b"k2"), &live(b"2")).unwrap();
        engine.put(&bucket_key(5, 3, b"k1"), &live(b"3")).unwrap();

        let mut range = RangeScan::new(5, 2, b"");
        let first = range.step(&engine, 100).unwrap().unwrap();
        assert_eq!(first.key, b"k1");
        assert_eq!(first.value, b"1");
        assert_eq!(range.step(&engine, 100).unwrap().unwrap().key, b"k2");
        assert!(matches!(range.step(&engine, 100), Err(Error::EndOfRange)));
        assert!(matches!(range.step(&engine, 100), Err(Error::EndOfRange)));
    }

    #[test]
    fn test_range_scan_end_of_store() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir);
        engine.put(&bucket_key(9, 1, b"x"), &live(b"1")).unwrap();
        engine.put(&bucket_key(9, 1, b"y"), &expired(b"2")).unwrap();

        let mut range = RangeScan::new(9, 1, b"x");
        assert!(range.step(&engine, 100).unwrap().is_some());
        assert!(range.step(&engine, 100).unwrap().is_none());
        assert!(range.step(&engine, 100).unwrap().is_none());
    }
}
