//! # bucketdb engines
//!
//! The embedded key-value engines a storage instance can sit on. Both
//! implement [`KvEngine`]; callers pick one per instance and never look
//! behind the trait.
//!
//! - [`HashEngine`]: one file per bucket, append-only, hash index in memory.
//!   Iteration follows file order.
//! - [`LsmEngine`]: one directory per instance holding a WAL, sorted tables
//!   and a manifest. Iteration follows key order.

use bucketdb_core::Result;

pub mod compaction;
pub mod hash;
pub mod lsm;
pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod sstable;

pub use hash::HashEngine;
pub use lsm::{LsmEngine, LsmStats};

/// One key/value pair produced by a cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Forward-only iteration over live entries
pub trait EngineCursor: Send {
    /// Next live entry, or `None` when exhausted. Deleted keys are never
    /// returned.
    fn next_entry(&mut self) -> Result<Option<EngineEntry>>;
}

/// Capability set shared by every engine
pub trait KvEngine: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removing an absent key is not an error.
    fn remove(&self, key: &[u8]) -> Result<()>;

    /// Cursor starting at the first key >= `from`. Engines that are not
    /// ordered ignore `from` and start at the beginning.
    fn cursor(&self, from: Option<&[u8]>) -> Result<Box<dyn EngineCursor>>;

    /// True when cursors yield keys in ascending byte order.
    fn is_ordered(&self) -> bool;

    /// Deletes every key in `[start, end)`; `end = None` means unbounded.
    /// Returns the number of keys removed.
    fn delete_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<usize> {
        let in_range = |key: &[u8]| key >= start && end.map_or(true, |end| key < end);
        let mut cursor = self.cursor(Some(start))?;
        let mut doomed = Vec::new();
        while let Some(entry) = cursor.next_entry()? {
            if in_range(&entry.key) {
                doomed.push(entry.key);
            } else if self.is_ordered() {
                break;
            }
        }
        for key in &doomed {
            self.remove(key)?;
        }
        Ok(doomed.len())
    }

    /// Makes every acknowledged write durable.
    fn flush(&self) -> Result<()>;

    /// Flushes and releases file handles. Further calls fail.
    fn close(&self) -> Result<()>;

    /// Closes the engine and deletes its files.
    fn destroy(&self) -> Result<()>;
}
