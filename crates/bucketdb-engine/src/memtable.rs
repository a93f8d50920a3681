//! Memtable - in-memory sorted write buffer of the LSM engine
//!
//! Deletes are kept as tombstones so they shadow older values still living
//! in SSTables until a full compaction drops both.

use std::collections::BTreeMap;
use std::ops::Bound;

/// Entry value in the memtable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableEntry {
    /// A live value
    Value(Vec<u8>),
    /// A deletion marker
    Tombstone,
}

impl MemtableEntry {
    fn size(&self) -> u64 {
        match self {
            MemtableEntry::Value(v) => v.len() as u64 + 1,
            MemtableEntry::Tombstone => 1,
        }
    }

    /// The value, or `None` for a tombstone.
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            MemtableEntry::Value(v) => Some(v),
            MemtableEntry::Tombstone => None,
        }
    }
}

/// Sorted write buffer with approximate size accounting
#[derive(Debug, Default)]
pub struct Memtable {
    data: BTreeMap<Vec<u8>, MemtableEntry>,
    size_bytes: u64,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, key: Vec<u8>, entry: MemtableEntry) {
        let key_size = key.len() as u64;
        let added = entry.size();
        match self.data.insert(key, entry) {
            Some(old) => self.size_bytes = self.size_bytes - old.size() + added,
            None => self.size_bytes += key_size + added,
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.insert(key, MemtableEntry::Value(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.insert(key, MemtableEntry::Tombstone);
    }

    /// - `Some(Some(value))`: live value
    /// - `Some(None)`: tombstone
    /// - `None`: not in this memtable
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.data.get(key).map(|entry| match entry {
            MemtableEntry::Value(v) => Some(v.as_slice()),
            MemtableEntry::Tombstone => None,
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies every entry at or after `from` (all entries for `None`).
    pub fn snapshot_from(&self, from: Option<&[u8]>) -> Vec<(Vec<u8>, MemtableEntry)> {
        let lower = match from {
            Some(start) => Bound::Included(start),
            None => Bound::Unbounded,
        };
        self.data
            .range::<[u8], _>((lower, Bound::Unbounded))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &MemtableEntry)> {
        self.data.iter()
    }
}
