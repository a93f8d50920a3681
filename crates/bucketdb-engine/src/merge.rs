//! K-way merge over sorted entry sources
//!
//! Sources are ranked by age: rank 0 is the newest. When several sources
//! hold the same key only the newest entry is yielded.

use crate::memtable::MemtableEntry;
use crate::sstable::TableEntry;
use bucketdb_core::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A sorted stream of table entries
pub trait EntrySource: Send {
    fn next_entry(&mut self) -> Result<Option<TableEntry>>;
}

/// Owned memtable contents as an entry source
pub struct MemtableSource {
    entries: std::vec::IntoIter<(Vec<u8>, MemtableEntry)>,
}

impl MemtableSource {
    pub fn new(entries: Vec<(Vec<u8>, MemtableEntry)>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }
}

impl EntrySource for MemtableSource {
    fn next_entry(&mut self) -> Result<Option<TableEntry>> {
        Ok(self.entries.next().map(|(key, entry)| TableEntry {
            key,
            value: entry.into_value(),
        }))
    }
}

struct HeapItem {
    entry: TableEntry,
    rank: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key == other.entry.key && self.rank == other.rank
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: smallest key first, then lowest rank (newest)
        other
            .entry
            .key
            .cmp(&self.entry.key)
            .then_with(|| other.rank.cmp(&self.rank))
    }
}

/// Merges sources into one ascending stream with newest-wins semantics.
/// Tombstones are yielded; callers decide whether to drop them.
pub struct MergeIterator {
    sources: Vec<Box<dyn EntrySource>>,
    heap: BinaryHeap<HeapItem>,
}

impl MergeIterator {
    /// `sources` must be ordered newest first.
    pub fn new(mut sources: Vec<Box<dyn EntrySource>>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (rank, source) in sources.iter_mut().enumerate() {
            if let Some(entry) = source.next_entry()? {
                heap.push(HeapItem { entry, rank });
            }
        }
        Ok(Self { sources, heap })
    }

    fn refill(&mut self, rank: usize) -> Result<()> {
        if let Some(entry) = self.sources[rank].next_entry()? {
            self.heap.push(HeapItem { entry, rank });
        }
        Ok(())
    }

    pub fn next_entry(&mut self) -> Result<Option<TableEntry>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(top.rank)?;

        // Shadowed versions of the same key from older sources
        while let Some(next) = self.heap.peek() {
            if next.entry.key != top.entry.key {
                break;
            }
            let rank = next.rank;
            self.heap.pop();
            self.refill(rank)?;
        }
        Ok(Some(top.entry))
    }
}
