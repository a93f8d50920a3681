//! Compaction - merging tables to bound read amplification
//!
//! A compaction takes every live table, merges them newest-wins and writes
//! a single level-1 table. Since no older data survives outside the output,
//! tombstones are dropped along with the values they shadow.

use crate::merge::{EntrySource, MergeIterator};
use crate::sstable::{table_path, TableMeta, TableReader, TableWriter};
use bucketdb_core::Result;
use std::path::Path;

/// Level written by a full compaction
pub const COMPACTED_LEVEL: u32 = 1;

/// Totals of one compaction run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub tables_in: usize,
    pub entries_in: u64,
    pub entries_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Merges `inputs` (newest first) into table `output_id`.
///
/// Returns `None` when everything was deleted; no file is left behind in
/// that case.
pub fn compact(
    dir: &Path,
    inputs: &[TableMeta],
    output_id: u64,
) -> Result<(Option<TableMeta>, CompactionStats)> {
    let mut stats = CompactionStats {
        tables_in: inputs.len(),
        ..Default::default()
    };

    let mut sources: Vec<Box<dyn EntrySource>> = Vec::with_capacity(inputs.len());
    for meta in inputs {
        stats.entries_in += meta.entry_count;
        stats.bytes_in += meta.file_size;
        let reader = TableReader::open(&table_path(dir, meta.id))?;
        sources.push(Box::new(reader.into_scanner(None)?));
    }

    let output_path = table_path(dir, output_id);
    let mut writer = TableWriter::create(&output_path)?;
    let mut merge = MergeIterator::new(sources)?;
    while let Some(entry) = merge.next_entry()? {
        if entry.value.is_some() {
            writer.add(&entry)?;
            stats.entries_out += 1;
        }
    }
    let meta = writer.finish(output_id, COMPACTED_LEVEL)?;

    if meta.entry_count == 0 {
        std::fs::remove_file(&output_path)?;
        return Ok((None, stats));
    }
    stats.bytes_out = meta.file_size;
    Ok((Some(meta), stats))
}

/// Removes table files no longer referenced by the manifest.
pub fn delete_tables(dir: &Path, tables: &[TableMeta]) -> usize {
    let mut deleted = 0;
    for meta in tables {
        let path = table_path(dir, meta.id);
        match std::fs::remove_file(&path) {
            Ok(()) => deleted += 1,
            Err(e) => tracing::warn!(path = ?path, error = %e, "failed to delete compacted table"),
        }
    }
    deleted
}
