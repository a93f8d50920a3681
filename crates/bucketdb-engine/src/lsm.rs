//! LSM engine - memtable, WAL, sorted tables and a manifest in one directory
//!
//! ```text
//! Writes → WAL → Memtable ──flush──→ L0 tables ──compact──→ one L1 table
//! ```
//!
//! Reads consult the live memtable, then memtables waiting to be flushed,
//! then tables newest first. Cursors merge all of them in key order.

use crate::compaction::{self, CompactionStats};
use crate::manifest::Manifest;
use crate::memtable::Memtable;
use crate::merge::{EntrySource, MemtableSource, MergeIterator};
use crate::sstable::{table_path, TableEntry, TableMeta, TableReader, TableWriter};
use crate::{EngineCursor, EngineEntry, KvEngine};
use bucketdb_core::{Error, LsmConfig, Result};
use bucketdb_wal::{RecordPayload, WalConfig, WalManager, WalRecord};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

struct TableHandle {
    meta: TableMeta,
    reader: Mutex<TableReader>,
}

impl TableHandle {
    fn open(dir: &Path, meta: TableMeta) -> Result<Self> {
        let reader = TableReader::open(&table_path(dir, meta.id))?;
        Ok(Self {
            meta,
            reader: Mutex::new(reader),
        })
    }

    fn may_contain(&self, key: &[u8]) -> bool {
        key >= self.meta.min_key.as_slice() && key <= self.meta.max_key.as_slice()
    }
}

/// Point-in-time counters of an LSM engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LsmStats {
    pub memtable_bytes: u64,
    pub memtable_entries: usize,
    pub pending_flushes: usize,
    pub table_count: usize,
    pub level0_tables: usize,
    pub table_bytes: u64,
    pub flushes: u64,
    pub compactions: u64,
}

/// Ordered engine shared by every bucket of one storage instance
pub struct LsmEngine {
    dir: PathBuf,
    config: LsmConfig,
    memtable: RwLock<Memtable>,
    /// Frozen memtables whose tables are not written yet, newest last
    immutable: RwLock<Vec<Arc<Memtable>>>,
    /// Newest first
    tables: RwLock<Vec<Arc<TableHandle>>>,
    wal: Mutex<WalManager>,
    manifest: Mutex<Manifest>,
    /// Serializes flush and compaction. Holds the frozen memtables still
    /// to be written, oldest first, with the WAL segment that follows each.
    flush_lock: Mutex<Vec<(Arc<Memtable>, u64)>>,
    closed: AtomicBool,
    flushes: AtomicU64,
    compactions: AtomicU64,
}

impl LsmEngine {
    /// Opens or creates the engine in `dir`, replaying its WAL.
    pub fn open(dir: &Path, config: &LsmConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("Failed to create {:?}: {}", dir, e)))?;

        let manifest = Manifest::open(dir)?;
        let mut tables = Vec::new();
        for meta in manifest.tables() {
            tables.push(Arc::new(TableHandle::open(dir, meta)?));
        }

        let mut wal = WalManager::new(WalConfig {
            sync_mode: config.sync_mode,
            max_segment_size: config.max_segment_size,
            wal_dir: dir.join("wal"),
        });
        let (records, recovery) = wal.recover()?;
        wal.open()?;

        let mut memtable = Memtable::new();
        for record in records {
            match record.payload {
                RecordPayload::Put { key, value } => memtable.put(key, value),
                RecordPayload::Delete { key } => memtable.delete(key),
                RecordPayload::Checkpoint { .. } => {}
            }
        }

        tracing::info!(
            dir = ?dir,
            tables = tables.len(),
            replayed = recovery.records,
            torn_tails = recovery.torn_tails,
            "lsm engine opened"
        );

        let engine = Self {
            dir: dir.to_path_buf(),
            config: config.clone(),
            memtable: RwLock::new(memtable),
            immutable: RwLock::new(Vec::new()),
            tables: RwLock::new(tables),
            wal: Mutex::new(wal),
            manifest: Mutex::new(manifest),
            flush_lock: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        };
        engine.try_flush();
        Ok(engine)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation("lsm engine closed".to_string()));
        }
        Ok(())
    }

    fn log_and_apply(&self, record: WalRecord) -> Result<()> {
        self.check_open()?;
        {
            // WAL order must match memtable order
            let mut wal = self.wal.lock().map_err(|_| Error::LockPoisoned)?;
            wal.append(&record)?;
            let mut memtable = self.memtable.write().map_err(|_| Error::LockPoisoned)?;
            match record.payload {
                RecordPayload::Put { key, value } => memtable.put(key, value),
                RecordPayload::Delete { key } => memtable.delete(key),
                RecordPayload::Checkpoint { .. } => {}
            }
        }
        self.try_flush();
        Ok(())
    }

    /// Flushes when the memtable is full. The write that triggered it is
    /// already logged and applied, so a failure only delays the flush.
    fn try_flush(&self) {
        if let Err(e) = self.maybe_flush() {
            tracing::error!(dir = ?self.dir, error = %e, "memtable flush failed, will retry");
        }
    }

    fn maybe_flush(&self) -> Result<()> {
        let should_flush = {
            let memtable = self.memtable.read().map_err(|_| Error::LockPoisoned)?;
            memtable.size_bytes() >= self.config.memtable_size
        };
        if should_flush {
            self.flush_memtable()?;
        }
        Ok(())
    }

    /// Freezes the live memtable, then writes every frozen memtable out as
    /// a level-0 table, oldest first. A memtable whose table cannot be
    /// written stays frozen and readable and is retried by the next flush.
    pub fn flush_memtable(&self) -> Result<()> {
        let mut pending = self.flush_lock.lock().map_err(|_| Error::LockPoisoned)?;

        {
            let mut wal = self.wal.lock().map_err(|_| Error::LockPoisoned)?;
            let mut memtable = self.memtable.write().map_err(|_| Error::LockPoisoned)?;
            if !memtable.is_empty() {
                let live_segment = wal.rotate()?;
                let frozen = Arc::new(std::mem::take(&mut *memtable));
                self.immutable
                    .write()
                    .map_err(|_| Error::LockPoisoned)?
                    .push(Arc::clone(&frozen));
                pending.push((frozen, live_segment));
            }
        }

        while let Some((frozen, live_segment)) = pending.first().cloned() {
            let level0 = self.write_frozen(&frozen, live_segment)?;
            pending.remove(0);
            if level0 >= self.config.level0_trigger {
                self.compact_locked()?;
            }
        }
        Ok(())
    }

    /// Writes one frozen memtable as a table and returns the level-0 count.
    fn write_frozen(&self, frozen: &Arc<Memtable>, live_segment: u64) -> Result<usize> {
        let id = self
            .manifest
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .allocate_table_id();
        let mut writer = TableWriter::create(&table_path(&self.dir, id))?;
        for (key, entry) in frozen.iter() {
            writer.add(&TableEntry {
                key: key.clone(),
                value: entry.clone().into_value(),
            })?;
        }
        let meta = writer.finish(id, 0)?;
        let handle = Arc::new(TableHandle::open(&self.dir, meta.clone())?);

        let level0 = {
            let mut manifest = self.manifest.lock().map_err(|_| Error::LockPoisoned)?;
            manifest.add_table(meta.clone())?;
            manifest.tables_at_level(0)
        };
        self.tables
            .write()
            .map_err(|_| Error::LockPoisoned)?
            .insert(0, handle);
        self.immutable
            .write()
            .map_err(|_| Error::LockPoisoned)?
            .retain(|m| !Arc::ptr_eq(m, frozen));

        // Replaying a segment whose data is already in a table is harmless
        let truncated = self
            .wal
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .truncate_before(live_segment, id);
        if let Err(e) = truncated {
            tracing::warn!(segment = live_segment, error = %e, "WAL truncation failed");
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            table = id,
            entries = meta.entry_count,
            bytes = meta.file_size,
            "memtable flushed"
        );
        Ok(level0)
    }

    /// Merges every table into one. No-op with fewer than two tables.
    pub fn compact(&self) -> Result<Option<CompactionStats>> {
        self.check_open()?;
        let _flush = self.flush_lock.lock().map_err(|_| Error::LockPoisoned)?;
        self.compact_locked()
    }

    fn compact_locked(&self) -> Result<Option<CompactionStats>> {
        let inputs: Vec<TableMeta> = self
            .tables
            .read()
            .map_err(|_| Error::LockPoisoned)?
            .iter()
            .map(|t| t.meta.clone())
            .collect();
        if inputs.len() < 2 {
            return Ok(None);
        }

        let output_id = self
            .manifest
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .allocate_table_id();
        let (output, stats) = compaction::compact(&self.dir, &inputs, output_id)?;
        let handle = match &output {
            Some(meta) => Some(Arc::new(TableHandle::open(&self.dir, meta.clone())?)),
            None => None,
        };

        let removed: Vec<u64> = inputs.iter().map(|t| t.id).collect();
        self.manifest
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .replace_tables(&removed, output.into_iter().collect())?;
        {
            let mut tables = self.tables.write().map_err(|_| Error::LockPoisoned)?;
            tables.retain(|t| !removed.contains(&t.meta.id));
            tables.extend(handle);
        }
        compaction::delete_tables(&self.dir, &inputs);

        self.compactions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            tables_in = stats.tables_in,
            entries_in = stats.entries_in,
            entries_out = stats.entries_out,
            bytes_out = stats.bytes_out,
            "compaction finished"
        );
        Ok(Some(stats))
    }

    pub fn stats(&self) -> Result<LsmStats> {
        let (memtable_bytes, memtable_entries) = {
            let memtable = self.memtable.read().map_err(|_| Error::LockPoisoned)?;
            (memtable.size_bytes(), memtable.len())
        };
        let pending_flushes = self.immutable.read().map_err(|_| Error::LockPoisoned)?.len();
        let tables = self.tables.read().map_err(|_| Error::LockPoisoned)?;
        Ok(LsmStats {
            memtable_bytes,
            memtable_entries,
            pending_flushes,
            table_count: tables.len(),
            level0_tables: tables.iter().filter(|t| t.meta.level == 0).count(),
            table_bytes: tables.iter().map(|t| t.meta.file_size).sum(),
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        })
    }
}

impl KvEngine for LsmEngine {
    fn name(&self) -> &'static str {
        "lsm"
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        {
            let memtable = self.memtable.read().map_err(|_| Error::LockPoisoned)?;
            if let Some(found) = memtable.get(key) {
                return Ok(found.map(<[u8]>::to_vec));
            }
        }
        {
            let immutable = self.immutable.read().map_err(|_| Error::LockPoisoned)?;
            for frozen in immutable.iter().rev() {
                if let Some(found) = frozen.get(key) {
                    return Ok(found.map(<[u8]>::to_vec));
                }
            }
        }

        let tables = self.tables.read().map_err(|_| Error::LockPoisoned)?.clone();
        for table in tables.iter().filter(|t| t.may_contain(key)) {
            let mut reader = table.reader.lock().map_err(|_| Error::LockPoisoned)?;
            if let Some(found) = reader.get(key)? {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.log_and_apply(WalRecord::put(key.to_vec(), value.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.log_and_apply(WalRecord::delete(key.to_vec()))
    }

    fn cursor(&self, from: Option<&[u8]>) -> Result<Box<dyn EngineCursor>> {
        self.check_open()?;
        let mut sources: Vec<Box<dyn EntrySource>> = Vec::new();

        // Tables stay locked until their files are open so a concurrent
        // compaction cannot delete them underneath us.
        let memtable = self.memtable.read().map_err(|_| Error::LockPoisoned)?;
        let immutable = self.immutable.read().map_err(|_| Error::LockPoisoned)?;
        let tables = self.tables.read().map_err(|_| Error::LockPoisoned)?;

        sources.push(Box::new(MemtableSource::new(memtable.snapshot_from(from))));
        for frozen in immutable.iter().rev() {
            sources.push(Box::new(MemtableSource::new(frozen.snapshot_from(from))));
        }
        for table in tables.iter() {
            let reader = TableReader::open(&table_path(&self.dir, table.meta.id))?;
            sources.push(Box::new(reader.into_scanner(from)?));
        }

        Ok(Box::new(LsmCursor {
            merge: MergeIterator::new(sources)?,
        }))
    }

    fn is_ordered(&self) -> bool {
        true
    }

    fn flush(&self) -> Result<()> {
        self.check_open()?;
        self.flush_memtable()?;
        self.wal.lock().map_err(|_| Error::LockPoisoned)?.sync()
    }

    fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush_memtable()?;
        self.closed.store(true, Ordering::Release);
        self.wal.lock().map_err(|_| Error::LockPoisoned)?.close()?;
        tracing::debug!(dir = ?self.dir, "lsm engine closed");
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.close()?;
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct LsmCursor {
    merge: MergeIterator,
}

impl EngineCursor for LsmCursor {
    fn next_entry(&mut self) -> Result<Option<EngineEntry>> {
        while let Some(entry) = self.merge.next_entry()? {
            if let Some(value) = entry.value {
                return Ok(Some(EngineEntry {
                    key: entry.key,
                    value,
                }));
            }
        }
        Ok(None)
    }
}
