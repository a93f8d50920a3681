//! Hash engine - one append-only data file per bucket
//!
//! Every mutation is appended as a framed log record, zero-padded to the
//! configured record alignment. The key index lives in memory and is
//! rebuilt on open by streaming through the file; the file is truncated at
//! the first frame that fails to decode.
//!
//! Overwritten and deleted records stay in the file as dead bytes until a
//! merge rewrites the live records into a fresh file. A merge runs after an
//! append once dead bytes pass `merge_min_bytes` and outweigh live bytes.
//!
//! Lock order is writer, then reader, then index.

use crate::{EngineCursor, EngineEntry, KvEngine};
use bucketdb_core::{Error, HashConfig, Result, SyncMode};
use bucketdb_wal::{Frame, RecordPayload, WalRecord};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

const MAX_WRITE_BUFFER: u64 = 1024 * 1024;

/// Read buffer used when scanning a data file
const SCAN_BUFFER: usize = 64 * 1024;

/// Upper bound on index slots reserved up front
const MAX_INDEX_PRESIZE: u64 = 4096;

#[derive(Debug, Clone, Copy)]
struct Location {
    offset: u64,
    len: u32,
}

fn align_up(n: u64, align: u64) -> u64 {
    if align <= 1 {
        n
    } else {
        n.div_ceil(align) * align
    }
}

fn closed() -> Error {
    Error::InvalidOperation("hash engine closed".to_string())
}

/// Sibling path a merge writes to before renaming over the data file
fn merge_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".merge");
    PathBuf::from(name)
}

struct DataWriter {
    file: BufWriter<File>,
    capacity: usize,
    end: u64,
    /// Aligned size of the records the index points at
    live: u64,
    /// Set when a failed append could not be rolled back
    broken: bool,
}

impl DataWriter {
    fn new(file: File, capacity: usize, end: u64, live: u64) -> Self {
        Self {
            file: BufWriter::with_capacity(capacity, file),
            capacity,
            end,
            live,
            broken: false,
        }
    }

    fn append(&mut self, frame: &[u8], sync_mode: SyncMode) -> Result<u64> {
        if self.broken {
            return Err(Error::Storage(
                "data file left inconsistent by an earlier failed append".to_string(),
            ));
        }
        let offset = self.end;
        let mut written = self.file.write_all(frame).and_then(|_| self.file.flush());
        if written.is_ok() && sync_mode == SyncMode::Sync {
            written = self.file.get_ref().sync_data();
        }
        if let Err(e) = written {
            if let Err(rollback) = self.rollback() {
                tracing::error!(error = %rollback, "failed to roll back partial append");
                self.broken = true;
            }
            return Err(Error::Storage(format!("Failed to append record: {}", e)));
        }
        self.end += frame.len() as u64;
        Ok(offset)
    }

    /// Drops buffered bytes and cuts the file back to the last whole record.
    fn rollback(&mut self) -> std::io::Result<()> {
        let file = self.file.get_ref().try_clone()?;
        let fresh = BufWriter::with_capacity(self.capacity, file);
        let stale = std::mem::replace(&mut self.file, fresh);
        let _ = stale.into_parts();
        self.file.get_ref().set_len(self.end)?;
        self.file.get_mut().seek(SeekFrom::Start(self.end))?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file
            .flush()
            .and_then(|_| self.file.get_ref().sync_data())
            .map_err(|e| Error::Storage(format!("Failed to sync data file: {}", e)))
    }

    fn dead(&self) -> u64 {
        self.end.saturating_sub(self.live)
    }

    fn should_merge(&self, min_bytes: u64) -> bool {
        let dead = self.dead();
        dead >= min_bytes && dead > self.live
    }
}

struct HashInner {
    path: PathBuf,
    record_align: u64,
    sync_mode: SyncMode,
    merge_min_bytes: u64,
    index: RwLock<HashMap<Vec<u8>, Location>>,
    writer: Mutex<Option<DataWriter>>,
    reader: Mutex<Option<File>>,
}

impl HashInner {
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let frame = {
            let mut reader = self.reader.lock().map_err(|_| Error::LockPoisoned)?;
            let location = self
                .index
                .read()
                .map_err(|_| Error::LockPoisoned)?
                .get(key)
                .copied();
            let Some(location) = location else {
                return Ok(None);
            };
            let file = reader.as_mut().ok_or_else(closed)?;
            let mut frame = vec![0u8; location.len as usize];
            file.seek(SeekFrom::Start(location.offset))
                .and_then(|_| file.read_exact(&mut frame))
                .map_err(|e| Error::Storage(format!("Failed to read record: {}", e)))?;
            frame
        };
        match WalRecord::decode(&frame)? {
            Frame::Complete(
                WalRecord {
                    payload: RecordPayload::Put { value, .. },
                },
                _,
            ) => Ok(Some(value)),
            _ => Err(Error::Corruption(format!(
                "{:?}: no value record for key of {} bytes",
                self.path,
                key.len()
            ))),
        }
    }

    /// Rewrites the live records into a fresh file and swaps it in.
    /// Returns the bytes reclaimed.
    fn merge_locked(&self, writer: &mut DataWriter) -> Result<u64> {
        writer.sync()?;
        let mut entries: Vec<(Vec<u8>, Location)> = self
            .index
            .read()
            .map_err(|_| Error::LockPoisoned)?
            .iter()
            .map(|(key, location)| (key.clone(), *location))
            .collect();
        entries.sort_unstable_by_key(|(_, location)| location.offset);

        let target = merge_path(&self.path);
        let merged = match self.write_merged(&target, &entries) {
            Ok(merged) => merged,
            Err(e) => {
                let _ = std::fs::remove_file(&target);
                return Err(e);
            }
        };

        {
            let mut reader_guard = self.reader.lock().map_err(|_| Error::LockPoisoned)?;
            let mut index = self.index.write().map_err(|_| Error::LockPoisoned)?;
            // Open handles follow the file across the rename
            if let Err(e) = std::fs::rename(&target, &self.path) {
                let _ = std::fs::remove_file(&target);
                return Err(e.into());
            }
            index.extend(merged.relocated);
            *reader_guard = Some(merged.reader);
        }

        let reclaimed = writer.end.saturating_sub(merged.len);
        *writer = DataWriter::new(merged.file, writer.capacity, merged.len, merged.len);
        tracing::info!(
            path = ?self.path,
            live_keys = entries.len(),
            reclaimed,
            "data file merged"
        );
        Ok(reclaimed)
    }

    /// Copies `entries` into `target` back to back, padded.
    fn write_merged(&self, target: &Path, entries: &[(Vec<u8>, Location)]) -> Result<Merged> {
        let mut source = File::open(&self.path)?;
        let mut out = BufWriter::with_capacity(SCAN_BUFFER, File::create(target)?);
        let mut relocated = Vec::with_capacity(entries.len());
        let mut frame = Vec::new();
        let mut offset = 0u64;

        for (key, location) in entries {
            let padded = align_up(location.len as u64, self.record_align);
            frame.clear();
            frame.resize(location.len as usize, 0);
            source.seek(SeekFrom::Start(location.offset))?;
            source.read_exact(&mut frame)?;
            frame.resize(padded as usize, 0);
            out.write_all(&frame)?;
            relocated.push((
                key.clone(),
                Location {
                    offset,
                    len: location.len,
                },
            ));
            offset += padded;
        }

        let out = out.into_inner().map_err(|e| e.into_error())?;
        out.sync_all()?;
        drop(out);

        let mut file = OpenOptions::new().read(true).write(true).open(target)?;
        file.seek(SeekFrom::Start(offset))?;
        let reader = File::open(target)?;
        Ok(Merged {
            relocated,
            len: offset,
            file,
            reader,
        })
    }
}

/// A rewritten data file waiting to replace the current one
struct Merged {
    relocated: Vec<(Vec<u8>, Location)>,
    len: u64,
    /// Write handle positioned at `len`
    file: File,
    reader: File,
}

/// Hash-indexed engine backed by a single data file
pub struct HashEngine {
    inner: Arc<HashInner>,
}

/// What a reopen found in the data file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashRecovery {
    pub records: usize,
    pub live_keys: usize,
    pub live_bytes: u64,
    pub valid_len: u64,
    pub discarded_bytes: u64,
}

impl HashEngine {
    /// Opens or creates the data file at `path`.
    pub fn open(path: &Path, config: &HashConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create {:?}: {}", parent, e)))?;
        }
        let leftover = merge_path(path);
        if leftover.exists() {
            tracing::warn!(path = ?leftover, "removing unfinished merge");
            std::fs::remove_file(&leftover)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Storage(format!("Failed to open {:?}: {}", path, e)))?;

        let presize = config.bucket_size.min(MAX_INDEX_PRESIZE) as usize;
        let (index, recovery) = rebuild_index(&file, config.record_align, presize)?;
        if recovery.discarded_bytes > 0 {
            tracing::warn!(
                path = ?path,
                valid_len = recovery.valid_len,
                discarded = recovery.discarded_bytes,
                "truncating damaged data file tail"
            );
        }
        file.set_len(recovery.valid_len)?;
        file.seek(SeekFrom::Start(recovery.valid_len))?;
        tracing::debug!(
            path = ?path,
            records = recovery.records,
            live_keys = recovery.live_keys,
            live_bytes = recovery.live_bytes,
            "hash engine opened"
        );

        let reader = File::open(path)?;
        let capacity = config.map_size.clamp(4096, MAX_WRITE_BUFFER) as usize;
        Ok(Self {
            inner: Arc::new(HashInner {
                path: path.to_path_buf(),
                record_align: config.record_align,
                sync_mode: config.sync_mode,
                merge_min_bytes: config.merge_min_bytes,
                index: RwLock::new(index),
                writer: Mutex::new(Some(DataWriter::new(
                    file,
                    capacity,
                    recovery.valid_len,
                    recovery.live_bytes,
                ))),
                reader: Mutex::new(Some(reader)),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of live keys
    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.index.read().map_err(|_| Error::LockPoisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Bytes appended so far, padding included
    pub fn file_len(&self) -> Result<u64> {
        let guard = self.inner.writer.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(guard.as_ref().ok_or_else(closed)?.end)
    }

    /// Aligned bytes held by live records
    pub fn live_bytes(&self) -> Result<u64> {
        let guard = self.inner.writer.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(guard.as_ref().ok_or_else(closed)?.live)
    }

    /// Rewrites the data file without dead records, returning the bytes
    /// reclaimed.
    pub fn merge(&self) -> Result<u64> {
        let mut guard = self.inner.writer.lock().map_err(|_| Error::LockPoisoned)?;
        let writer = guard.as_mut().ok_or_else(closed)?;
        if writer.dead() == 0 {
            return Ok(0);
        }
        self.inner.merge_locked(writer)
    }

    fn append(&self, record: WalRecord, key: &[u8], live: bool) -> Result<()> {
        let align = self.inner.record_align;
        let mut frame = record.encode()?;
        let len = frame.len();
        let padded = align_up(len as u64, align);
        frame.resize(padded as usize, 0);

        let mut guard = self.inner.writer.lock().map_err(|_| Error::LockPoisoned)?;
        let writer = guard.as_mut().ok_or_else(closed)?;
        let offset = writer.append(&frame, self.inner.sync_mode)?;

        {
            let mut index = self.inner.index.write().map_err(|_| Error::LockPoisoned)?;
            let previous = if live {
                index.insert(
                    key.to_vec(),
                    Location {
                        offset,
                        len: len as u32,
                    },
                )
            } else {
                index.remove(key)
            };
            if let Some(previous) = previous {
                writer.live = writer
                    .live
                    .saturating_sub(align_up(previous.len as u64, align));
            }
            if live {
                writer.live += padded;
            }
        }

        if writer.should_merge(self.inner.merge_min_bytes) {
            if let Err(e) = self.inner.merge_locked(writer) {
                tracing::warn!(path = ?self.inner.path, error = %e, "data file merge failed");
            }
        }
        Ok(())
    }
}

/// Streams through the data file rebuilding the key index. Stops at the
/// first frame that is short or fails to decode.
fn rebuild_index(
    file: &File,
    record_align: u64,
    presize: usize,
) -> Result<(HashMap<Vec<u8>, Location>, HashRecovery)> {
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::with_capacity(SCAN_BUFFER, file);
    reader.seek(SeekFrom::Start(0))?;

    let mut index = HashMap::with_capacity(presize);
    let mut recovery = HashRecovery::default();
    let mut frame = Vec::new();
    let mut offset = 0u64;

    while offset < file_len {
        if !read_frame(&mut reader, file_len - offset, &mut frame)? {
            break;
        }
        let (record, used) = match WalRecord::decode(&frame) {
            Ok(Frame::Complete(record, used)) => (record, used as u64),
            Ok(Frame::Incomplete) | Err(_) => break,
        };
        recovery.records += 1;
        match record.payload {
            RecordPayload::Put { key, .. } => {
                index.insert(
                    key,
                    Location {
                        offset,
                        len: used as u32,
                    },
                );
            }
            RecordPayload::Delete { key } => {
                index.remove(&key);
            }
            RecordPayload::Checkpoint { .. } => {}
        }
        let next = align_up(offset + used, record_align);
        reader.seek_relative((next - offset - used) as i64)?;
        offset = next;
    }

    recovery.live_keys = index.len();
    recovery.live_bytes = index
        .values()
        .map(|location| align_up(location.len as u64, record_align))
        .sum();
    recovery.valid_len = offset;
    recovery.discarded_bytes = file_len.saturating_sub(offset);
    Ok((index, recovery))
}

/// Reads the next length-prefixed frame into `frame`. Returns false when
/// the header is zero or claims more than `remaining` bytes.
fn read_frame<R: Read>(reader: &mut R, remaining: u64, frame: &mut Vec<u8>) -> Result<bool> {
    if remaining < 4 {
        return Ok(false);
    }
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let length = u32::from_le_bytes(header) as u64;
    let total = 4 + length + 4;
    if length == 0 || total > remaining {
        return Ok(false);
    }
    frame.clear();
    frame.extend_from_slice(&header);
    frame.resize(total as usize, 0);
    reader.read_exact(&mut frame[4..])?;
    Ok(true)
}

impl KvEngine for HashEngine {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.lookup(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(WalRecord::put(key.to_vec(), value.to_vec()), key, true)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        let present = self
            .inner
            .index
            .read()
            .map_err(|_| Error::LockPoisoned)?
            .contains_key(key);
        if !present {
            return Ok(());
        }
        self.append(WalRecord::delete(key.to_vec()), key, false)
    }

    fn cursor(&self, _from: Option<&[u8]>) -> Result<Box<dyn EngineCursor>> {
        let mut keys: Vec<(u64, Vec<u8>)> = self
            .inner
            .index
            .read()
            .map_err(|_| Error::LockPoisoned)?
            .iter()
            .map(|(key, location)| (location.offset, key.clone()))
            .collect();
        keys.sort_unstable_by_key(|(offset, _)| *offset);
        Ok(Box::new(HashCursor {
            inner: Arc::clone(&self.inner),
            pending: keys.into_iter(),
        }))
    }

    fn is_ordered(&self) -> bool {
        false
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self.inner.writer.lock().map_err(|_| Error::LockPoisoned)?;
        match guard.as_mut() {
            Some(writer) => writer.sync(),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<()> {
        let writer = self
            .inner
            .writer
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .take();
        if let Some(mut writer) = writer {
            writer.sync()?;
        }
        self.inner
            .reader
            .lock()
            .map_err(|_| Error::LockPoisoned)?
            .take();
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.close()?;
        self.inner
            .index
            .write()
            .map_err(|_| Error::LockPoisoned)?
            .clear();
        match std::fs::remove_file(&self.inner.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Walks a snapshot of the index in file order, re-checking each key
/// against the live index so deletes made after the snapshot are honored.
struct HashCursor {
    inner: Arc<HashInner>,
    pending: std::vec::IntoIter<(u64, Vec<u8>)>,
}

impl EngineCursor for HashCursor {
    fn next_entry(&mut self) -> Result<Option<EngineEntry>> {
        for (_, key) in self.pending.by_ref() {
            if let Some(value) = self.inner.lookup(&key)? {
                return Ok(Some(EngineEntry { key, value }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> HashConfig {
        HashConfig {
            record_align: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_put_get_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let engine = HashEngine::open(&temp_dir.path().join("kdb.dat"), &config()).unwrap();

        engine.put(b"key", b"one").unwrap();
        engine.put(b"key", b"two").unwrap();
        assert_eq!(engine.get(b"key").unwrap(), Some(b"two".to_vec()));
        assert_eq!(engine.get(b"missing").unwrap(), None);
        assert_eq!(engine.len().unwrap(), 1);
    }

    #[test]
    fn test_records_are_aligned() {
        let temp_dir = TempDir::new().unwrap();
        let engine = HashEngine::open(&temp_dir.path().join("kdb.dat"), &config()).unwrap();

        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", &[7u8; 100]).unwrap();
        let len = engine.file_len().unwrap();
        assert_eq!(len % 64, 0);
        assert_eq!(len, 64 + 128);
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kdb.dat");
        {
            let engine = HashEngine::open(&path, &config()).unwrap();
            engine.put(b"keep", b"1").unwrap();
            engine.put(b"gone", b"2").unwrap();
            engine.remove(b"gone").unwrap();
            engine.put(b"keep", b"3").unwrap();
            engine.close().unwrap();
        }

        let engine = HashEngine::open(&path, &config()).unwrap();
        assert_eq!(engine.get(b"keep").unwrap(), Some(b"3".to_vec()));
        assert_eq!(engine.get(b"gone").unwrap(), None);
        assert_eq!(engine.len().unwrap(), 1);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kdb.dat");
        {
            let engine = HashEngine::open(&path, &config()).unwrap();
            engine.put(b"a", b"1").unwrap();
            engine.close().unwrap();
        }
        let frame = WalRecord::put(b"b".to_vec(), b"2".to_vec()).encode().unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..frame.len() - 2]).unwrap();
        drop(file);

        let engine = HashEngine::open(&path, &config()).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"b").unwrap(), None);
        assert_eq!(engine.file_len().unwrap(), 64);

        engine.put(b"c", b"3").unwrap();
        assert_eq!(engine.get(b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_cursor_follows_file_order() {
        let temp_dir = TempDir::new().unwrap();
        let engine = HashEngine::open(&temp_dir.path().join("kdb.dat"), &config()).unwrap();
        for key in ["z", "m", "a"] {
            engine.put(key.as_bytes(), b"v").unwrap();
        }
        assert!(!engine.is_ordered());

        let mut cursor = engine.cursor(Some(b"m")).unwrap();
        let mut keys = Vec::new();
        while let Some(entry) = cursor.next_entry().unwrap() {
            keys.push(entry.key);
        }
        assert_eq!(keys, vec![b"z".to_vec(), b"m".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_cursor_skips_keys_deleted_after_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let engine = HashEngine::open(&temp_dir.path().join("kdb.dat"), &config()).unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();

        let mut cursor = engine.cursor(None).unwrap();
        engine.remove(b"a").unwrap();
        let entry = cursor.next_entry().unwrap().unwrap();
        assert_eq!(entry.key, b"b");
        assert!(cursor.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_closed_engine_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let engine = HashEngine::open(&temp_dir.path().join("kdb.dat"), &config()).unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.close().unwrap();
        assert!(matches!(
            engine.put(b"b", b"2"),
            Err(Error::InvalidOperation(_))
        ));
        assert!(engine.get(b"a").is_err());
    }

    #[test]
    fn test_destroy_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kdb.dat");
        let engine = HashEngine::open(&path, &config()).unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.destroy().unwrap();
        assert!(!path.exists());
        assert_eq!(engine.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_partial_append_rolled_back() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kdb.dat");
        let engine = HashEngine::open(&path, &config()).unwrap();
        engine.put(b"a", b"1").unwrap();
        {
            let mut guard = engine.inner.writer.lock().unwrap();
            let writer = guard.as_mut().unwrap();
            // Half a record on disk and more still buffered
            writer.file.get_mut().write_all(b"torn").unwrap();
            writer.file.write_all(b"buffered").unwrap();
            writer.rollback().unwrap();
        }

        engine.put(b"b", b"2").unwrap();
        assert_eq!(engine.file_len().unwrap(), 128);
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
        engine.close().unwrap();

        let engine = HashEngine::open(&path, &config()).unwrap();
        assert_eq!(engine.len().unwrap(), 2);
        assert_eq!(engine.file_len().unwrap(), 128);
        assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_broken_writer_refuses_appends() {
        let temp_dir = TempDir::new().unwrap();
        let engine = HashEngine::open(&temp_dir.path().join("kdb.dat"), &config()).unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.inner.writer.lock().unwrap().as_mut().unwrap().broken = true;

        assert!(matches!(engine.put(b"b", b"2"), Err(Error::Storage(_))));
        assert_eq!(engine.get(b"b").unwrap(), None);
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_overwrites_trigger_merge() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kdb.dat");
        let config = HashConfig {
            merge_min_bytes: 4096,
            ..config()
        };
        {
            let engine = HashEngine::open(&path, &config).unwrap();
            for i in 0..10_000u32 {
                engine.put(b"hot", i.to_string().as_bytes()).unwrap();
                assert!(engine.file_len().unwrap() <= 4096 + 2 * 64);
            }
            assert_eq!(engine.get(b"hot").unwrap(), Some(b"9999".to_vec()));
            engine.close().unwrap();
        }
        assert!(!merge_path(&path).exists());

        let engine = HashEngine::open(&path, &config).unwrap();
        assert_eq!(engine.len().unwrap(), 1);
        assert_eq!(engine.get(b"hot").unwrap(), Some(b"9999".to_vec()));
    }

    #[test]
    fn test_merge_keeps_live_records_and_drops_deleted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kdb.dat");
        let engine = HashEngine::open(&path, &config()).unwrap();
        for i in 0..40 {
            engine.put(format!("key{:02}", i).as_bytes(), b"v1").unwrap();
        }
        for i in (0..40).step_by(2) {
            engine
                .put(format!("key{:02}", i).as_bytes(), format!("v2-{}", i).as_bytes())
                .unwrap();
        }
        for i in (0..40).step_by(5) {
            engine.remove(format!("key{:02}", i).as_bytes()).unwrap();
        }

        let before = engine.file_len().unwrap();
        let reclaimed = engine.merge().unwrap();
        assert_eq!(engine.len().unwrap(), 32);
        assert_eq!(engine.file_len().unwrap(), 32 * 64);
        assert_eq!(engine.live_bytes().unwrap(), 32 * 64);
        assert_eq!(reclaimed, before - 32 * 64);
        assert_eq!(engine.merge().unwrap(), 0);

        let check = |engine: &HashEngine| {
            for i in 0..40 {
                let value = engine.get(format!("key{:02}", i).as_bytes()).unwrap();
                let expected = if i % 5 == 0 {
                    None
                } else if i % 2 == 0 {
                    Some(format!("v2-{}", i).into_bytes())
                } else {
                    Some(b"v1".to_vec())
                };
                assert_eq!(value, expected, "key{:02}", i);
            }
        };
        check(&engine);

        let mut cursor = engine.cursor(None).unwrap();
        let mut seen = 0;
        while cursor.next_entry().unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 32);

        engine.put(b"after", b"merge").unwrap();
        engine.close().unwrap();

        let engine = HashEngine::open(&path, &config()).unwrap();
        check(&engine);
        assert_eq!(engine.get(b"after").unwrap(), Some(b"merge".to_vec()));
        assert_eq!(engine.file_len().unwrap(), 33 * 64);
    }

    #[test]
    fn test_unfinished_merge_removed_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kdb.dat");
        {
            let engine = HashEngine::open(&path, &config()).unwrap();
            engine.put(b"a", b"1").unwrap();
            engine.close().unwrap();
        }
        std::fs::write(merge_path(&path), b"partial").unwrap();

        let engine = HashEngine::open(&path, &config()).unwrap();
        assert!(!merge_path(&path).exists());
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    }
}
