// WAL writer - appends framed records to the current segment
use crate::record::WalRecord;
use crate::segment::{segment_path, SegmentManager};
use bucketdb_core::{Error, Result, SyncMode};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct WalWriter {
    file: BufWriter<File>,
    wal_dir: PathBuf,
    segment_id: u64,
    segment_size: u64,
    max_segment_size: u64,
    sync_mode: SyncMode,
    appended: u64,
}

impl WalWriter {
    /// Opens the newest segment in `wal_dir` for appending, creating the
    /// directory and a first segment if needed.
    pub fn new(wal_dir: &Path, max_segment_size: u64, sync_mode: SyncMode) -> Result<Self> {
        std::fs::create_dir_all(wal_dir)
            .map_err(|e| Error::Storage(format!("Failed to create WAL directory: {}", e)))?;

        let segment_id = SegmentManager::new(wal_dir.to_path_buf()).max_id()?;
        let (file, segment_size) = Self::open_segment(wal_dir, segment_id)?;

        Ok(Self {
            file,
            wal_dir: wal_dir.to_path_buf(),
            segment_id,
            segment_size,
            max_segment_size,
            sync_mode,
            appended: 0,
        })
    }

    fn open_segment(wal_dir: &Path, id: u64) -> Result<(BufWriter<File>, u64)> {
        let path = segment_path(wal_dir, id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to open WAL segment {:?}: {}", path, e)))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok((BufWriter::new(file), size))
    }

    /// Appends one record, returning the number of records appended by this
    /// writer so far.
    pub fn append(&mut self, record: &WalRecord) -> Result<u64> {
        let frame = record.encode()?;
        if self.segment_size > 0 && self.segment_size + frame.len() as u64 > self.max_segment_size {
            self.rotate()?;
        }

        self.file
            .write_all(&frame)
            .map_err(|e| Error::Storage(format!("Failed to write WAL record: {}", e)))?;
        self.segment_size += frame.len() as u64;
        self.appended += 1;

        match self.sync_mode {
            SyncMode::Sync => self.sync()?,
            SyncMode::Async => self
                .file
                .flush()
                .map_err(|e| Error::Storage(format!("Failed to flush WAL: {}", e)))?,
            SyncMode::None => {}
        }

        Ok(self.appended)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(|e| Error::Storage(format!("Failed to flush WAL: {}", e)))?;
        self.file
            .get_ref()
            .sync_all()
            .map_err(|e| Error::Storage(format!("Failed to sync WAL: {}", e)))
    }

    /// Starts a new segment and returns its id. Every record appended before
    /// the call lives in a segment with a smaller id.
    pub fn rotate(&mut self) -> Result<u64> {
        self.sync()?;
        let next = self.segment_id + 1;
        let (file, size) = Self::open_segment(&self.wal_dir, next)?;
        self.file = file;
        self.segment_id = next;
        self.segment_size = size;
        Ok(next)
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        // Best effort sync on drop
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_creates_first_segment() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("wal");

        let writer = WalWriter::new(&wal_path, 1024, SyncMode::Sync).unwrap();
        assert_eq!(writer.segment_id(), 0);
        assert!(segment_path(&wal_path, 0).exists());
    }

    #[test]
    fn test_append_counts_records() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = WalWriter::new(temp_dir.path(), 1024 * 1024, SyncMode::None).unwrap();

        let record = WalRecord::put(b"key1".to_vec(), b"value1".to_vec());
        assert_eq!(writer.append(&record).unwrap(), 1);
        assert_eq!(writer.append(&record).unwrap(), 2);
        assert!(writer.segment_size() > 0);
    }

    #[test]
    fn test_rotation_on_size() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = WalWriter::new(temp_dir.path(), 64, SyncMode::Async).unwrap();

        for i in 0..10 {
            let record = WalRecord::put(format!("key{}", i).into_bytes(), vec![0u8; 32]);
            writer.append(&record).unwrap();
        }
        assert!(writer.segment_id() > 0);
    }

    #[test]
    fn test_reopen_appends_to_newest_segment() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut writer = WalWriter::new(temp_dir.path(), 1024, SyncMode::Sync).unwrap();
            writer.rotate().unwrap();
            writer.rotate().unwrap();
        }
        let writer = WalWriter::new(temp_dir.path(), 1024, SyncMode::Sync).unwrap();
        assert_eq!(writer.segment_id(), 2);
    }
}
