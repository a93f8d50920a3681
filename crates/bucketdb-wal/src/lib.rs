//! # bucketdb WAL
//!
//! Framed, checksummed log records and a segmented write-ahead log.
//!
//! The LSM engine logs every mutation here before applying it to its
//! memtable and drops whole segments once a flush has made them redundant.
//! The hash engine reuses the record framing for its data files.

use bucketdb_core::{Error, Result};
use std::path::PathBuf;

pub mod reader;
pub mod record;
pub mod segment;
pub mod writer;

pub use bucketdb_core::SyncMode;
pub use reader::WalReader;
pub use record::{Frame, RecordPayload, RecordType, WalRecord, FRAME_OVERHEAD};
pub use segment::{SegmentInfo, SegmentManager};
pub use writer::WalWriter;

/// WAL configuration options
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Sync mode for appends
    pub sync_mode: SyncMode,
    /// Maximum segment size in bytes before rotation
    pub max_segment_size: u64,
    /// Directory holding the segments
    pub wal_dir: PathBuf,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Sync,
            max_segment_size: 64 * 1024 * 1024, // 64 MB
            wal_dir: PathBuf::from("wal"),
        }
    }
}

/// What a replay found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Segments read
    pub segments: usize,
    /// Put and delete records returned
    pub records: usize,
    /// Checkpoint markers seen
    pub checkpoints: usize,
    /// Segments that ended in a partial frame
    pub torn_tails: usize,
}

/// Coordinates appends, truncation and replay of one WAL directory
pub struct WalManager {
    config: WalConfig,
    writer: Option<WalWriter>,
}

impl WalManager {
    pub fn new(config: WalConfig) -> Self {
        Self {
            config,
            writer: None,
        }
    }

    /// Opens the newest segment for appending.
    pub fn open(&mut self) -> Result<()> {
        let writer = WalWriter::new(
            &self.config.wal_dir,
            self.config.max_segment_size,
            self.config.sync_mode,
        )?;
        self.writer = Some(writer);
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut WalWriter> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("WAL not opened".to_string()))
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<u64> {
        self.writer()?.append(record)
    }

    pub fn sync(&mut self) -> Result<()> {
        match &mut self.writer {
            Some(writer) => writer.sync(),
            None => Ok(()),
        }
    }

    /// Seals the current segment; returns the id of the new one.
    pub fn rotate(&mut self) -> Result<u64> {
        self.writer()?.rotate()
    }

    /// Drops segments older than `segment_id` after writing a checkpoint
    /// marker into the live segment.
    pub fn truncate_before(&mut self, segment_id: u64, sequence: u64) -> Result<usize> {
        self.append(&WalRecord::checkpoint(sequence))?;
        let deleted = self.segment_manager().cleanup_before(segment_id)?;
        tracing::debug!(segment_id, deleted, "WAL truncated");
        Ok(deleted)
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.sync()?;
        }
        Ok(())
    }

    /// Replays every put and delete still on disk, oldest first.
    pub fn recover(&self) -> Result<(Vec<WalRecord>, RecoveryStats)> {
        let mut reader = WalReader::new(&self.config.wal_dir)?;
        let mut stats = RecoveryStats {
            segments: reader.segment_count(),
            ..Default::default()
        };

        let mut records = Vec::new();
        while let Some(record) = reader.next_record()? {
            match record.payload {
                RecordPayload::Checkpoint { .. } => stats.checkpoints += 1,
                _ => records.push(record),
            }
        }
        stats.records = records.len();
        stats.torn_tails = reader.torn_tails();
        Ok((records, stats))
    }

    pub fn segment_manager(&self) -> SegmentManager {
        SegmentManager::new(self.config.wal_dir.clone())
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_config() -> (TempDir, WalConfig) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = WalConfig {
            wal_dir: temp_dir.path().join("wal"),
            sync_mode: SyncMode::Sync,
            max_segment_size: 64 * 1024 * 1024,
        };
        (temp_dir, config)
    }

    #[test]
    fn test_wal_config_default() {
        let config = WalConfig::default();
        assert_eq!(config.sync_mode, SyncMode::Sync);
        assert_eq!(config.max_segment_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_append_requires_open() {
        let (_temp_dir, config) = setup_test_config();
        let mut manager = WalManager::new(config);
        assert!(!manager.is_open());
        assert!(manager
            .append(&WalRecord::delete(b"k".to_vec()))
            .is_err());
    }

    #[test]
    fn test_write_and_recover() {
        let (_temp_dir, config) = setup_test_config();
        {
            let mut manager = WalManager::new(config.clone());
            manager.open().unwrap();
            for i in 0..5 {
                let record = WalRecord::put(
                    format!("key{}", i).into_bytes(),
                    format!("value{}", i).into_bytes(),
                );
                manager.append(&record).unwrap();
            }
            manager.append(&WalRecord::delete(b"key0".to_vec())).unwrap();
            manager.close().unwrap();
        }

        let (records, stats) = WalManager::new(config).recover().unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(stats.records, 6);
        assert_eq!(stats.segments, 1);
        assert_eq!(records[5], WalRecord::delete(b"key0".to_vec()));
    }

    #[test]
    fn test_truncate_before_drops_sealed_segments() {
        let (_temp_dir, config) = setup_test_config();
        let mut manager = WalManager::new(config.clone());
        manager.open().unwrap();

        manager
            .append(&WalRecord::put(b"old".to_vec(), b"1".to_vec()))
            .unwrap();
        let live = manager.rotate().unwrap();
        manager
            .append(&WalRecord::put(b"new".to_vec(), b"2".to_vec()))
            .unwrap();
        assert_eq!(manager.truncate_before(live, 1).unwrap(), 1);
        manager.close().unwrap();

        let (records, stats) = WalManager::new(config).recover().unwrap();
        assert_eq!(records, vec![WalRecord::put(b"new".to_vec(), b"2".to_vec())]);
        assert_eq!(stats.checkpoints, 1);
    }
}
