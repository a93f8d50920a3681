// WAL segment files
//
// Segments are named: wal-{sequence:016x}.log
// Where sequence is the id handed out when the segment was opened; ids only
// grow, so lexical order is replay order.

use bucketdb_core::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

/// Path of segment `id` inside `wal_dir`.
pub fn segment_path(wal_dir: &Path, id: u64) -> PathBuf {
    wal_dir.join(format!("{}{:016x}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX))
}

/// Information about a WAL segment file
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Path to the segment file
    pub path: PathBuf,
    /// Segment id parsed from the filename
    pub id: u64,
    /// File size in bytes
    pub size: u64,
}

/// Lists and deletes segment files of one WAL directory
pub struct SegmentManager {
    wal_dir: PathBuf,
}

impl SegmentManager {
    pub fn new(wal_dir: PathBuf) -> Self {
        Self { wal_dir }
    }

    /// All segments, oldest first
    pub fn list_segments(&self) -> Result<Vec<SegmentInfo>> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }

        let mut segments: Vec<SegmentInfo> = fs::read_dir(&self.wal_dir)
            .map_err(|e| Error::Storage(format!("Failed to read WAL directory: {}", e)))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_segment(&entry.path()))
            .collect();
        segments.sort_by_key(|s| s.id);
        Ok(segments)
    }

    /// Highest segment id present, 0 when the directory is empty
    pub fn max_id(&self) -> Result<u64> {
        Ok(self.list_segments()?.last().map(|s| s.id).unwrap_or(0))
    }

    pub fn segment_count(&self) -> Result<usize> {
        Ok(self.list_segments()?.len())
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_segments()?.iter().map(|s| s.size).sum())
    }

    /// Deletes every segment whose id is below `id`, returning how many
    /// were removed.
    pub fn cleanup_before(&self, id: u64) -> Result<usize> {
        let mut deleted = 0;
        for segment in self.list_segments()? {
            if segment.id >= id {
                continue;
            }
            fs::remove_file(&segment.path).map_err(|e| {
                Error::Storage(format!("Failed to delete segment {:?}: {}", segment.path, e))
            })?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

fn parse_segment(path: &Path) -> Option<SegmentInfo> {
    let name = path.file_name()?.to_str()?;
    let hex = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    let id = u64::from_str_radix(hex, 16).ok()?;
    let size = fs::metadata(path).ok()?.len();
    Some(SegmentInfo {
        path: path.to_path_buf(),
        id,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, id: u64) {
        fs::write(segment_path(dir, id), b"x").unwrap();
    }

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SegmentManager::new(temp_dir.path().join("missing"));
        assert!(manager.list_segments().unwrap().is_empty());
        assert_eq!(manager.max_id().unwrap(), 0);
    }

    #[test]
    fn test_list_sorted_and_ignores_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), 0x11);
        touch(temp_dir.path(), 0x2);
        fs::write(temp_dir.path().join("MANIFEST"), b"").unwrap();

        let manager = SegmentManager::new(temp_dir.path().to_path_buf());
        let ids: Vec<_> = manager.list_segments().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0x2, 0x11]);
        assert_eq!(manager.max_id().unwrap(), 0x11);
        assert_eq!(manager.total_size().unwrap(), 2);
    }

    #[test]
    fn test_cleanup_before() {
        let temp_dir = TempDir::new().unwrap();
        for id in [1, 2, 3] {
            touch(temp_dir.path(), id);
        }

        let manager = SegmentManager::new(temp_dir.path().to_path_buf());
        assert_eq!(manager.cleanup_before(3).unwrap(), 2);
        assert_eq!(manager.segment_count().unwrap(), 1);
        assert_eq!(manager.max_id().unwrap(), 3);
    }
}
