// WAL reader - replays records from every segment in order
//
// A frame cut short at the end of a segment is a write interrupted by a
// crash and ends that segment; a checksum failure is reported.

use crate::record::{Frame, WalRecord};
use crate::segment::{SegmentInfo, SegmentManager};
use bucketdb_core::{Error, Result};
use std::path::Path;

/// Reads records from all segments of a WAL directory
pub struct WalReader {
    segments: Vec<SegmentInfo>,
    next_segment: usize,
    buffer: Vec<u8>,
    offset: usize,
    torn_tails: usize,
}

impl WalReader {
    pub fn new(wal_dir: &Path) -> Result<Self> {
        let segments = SegmentManager::new(wal_dir.to_path_buf()).list_segments()?;
        Ok(Self {
            segments,
            next_segment: 0,
            buffer: Vec::new(),
            offset: 0,
            torn_tails: 0,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Number of segments that ended in a partial frame
    pub fn torn_tails(&self) -> usize {
        self.torn_tails
    }

    fn load_next_segment(&mut self) -> Result<bool> {
        let Some(segment) = self.segments.get(self.next_segment) else {
            return Ok(false);
        };
        self.buffer = std::fs::read(&segment.path)
            .map_err(|e| Error::Storage(format!("Failed to read segment {:?}: {}", segment.path, e)))?;
        self.offset = 0;
        self.next_segment += 1;
        Ok(true)
    }

    /// Returns the next record, or `None` after the last segment.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        loop {
            if self.offset >= self.buffer.len() {
                if !self.load_next_segment()? {
                    return Ok(None);
                }
                continue;
            }

            match WalRecord::decode(&self.buffer[self.offset..])? {
                Frame::Complete(record, used) => {
                    self.offset += used;
                    return Ok(Some(record));
                }
                Frame::Incomplete => {
                    self.torn_tails += 1;
                    tracing::warn!(
                        segment = self.next_segment - 1,
                        offset = self.offset,
                        "discarding torn WAL tail"
                    );
                    self.offset = self.buffer.len();
                }
            }
        }
    }

    pub fn read_all(&mut self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

impl Iterator for WalReader {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
