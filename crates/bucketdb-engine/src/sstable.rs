//! SSTable - immutable sorted table files of the LSM engine
//!
//! ## File Format
//!
//! ```text
//! +------------------+
//! | Data Blocks      |  <- [len u32][bincode entry]... then block CRC32
//! +------------------+
//! | Index Block      |  <- bincode Vec<BlockHandle>
//! +------------------+
//! | Footer (32 B)    |  <- index offset, index len, entries, magic, CRC32
//! +------------------+
//! ```

use crate::merge::EntrySource;
use bucketdb_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const TABLE_MAGIC: u64 = 0x4244_4B56_5442_4C31; // "BDKVTBL1"

const FOOTER_SIZE: usize = 32;

const DEFAULT_BLOCK_SIZE: usize = 4096;

/// One key in a table; `value` is `None` for a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockHandle {
    first_key: Vec<u8>,
    offset: u64,
    /// Data length, excluding the trailing CRC
    len: u32,
}

/// What the engine remembers about a finished table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: u64,
    pub level: u32,
    pub entry_count: u64,
    pub file_size: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

/// Table file name inside an engine directory
pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", id))
}

fn io_err(context: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Storage(format!("{} {:?}: {}", context, path, e))
}

/// Streams sorted entries into a new table file
pub struct TableWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    position: u64,
    index: Vec<BlockHandle>,
    block: Vec<u8>,
    block_first_key: Option<Vec<u8>>,
    block_size: usize,
    entry_count: u64,
    min_key: Option<Vec<u8>>,
    max_key: Vec<u8>,
}

impl TableWriter {
    pub fn create(path: &Path) -> Result<Self> {
        Self::with_block_size(path, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(path: &Path, block_size: usize) -> Result<Self> {
        let file = File::create(path).map_err(|e| io_err("Failed to create table", path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            position: 0,
            index: Vec::new(),
            block: Vec::with_capacity(block_size),
            block_first_key: None,
            block_size,
            entry_count: 0,
            min_key: None,
            max_key: Vec::new(),
        })
    }

    /// Entries must arrive in strictly ascending key order.
    pub fn add(&mut self, entry: &TableEntry) -> Result<()> {
        if self.entry_count > 0 && entry.key <= self.max_key {
            return Err(Error::InvalidOperation(
                "table entries must be added in ascending key order".to_string(),
            ));
        }
        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        if self.block_first_key.is_none() {
            self.block_first_key = Some(entry.key.clone());
        }
        self.max_key = entry.key.clone();

        let encoded =
            bincode::serialize(entry).map_err(|e| Error::Serialization(e.to_string()))?;
        self.block
            .extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        self.block.extend_from_slice(&encoded);
        self.entry_count += 1;

        if self.block.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| io_err("Failed to write table", &self.path, e))?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let Some(first_key) = self.block_first_key.take() else {
            return Ok(());
        };
        let block = std::mem::take(&mut self.block);
        self.index.push(BlockHandle {
            first_key,
            offset: self.position,
            len: block.len() as u32,
        });
        self.write(&block)?;
        self.write(&crc32fast::hash(&block).to_le_bytes())?;
        self.block = Vec::with_capacity(self.block_size);
        Ok(())
    }

    /// Writes index and footer and syncs the file.
    pub fn finish(mut self, id: u64, level: u32) -> Result<TableMeta> {
        self.flush_block()?;

        let index_offset = self.position;
        let index =
            bincode::serialize(&self.index).map_err(|e| Error::Serialization(e.to_string()))?;
        self.write(&index)?;

        let mut footer = Vec::with_capacity(FOOTER_SIZE);
        footer.extend_from_slice(&index_offset.to_le_bytes());
        footer.extend_from_slice(&(index.len() as u32).to_le_bytes());
        footer.extend_from_slice(&self.entry_count.to_le_bytes());
        footer.extend_from_slice(&TABLE_MAGIC.to_le_bytes());
        let crc = crc32fast::hash(&footer);
        footer.extend_from_slice(&crc.to_le_bytes());
        self.write(&footer)?;

        self.writer
            .flush()
            .map_err(|e| io_err("Failed to flush table", &self.path, e))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| io_err("Failed to sync table", &self.path, e))?;

        Ok(TableMeta {
            id,
            level,
            entry_count: self.entry_count,
            file_size: self.position,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key,
        })
    }
}

/// Random and sequential access to one table file
pub struct TableReader {
    path: PathBuf,
    file: File,
    index: Vec<BlockHandle>,
    entry_count: u64,
}

impl TableReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| io_err("Failed to open table", path, e))?;
        let file_size = file
            .metadata()
            .map_err(|e| io_err("Failed to stat table", path, e))?
            .len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption(format!("table {:?} too small", path)));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))
            .and_then(|_| file.read_exact(&mut footer))
            .map_err(|e| io_err("Failed to read table footer", path, e))?;

        let field = |at: usize, n: usize| &footer[at..at + n];
        let stored_crc = u32::from_le_bytes(field(28, 4).try_into().unwrap_or_default());
        if stored_crc != crc32fast::hash(&footer[..28]) {
            return Err(Error::Corruption(format!("table {:?} footer CRC mismatch", path)));
        }
        let magic = u64::from_le_bytes(field(20, 8).try_into().unwrap_or_default());
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!("table {:?} has bad magic", path)));
        }
        let index_offset = u64::from_le_bytes(field(0, 8).try_into().unwrap_or_default());
        let index_len = u32::from_le_bytes(field(8, 4).try_into().unwrap_or_default());
        let entry_count = u64::from_le_bytes(field(12, 8).try_into().unwrap_or_default());

        let mut index_buf = vec![0u8; index_len as usize];
        file.seek(SeekFrom::Start(index_offset))
            .and_then(|_| file.read_exact(&mut index_buf))
            .map_err(|e| io_err("Failed to read table index", path, e))?;
        let index: Vec<BlockHandle> =
            bincode::deserialize(&index_buf).map_err(|e| Error::Serialization(e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            index,
            entry_count,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Block that may hold `key`: the last block whose first key is <= key.
    fn block_for(&self, key: &[u8]) -> Option<usize> {
        self.index
            .partition_point(|handle| handle.first_key.as_slice() <= key)
            .checked_sub(1)
    }

    fn read_block(&mut self, block_idx: usize) -> Result<Vec<TableEntry>> {
        let handle = &self.index[block_idx];
        let mut data = vec![0u8; handle.len as usize + 4];
        self.file
            .seek(SeekFrom::Start(handle.offset))
            .and_then(|_| self.file.read_exact(&mut data))
            .map_err(|e| io_err("Failed to read table block", &self.path, e))?;

        let (body, crc) = data.split_at(handle.len as usize);
        let stored_crc = u32::from_le_bytes(crc.try_into().unwrap_or_default());
        if stored_crc != crc32fast::hash(body) {
            return Err(Error::Corruption(format!(
                "table {:?} block {} CRC mismatch",
                self.path, block_idx
            )));
        }

        let mut entries = Vec::new();
        let mut offset = 0;
        while offset + 4 <= body.len() {
            let len = u32::from_le_bytes(body[offset..offset + 4].try_into().unwrap_or_default())
                as usize;
            offset += 4;
            let Some(raw) = body.get(offset..offset + len) else {
                return Err(Error::Corruption(format!(
                    "table {:?} block {} truncated entry",
                    self.path, block_idx
                )));
            };
            let entry: TableEntry =
                bincode::deserialize(raw).map_err(|e| Error::Serialization(e.to_string()))?;
            entries.push(entry);
            offset += len;
        }
        Ok(entries)
    }

    /// - `Some(Some(value))`: live value
    /// - `Some(None)`: tombstone
    /// - `None`: key not in this table
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        let Some(block_idx) = self.block_for(key) else {
            return Ok(None);
        };
        Ok(self
            .read_block(block_idx)?
            .into_iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value))
    }

    /// Consumes the reader into a scanner positioned at the first key >= `from`.
    pub fn into_scanner(self, from: Option<&[u8]>) -> Result<TableScanner> {
        let mut scanner = TableScanner {
            reader: self,
            next_block: 0,
            pending: VecDeque::new(),
        };
        if let Some(start) = from {
            scanner.seek(start)?;
        }
        Ok(scanner)
    }
}

/// Sequential cursor over one table, one block in memory at a time
pub struct TableScanner {
    reader: TableReader,
    next_block: usize,
    pending: VecDeque<TableEntry>,
}

impl TableScanner {
    pub fn seek(&mut self, start: &[u8]) -> Result<()> {
        self.pending.clear();
        self.next_block = self.reader.block_for(start).unwrap_or(0);
        while self.fill()? {
            while let Some(front) = self.pending.front() {
                if front.key.as_slice() >= start {
                    return Ok(());
                }
                self.pending.pop_front();
            }
        }
        Ok(())
    }

    fn fill(&mut self) -> Result<bool> {
        if self.next_block >= self.reader.index.len() {
            return Ok(false);
        }
        self.pending = self.reader.read_block(self.next_block)?.into();
        self.next_block += 1;
        Ok(true)
    }

    pub fn next_entry(&mut self) -> Result<Option<TableEntry>> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Ok(Some(entry));
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }
}

impl EntrySource for TableScanner {
    fn next_entry(&mut self) -> Result<Option<TableEntry>> {
        TableScanner::next_entry(self)
    }
}
