//! Manifest - the set of live tables of one LSM engine directory
//!
//! The whole state is rewritten on every change: encoded with bincode,
//! followed by a CRC32, written to a temporary file and renamed over
//! `MANIFEST`.

use crate::sstable::TableMeta;
use bucketdb_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP: &str = "MANIFEST.tmp";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ManifestState {
    version: u32,
    next_table_id: u64,
    tables: Vec<TableMeta>,
}

impl Default for ManifestState {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            next_table_id: 1,
            tables: Vec::new(),
        }
    }
}

pub struct Manifest {
    dir: PathBuf,
    state: ManifestState,
}

impl Manifest {
    /// Loads `dir/MANIFEST`, or starts empty when there is none.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("Failed to create {:?}: {}", dir, e)))?;
        let path = dir.join(MANIFEST_FILE);
        let state = if path.exists() {
            Self::load(&path)?
        } else {
            ManifestState::default()
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            state,
        })
    }

    fn load(path: &Path) -> Result<ManifestState> {
        let bytes = fs::read(path)
            .map_err(|e| Error::Storage(format!("Failed to read manifest {:?}: {}", path, e)))?;
        if bytes.len() < 4 {
            return Err(Error::Corruption(format!("manifest {:?} truncated", path)));
        }
        let (body, crc) = bytes.split_at(bytes.len() - 4);
        let stored_crc = u32::from_le_bytes(crc.try_into().unwrap_or_default());
        if stored_crc != crc32fast::hash(body) {
            return Err(Error::Corruption(format!("manifest {:?} CRC mismatch", path)));
        }
        let state: ManifestState =
            bincode::deserialize(body).map_err(|e| Error::Serialization(e.to_string()))?;
        if state.version != MANIFEST_VERSION {
            return Err(Error::Corruption(format!(
                "manifest version {} not supported",
                state.version
            )));
        }
        Ok(state)
    }

    fn persist(&self) -> Result<()> {
        let mut bytes =
            bincode::serialize(&self.state).map_err(|e| Error::Serialization(e.to_string()))?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());

        let tmp = self.dir.join(MANIFEST_TMP);
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, self.dir.join(MANIFEST_FILE))
        };
        write().map_err(|e| Error::Storage(format!("Failed to write manifest: {}", e)))
    }

    /// Reserves an id for a table about to be written.
    pub fn allocate_table_id(&mut self) -> u64 {
        let id = self.state.next_table_id;
        self.state.next_table_id += 1;
        id
    }

    pub fn add_table(&mut self, meta: TableMeta) -> Result<()> {
        self.state.next_table_id = self.state.next_table_id.max(meta.id + 1);
        self.state.tables.push(meta);
        self.persist()
    }

    /// Swaps `removed` for `added` in one manifest write.
    pub fn replace_tables(&mut self, removed: &[u64], added: Vec<TableMeta>) -> Result<()> {
        self.state.tables.retain(|t| !removed.contains(&t.id));
        for meta in added {
            self.state.next_table_id = self.state.next_table_id.max(meta.id + 1);
            self.state.tables.push(meta);
        }
        self.persist()
    }

    /// Live tables, newest first
    pub fn tables(&self) -> Vec<TableMeta> {
        let mut tables = self.state.tables.clone();
        tables.sort_by(|a, b| b.id.cmp(&a.id));
        tables
    }

    pub fn tables_at_level(&self, level: u32) -> usize {
        self.state.tables.iter().filter(|t| t.level == level).count()
    }

    pub fn total_size(&self) -> u64 {
        self.state.tables.iter().map(|t| t.file_size).sum()
    }
}
