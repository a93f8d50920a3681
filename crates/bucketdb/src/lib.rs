//! # bucketdb
//!
//! A bucket-sharded, versioned, TTL-aware record store over pluggable
//! embedded engines.
//!
//! Logical buckets are spread over a fixed number of storage instances by
//! `bucket % instance_count`. Each instance sits on one embedded engine
//! (per-bucket hash files, or a shared LSM tree) and layers three contracts
//! on top of it: optimistic versioning, lazy expiration and per-key write
//! serialization through striped locks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bucketdb::{DataKey, EngineKind, InstanceManager, StoreConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = InstanceManager::open(StoreConfig::new("./data", EngineKind::Lsm))?;
//!     manager.init_buckets(&[0, 1, 2])?;
//!
//!     let key = DataKey::new(7, "user:1");
//!     let meta = manager.put(1, &key, b"Alice", true, 0)?;
//!     assert_eq!(meta.version, 1);
//!
//!     let stored = manager.get(1, &key)?;
//!     println!("{}", String::from_utf8_lossy(&stored.value));
//!
//!     manager.close()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Exporting a bucket
//!
//! ```rust,no_run
//! # use bucketdb::{EngineKind, InstanceManager, StoreConfig};
//! # let manager = InstanceManager::open(StoreConfig::new("./data", EngineKind::Lsm))?;
//! manager.begin_scan(1)?;
//! let mut buf = Vec::new();
//! loop {
//!     let batch = manager.get_next_items(&mut buf, 64)?;
//!     if batch.exhausted {
//!         break;
//!     }
//! }
//! manager.end_scan()?;
//! # Ok::<(), bucketdb::Error>(())
//! ```

pub mod cache;
pub mod instance;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod scan;
pub mod stats;

pub use bucketdb_core::{
    CacheConfig, DataKey, EngineKind, Error, HashConfig, KeyLayout, LsmConfig, RecordMeta, Result,
    ResultCode, StoreConfig, SyncMode, TransferItem,
};
pub use bucketdb_engine::{EngineCursor, EngineEntry, HashEngine, KvEngine, LsmEngine};

pub use cache::{CacheStats, MemoryCache, RecordCache};
pub use instance::{StorageInstance, StoredValue};
pub use lock::StripedLock;
pub use manager::{InstanceManager, ScanBatch};
pub use scan::{RangeItem, RangeScan, ScanCursor, ScanStep};
pub use stats::{InstanceStats, StoreStats};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
