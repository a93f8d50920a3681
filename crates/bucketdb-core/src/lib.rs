//! # bucketdb core
//!
//! Core types shared by the bucketdb engines and the storage layer:
//! errors and result codes, the record codec, key layout, the scan transfer
//! format and the store configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod key;
pub mod record;
pub mod transfer;

pub use config::{CacheConfig, EngineKind, HashConfig, LsmConfig, StoreConfig, SyncMode};
pub use error::{Error, Result, ResultCode};
pub use key::{DataKey, KeyLayout};
pub use record::{now_secs, RecordMeta, RecordView, RECORD_HEADER_SIZE};
pub use transfer::{TransferItem, TRANSFER_HEADER_SIZE};
