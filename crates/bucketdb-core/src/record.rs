//! Record codec - metadata header + value stored as one engine value
//!
//! ## Layout
//!
//! ```text
//! +---------------+----------------+---------------+-------------+-----------+
//! | version u32LE | create u32LE   | modify u32LE  | expire u32LE | value ... |
//! +---------------+----------------+---------------+-------------+-----------+
//! ```
//!
//! No checksum and no compression: the embedded engines already verify their
//! own frames. Timestamps are unix seconds; `expire_time == 0` never expires.

use crate::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the fixed metadata header in bytes
pub const RECORD_HEADER_SIZE: usize = 16;

/// Per-record metadata stored ahead of the value bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordMeta {
    /// Version counter, 1 after the first version-cared write
    pub version: u32,
    /// Creation time (unix seconds)
    pub create_time: u32,
    /// Last modification time (unix seconds)
    pub modify_time: u32,
    /// Expiration time (unix seconds), 0 = never
    pub expire_time: u32,
}

impl RecordMeta {
    /// Whether the record is logically absent at `now`.
    pub fn is_expired(&self, now: u32) -> bool {
        self.expire_time != 0 && now >= self.expire_time
    }
}

/// A decoded record borrowing its value from the encoded blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView<'a> {
    /// Decoded metadata
    pub meta: RecordMeta,
    /// Value bytes following the header
    pub value: &'a [u8],
}

/// Encodes `meta` and `value` into a single blob.
pub fn encode(meta: &RecordMeta, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + value.len());
    out.extend_from_slice(&meta.version.to_le_bytes());
    out.extend_from_slice(&meta.create_time.to_le_bytes());
    out.extend_from_slice(&meta.modify_time.to_le_bytes());
    out.extend_from_slice(&meta.expire_time.to_le_bytes());
    out.extend_from_slice(value);
    out
}

/// Decodes a blob produced by [`encode`]. Metadata ranges are not validated.
pub fn decode(bytes: &[u8]) -> Result<RecordView<'_>> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(Error::CorruptRecord { len: bytes.len() });
    }
    let word = |i: usize| {
        let at = i * 4;
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    };
    Ok(RecordView {
        meta: RecordMeta {
            version: word(0),
            create_time: word(1),
            modify_time: word(2),
            expire_time: word(3),
        },
        value: &bytes[RECORD_HEADER_SIZE..],
    })
}

/// Current wall-clock time in unix seconds.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}
