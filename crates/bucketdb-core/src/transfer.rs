//! Scan transfer format used for bucket export and migration.
//!
//! ```text
//! [key_size u32][version u32][value_size u32][create u32][modify u32][expire u32]
//! [key bytes ...][value bytes ...]
//! ```
//!
//! All header fields are little-endian. Items are packed back to back into a
//! caller-provided buffer.

use crate::record::RecordMeta;
use crate::{Error, Result};

/// Size of the fixed transfer header
pub const TRANSFER_HEADER_SIZE: usize = 24;

/// One exported record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    /// `area || key`
    pub key: Vec<u8>,
    /// Value bytes (without the record header)
    pub value: Vec<u8>,
    /// Record metadata
    pub meta: RecordMeta,
}

impl TransferItem {
    /// Encoded size of this item.
    pub fn encoded_len(&self) -> usize {
        TRANSFER_HEADER_SIZE + self.key.len() + self.value.len()
    }

    /// Appends the encoded item to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len());
        for field in [
            self.key.len() as u32,
            self.meta.version,
            self.value.len() as u32,
            self.meta.create_time,
            self.meta.modify_time,
            self.meta.expire_time,
        ] {
            buf.extend_from_slice(&field.to_le_bytes());
        }
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
    }

    /// Decodes one item from the front of `data`, returning it and the
    /// number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < TRANSFER_HEADER_SIZE {
            return Err(Error::Serialization(format!(
                "Incomplete transfer header: {} bytes",
                data.len()
            )));
        }
        let field = |i: usize| {
            let at = i * 4;
            u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
        };
        let key_size = field(0) as usize;
        let value_size = field(2) as usize;
        let total = TRANSFER_HEADER_SIZE
            .checked_add(key_size)
            .and_then(|n| n.checked_add(value_size))
            .ok_or_else(|| Error::Serialization("Transfer item size overflow".into()))?;
        if data.len() < total {
            return Err(Error::Serialization(format!(
                "Incomplete transfer item: expected {} bytes, got {}",
                total,
                data.len()
            )));
        }

        let key_start = TRANSFER_HEADER_SIZE;
        let value_start = key_start + key_size;
        let item = TransferItem {
            key: data[key_start..value_start].to_vec(),
            value: data[value_start..total].to_vec(),
            meta: RecordMeta {
                version: field(1),
                create_time: field(3),
                modify_time: field(4),
                expire_time: field(5),
            },
        };
        Ok((item, total))
    }

    /// Decodes every item packed into `data`.
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<Self>> {
        let mut items = Vec::new();
        while !data.is_empty() {
            let (item, used) = Self::decode(data)?;
            items.push(item);
            data = &data[used..];
        }
        Ok(items)
    }
}
