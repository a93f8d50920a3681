// Log record framing
//
// Frame format (binary):
// [length: u32 LE] [type: u8] [bincode payload] [crc32: u32 LE]
//
// `length` covers type + payload. The CRC covers type + payload.

use crc32fast::Hasher;
use bucketdb_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Length prefix + type byte + CRC
pub const FRAME_OVERHEAD: usize = 4 + 1 + 4;

/// Log record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
    Put = 1,
    Delete = 2,
    Checkpoint = 3,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Put),
            2 => Ok(RecordType::Delete),
            3 => Ok(RecordType::Checkpoint),
            _ => Err(Error::Corruption(format!("Unknown log record type: {}", value))),
        }
    }
}

/// Log record payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordPayload {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Everything logged before this point has been persisted elsewhere
    Checkpoint { sequence: u64 },
}

/// A log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub payload: RecordPayload,
}

/// Outcome of decoding the front of a byte slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A whole, checksummed record and the bytes it occupied
    Complete(WalRecord, usize),
    /// The slice ends inside a frame (torn write at the tail)
    Incomplete,
}

impl WalRecord {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            payload: RecordPayload::Put { key, value },
        }
    }

    pub fn delete(key: Vec<u8>) -> Self {
        Self {
            payload: RecordPayload::Delete { key },
        }
    }

    pub fn checkpoint(sequence: u64) -> Self {
        Self {
            payload: RecordPayload::Checkpoint { sequence },
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self.payload {
            RecordPayload::Put { .. } => RecordType::Put,
            RecordPayload::Delete { .. } => RecordType::Delete,
            RecordPayload::Checkpoint { .. } => RecordType::Checkpoint,
        }
    }

    /// Encodes the record as one frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&self.payload)
            .map_err(|e| Error::Serialization(format!("Failed to serialize payload: {}", e)))?;
        let type_byte = self.record_type() as u8;

        let mut hasher = Hasher::new();
        hasher.update(&[type_byte]);
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        frame.extend_from_slice(&((1 + payload.len()) as u32).to_le_bytes());
        frame.push(type_byte);
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    /// Decodes one frame from the front of `data`.
    ///
    /// A short slice is `Frame::Incomplete`; a zero length, unknown type or
    /// CRC mismatch is `Error::Corruption`.
    pub fn decode(data: &[u8]) -> Result<Frame> {
        if data.len() < 4 {
            return Ok(Frame::Incomplete);
        }
        let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length == 0 {
            return Err(Error::Corruption("Zero-length log frame".into()));
        }
        let total = 4 + length + 4;
        if data.len() < total {
            return Ok(Frame::Incomplete);
        }

        let type_byte = data[4];
        let payload = &data[5..4 + length];
        let crc_at = 4 + length;
        let expected = u32::from_le_bytes([
            data[crc_at],
            data[crc_at + 1],
            data[crc_at + 2],
            data[crc_at + 3],
        ]);

        let mut hasher = Hasher::new();
        hasher.update(&[type_byte]);
        hasher.update(payload);
        let actual = hasher.finalize();
        if actual != expected {
            return Err(Error::Corruption(format!(
                "CRC mismatch: expected {}, got {}",
                expected, actual
            )));
        }

        let record_type = RecordType::try_from(type_byte)?;
        let payload: RecordPayload = bincode::deserialize(payload)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize payload: {}", e)))?;
        let record = WalRecord { payload };
        if record.record_type() != record_type {
            return Err(Error::Corruption(format!(
                "Frame type {:?} does not match payload",
                record_type
            )));
        }
        Ok(Frame::Complete(record, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_conversion() {
        assert_eq!(RecordType::try_from(1).unwrap(), RecordType::Put);
        assert_eq!(RecordType::try_from(3).unwrap(), RecordType::Checkpoint);
        assert!(RecordType::try_from(99).is_err());
    }

    #[test]
    fn test_put_frame() {
        let record = WalRecord::put(b"key1".to_vec(), b"value1".to_vec());
        let encoded = record.encode().unwrap();
        assert!(encoded.len() > FRAME_OVERHEAD);

        match WalRecord::decode(&encoded).unwrap() {
            Frame::Complete(decoded, size) => {
                assert_eq!(decoded, record);
                assert_eq!(size, encoded.len());
            }
            Frame::Incomplete => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn test_trailing_bytes_are_not_consumed() {
        let mut encoded = WalRecord::delete(b"k".to_vec()).encode().unwrap();
        let len = encoded.len();
        encoded.extend_from_slice(&[0u8; 7]);

        let Frame::Complete(_, size) = WalRecord::decode(&encoded).unwrap() else {
            panic!("expected a complete frame");
        };
        assert_eq!(size, len);
    }

    #[test]
    fn test_torn_tail_is_incomplete() {
        let encoded = WalRecord::put(b"key".to_vec(), b"value".to_vec())
            .encode()
            .unwrap();
        assert_eq!(WalRecord::decode(&encoded[..2]).unwrap(), Frame::Incomplete);
        assert_eq!(
            WalRecord::decode(&encoded[..encoded.len() - 1]).unwrap(),
            Frame::Incomplete
        );
    }

    #[test]
    fn test_crc_validation() {
        let mut encoded = WalRecord::put(b"key".to_vec(), b"value".to_vec())
            .encode()
            .unwrap();
        encoded[10] ^= 0xFF;
        assert!(matches!(
            WalRecord::decode(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_zero_length_frame() {
        assert!(WalRecord::decode(&[0u8; 16]).is_err());
    }
}
