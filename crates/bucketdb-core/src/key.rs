//! Key layout
//!
//! Client keys carry an area id. Engines that keep one bucket per store
//! (the hash engine) store `area || key`; engines that multiplex many
//! buckets into one store (the LSM engine) store `bucket || area || key`.
//! Both prefixes are big-endian so byte order groups records by bucket and
//! then by area, which is what range iteration relies on.

use crate::record::RecordMeta;

/// Width of the encoded area prefix
pub const AREA_PREFIX_SIZE: usize = 2;
/// Width of the encoded bucket prefix
pub const BUCKET_PREFIX_SIZE: usize = 4;

/// A client key: area, raw key bytes, and the metadata the caller supplied
/// with the request (expected version, or the timestamps being replayed).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataKey {
    /// Area (namespace / quota domain)
    pub area: u16,
    /// Raw key bytes
    pub key: Vec<u8>,
    /// Caller-supplied metadata
    pub meta: RecordMeta,
}

impl DataKey {
    /// Creates a key with empty metadata.
    pub fn new(area: u16, key: impl Into<Vec<u8>>) -> Self {
        Self {
            area,
            key: key.into(),
            meta: RecordMeta::default(),
        }
    }

    /// Sets the version the caller expects to find in the store.
    pub fn with_version(mut self, version: u32) -> Self {
        self.meta.version = version;
        self
    }

    /// Sets metadata carried verbatim by a non-version-cared write.
    pub fn with_meta(mut self, meta: RecordMeta) -> Self {
        self.meta = meta;
        self
    }

    /// `area || key`, the form exported by scans.
    pub fn merged(&self) -> Vec<u8> {
        area_key(self.area, &self.key)
    }
}

/// How a store lays out physical keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// `area || key`; one bucket per physical store
    Area,
    /// `bucket || area || key`; many buckets per physical store
    BucketArea,
}

impl KeyLayout {
    /// Builds the physical key for `key` in `bucket`.
    pub fn encode(&self, bucket: u32, key: &DataKey) -> Vec<u8> {
        match self {
            KeyLayout::Area => area_key(key.area, &key.key),
            KeyLayout::BucketArea => bucket_key(bucket, key.area, &key.key),
        }
    }

    /// Strips the bucket prefix (if any), returning `area || key`.
    pub fn merged<'a>(&self, physical: &'a [u8]) -> Option<&'a [u8]> {
        match self {
            KeyLayout::Area => Some(physical),
            KeyLayout::BucketArea => physical.get(BUCKET_PREFIX_SIZE..),
        }
    }
}

/// `area || key`
pub fn area_key(area: u16, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(AREA_PREFIX_SIZE + key.len());
    out.extend_from_slice(&area.to_be_bytes());
    out.extend_from_slice(key);
    out
}

/// Splits `area || key`.
pub fn split_area_key(merged: &[u8]) -> Option<(u16, &[u8])> {
    if merged.len() < AREA_PREFIX_SIZE {
        return None;
    }
    let area = u16::from_be_bytes([merged[0], merged[1]]);
    Some((area, &merged[AREA_PREFIX_SIZE..]))
}

/// `bucket || area || key`
pub fn bucket_key(bucket: u32, area: u16, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BUCKET_PREFIX_SIZE + AREA_PREFIX_SIZE + key.len());
    out.extend_from_slice(&bucket.to_be_bytes());
    out.extend_from_slice(&area.to_be_bytes());
    out.extend_from_slice(key);
    out
}

/// Splits `bucket || area || key`.
pub fn split_bucket_key(physical: &[u8]) -> Option<(u32, u16, &[u8])> {
    if physical.len() < BUCKET_PREFIX_SIZE + AREA_PREFIX_SIZE {
        return None;
    }
    let bucket = u32::from_be_bytes([physical[0], physical[1], physical[2], physical[3]]);
    let (area, key) = split_area_key(&physical[BUCKET_PREFIX_SIZE..])?;
    Some((bucket, area, key))
}

/// First physical key of `bucket`.
pub fn bucket_prefix(bucket: u32) -> Vec<u8> {
    bucket.to_be_bytes().to_vec()
}

/// Smallest key strictly greater than every key starting with `prefix`,
/// or `None` when the prefix is all `0xff`.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_area_key_split() {
        let merged = area_key(0x0102, b"user");
        assert_eq!(&merged[..2], &[0x01, 0x02]);
        assert_eq!(split_area_key(&merged), Some((0x0102, &b"user"[..])));
        assert_eq!(split_area_key(&[1]), None);
    }

    #[test]
    fn test_bucket_key_split() {
        let physical = bucket_key(5, 2, b"k");
        assert_eq!(split_bucket_key(&physical), Some((5, 2, &b"k"[..])));
        assert_eq!(split_bucket_key(&physical[..5]), None);
    }

    #[test]
    fn test_bucket_keys_sort_by_bucket_then_area() {
        let mut keys = vec![
            bucket_key(6, 2, b"a"),
            bucket_key(5, 3, b"a"),
            bucket_key(5, 2, b"z"),
            bucket_key(256, 0, b"a"),
        ];
        keys.sort();
        let decoded: Vec<_> = keys
            .iter()
            .map(|k| {
                let (b, a, _) = split_bucket_key(k).unwrap();
                (b, a)
            })
            .collect();
        assert_eq!(decoded, vec![(5, 2), (5, 3), (6, 2), (256, 0)]);
    }

    #[test]
    fn test_layout_merged() {
        let key = DataKey::new(9, "abc");
        let physical = KeyLayout::BucketArea.encode(42, &key);
        assert_eq!(KeyLayout::BucketArea.merged(&physical), Some(&key.merged()[..]));

        let physical = KeyLayout::Area.encode(42, &key);
        assert_eq!(physical, key.merged());
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(&[0, 1]), Some(vec![0, 2]));
        assert_eq!(prefix_end(&[0, 0xff]), Some(vec![1]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }
}
