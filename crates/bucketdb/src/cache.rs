//! Record cache in front of the LSM engine
//!
//! The cache holds encoded records keyed by physical key. It is never
//! authoritative: a miss falls through to the engine, and writes either
//! refresh or invalidate the cached copy.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Cache interface seen by storage instances
pub trait RecordCache: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn put(&self, area: u16, key: &[u8], record: &[u8]);

    fn remove(&self, key: &[u8]);

    /// Drops every key starting with `prefix`.
    fn remove_prefix(&self, prefix: &[u8]);

    /// Drops every record of `area`.
    fn clear_area(&self, area: u16);

    /// Caps the bytes `area` may occupy; 0 removes the cap.
    fn set_area_quota(&self, area: u16, quota: u64);

    fn set_area_quotas(&self, quotas: &HashMap<u16, u64>) {
        for (area, quota) in quotas {
            self.set_area_quota(*area, *quota);
        }
    }

    fn stats(&self) -> CacheStats;
}

/// Counters of a cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CachedRecord {
    area: u16,
    record: Vec<u8>,
    seq: u64,
}

impl CachedRecord {
    fn size(&self, key: &[u8]) -> u64 {
        (key.len() + self.record.len()) as u64
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Vec<u8>, CachedRecord>,
    /// Insertion order; entries whose `seq` no longer matches are stale
    order: VecDeque<(u64, Vec<u8>)>,
    area_used: HashMap<u16, u64>,
    quotas: HashMap<u16, u64>,
    used: u64,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn quota(&self, area: u16) -> Option<u64> {
        self.quotas.get(&area).copied().filter(|q| *q > 0)
    }

    fn area_used(&self, area: u16) -> u64 {
        self.area_used.get(&area).copied().unwrap_or(0)
    }

    fn remove_entry(&mut self, key: &[u8]) -> bool {
        let Some(old) = self.entries.remove(key) else {
            return false;
        };
        let size = old.size(key);
        self.used -= size;
        if let Some(used) = self.area_used.get_mut(&old.area) {
            *used -= size;
        }
        true
    }

    fn is_live(&self, seq: u64, key: &[u8]) -> bool {
        self.entries.get(key).is_some_and(|e| e.seq == seq)
    }

    /// Evicts the oldest record, restricted to `area` when given.
    fn evict_oldest(&mut self, area: Option<u16>) -> bool {
        let position = self.order.iter().position(|(seq, key)| {
            self.entries
                .get(key)
                .is_some_and(|e| e.seq == *seq && area.map_or(true, |a| e.area == a))
        });
        let Some(position) = position else {
            return false;
        };
        let Some((_, key)) = self.order.remove(position) else {
            return false;
        };
        self.evictions += 1;
        self.remove_entry(&key)
    }

    fn compact_order(&mut self) {
        if self.order.len() > 2 * self.entries.len() + 64 {
            let order = std::mem::take(&mut self.order);
            self.order = order
                .into_iter()
                .filter(|(seq, key)| self.is_live(*seq, key))
                .collect();
        }
    }
}

/// In-memory FIFO cache with a global capacity and per-area quotas
pub struct MemoryCache {
    capacity: u64,
    state: Mutex<CacheState>,
}

impl MemoryCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    // Entries are copies; a poisoned guard is still usable
    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordCache for MemoryCache {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.state();
        let found = state.entries.get(key).map(|e| e.record.clone());
        match found {
            Some(_) => state.hits += 1,
            None => state.misses += 1,
        }
        found
    }

    fn put(&self, area: u16, key: &[u8], record: &[u8]) {
        let mut state = self.state();
        state.remove_entry(key);

        let size = (key.len() + record.len()) as u64;
        let limit = state.quota(area).unwrap_or(u64::MAX).min(self.capacity);
        if size > limit {
            return;
        }

        while state.quota(area).is_some_and(|q| state.area_used(area) + size > q) {
            if !state.evict_oldest(Some(area)) {
                break;
            }
        }
        while state.used + size > self.capacity {
            if !state.evict_oldest(None) {
                break;
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key.to_vec(),
            CachedRecord {
                area,
                record: record.to_vec(),
                seq,
            },
        );
        state.order.push_back((seq, key.to_vec()));
        state.used += size;
        *state.area_used.entry(area).or_insert(0) += size;
        state.compact_order();
    }

    fn remove(&self, key: &[u8]) {
        let mut state = self.state();
        state.remove_entry(key);
        state.compact_order();
    }

    fn remove_prefix(&self, prefix: &[u8]) {
        let mut state = self.state();
        let doomed: Vec<Vec<u8>> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in doomed {
            state.remove_entry(&key);
        }
        state.compact_order();
    }

    fn clear_area(&self, area: u16) {
        let mut state = self.state();
        let doomed: Vec<Vec<u8>> = state
            .entries
            .iter()
            .filter(|(_, e)| e.area == area)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            state.remove_entry(&key);
        }
        state.compact_order();
    }

    fn set_area_quota(&self, area: u16, quota: u64) {
        let mut state = self.state();
        if quota == 0 {
            state.quotas.remove(&area);
            return;
        }
        state.quotas.insert(area, quota);
        while state.area_used(area) > quota {
            if !state.evict_oldest(Some(area)) {
                break;
            }
        }
        tracing::debug!(area, quota, "cache area quota set");
    }

    fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            entries: state.entries.len(),
            used_bytes: state.used,
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let cache = MemoryCache::new(1024);
        cache.put(1, b"k1", b"record");
        assert_eq!(cache.get(b"k1"), Some(b"record".to_vec()));
        assert_eq!(cache.get(b"k2"), None);

        cache.remove(b"k1");
        assert_eq!(cache.get(b"k1"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.used_bytes, 0);
    }

    #[test]
    fn test_overwrite_accounts_once() {
        let cache = MemoryCache::new(1024);
        cache.put(1, b"k", b"aaaa");
        cache.put(1, b"k", b"bb");
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.used_bytes, 3);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = MemoryCache::new(30);
        cache.put(1, b"a", &[0u8; 9]);
        cache.put(2, b"b", &[0u8; 9]);
        cache.put(1, b"c", &[0u8; 9]);
        cache.put(2, b"d", &[0u8; 9]);

        assert_eq!(cache.get(b"a"), None);
        assert!(cache.get(b"b").is_some());
        assert!(cache.get(b"d").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_area_quota_evicts_within_area() {
        let cache = MemoryCache::new(1024);
        cache.put(2, b"other", &[0u8; 10]);
        cache.set_area_quota(1, 20);
        cache.put(1, b"a", &[0u8; 9]);
        cache.put(1, b"b", &[0u8; 9]);
        cache.put(1, b"c", &[0u8; 9]);

        assert_eq!(cache.get(b"a"), None);
        assert!(cache.get(b"b").is_some());
        assert!(cache.get(b"c").is_some());
        assert!(cache.get(b"other").is_some());

        cache.put(1, b"huge", &[0u8; 64]);
        assert_eq!(cache.get(b"huge"), None);
    }

    #[test]
    fn test_shrinking_quota_evicts() {
        let cache = MemoryCache::new(1024);
        for key in [b"a", b"b", b"c"] {
            cache.put(7, key, &[0u8; 9]);
        }
        let mut quotas = HashMap::new();
        quotas.insert(7u16, 10u64);
        cache.set_area_quotas(&quotas);
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.get(b"c").is_some());
    }

    #[test]
    fn test_clear_area_and_prefix() {
        let cache = MemoryCache::new(1024);
        cache.put(1, b"\x00\x05a", b"1");
        cache.put(1, b"\x00\x06b", b"2");
        cache.put(3, b"\x00\x05c", b"3");

        cache.clear_area(1);
        assert_eq!(cache.stats().entries, 1);

        cache.remove_prefix(b"\x00\x05");
        assert_eq!(cache.stats().entries, 0);
    }
}
