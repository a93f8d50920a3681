//! Operation counters

use crate::cache::CacheStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of one storage instance
#[derive(Debug, Default)]
pub(crate) struct InstanceCounters {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub get_hits: AtomicU64,
    pub removes: AtomicU64,
    pub version_conflicts: AtomicU64,
    pub expired_reads: AtomicU64,
    pub scanned_items: AtomicU64,
    pub write_failures: AtomicU64,
}

impl InstanceCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, index: u32, buckets: usize) -> InstanceStats {
        InstanceStats {
            index,
            buckets,
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            get_hits: self.get_hits.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            expired_reads: self.expired_reads.load(Ordering::Relaxed),
            scanned_items: self.scanned_items.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one instance at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceStats {
    pub index: u32,
    /// Buckets currently served
    pub buckets: usize,
    pub puts: u64,
    pub gets: u64,
    /// Gets that returned a live record
    pub get_hits: u64,
    pub removes: u64,
    pub version_conflicts: u64,
    /// Reads (gets and scans) that found an expired record
    pub expired_reads: u64,
    pub scanned_items: u64,
    pub write_failures: u64,
}

impl InstanceStats {
    fn accumulate(&mut self, other: &InstanceStats) {
        self.buckets += other.buckets;
        self.puts += other.puts;
        self.gets += other.gets;
        self.get_hits += other.get_hits;
        self.removes += other.removes;
        self.version_conflicts += other.version_conflicts;
        self.expired_reads += other.expired_reads;
        self.scanned_items += other.scanned_items;
        self.write_failures += other.write_failures;
    }
}

/// Manager-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub instances: Vec<InstanceStats>,
    /// Sum over all instances; `index` is meaningless here
    pub total: InstanceStats,
    pub cache: Option<CacheStats>,
}

impl StoreStats {
    pub fn new(instances: Vec<InstanceStats>, cache: Option<CacheStats>) -> Self {
        let mut total = InstanceStats::default();
        for instance in &instances {
            total.accumulate(instance);
        }
        Self {
            instances,
            total,
            cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals() {
        let counters = InstanceCounters::default();
        InstanceCounters::incr(&counters.puts);
        InstanceCounters::incr(&counters.puts);
        InstanceCounters::incr(&counters.gets);

        let stats = StoreStats::new(
            vec![counters.snapshot(0, 3), counters.snapshot(1, 2)],
            None,
        );
        assert_eq!(stats.total.puts, 4);
        assert_eq!(stats.total.gets, 2);
        assert_eq!(stats.total.buckets, 5);
        assert_eq!(stats.instances[1].index, 1);
    }
}
