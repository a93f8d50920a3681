//! Striped key locks
//!
//! A fixed array of mutexes; a key maps to `xxh3(key) % stripes`. Two keys
//! on the same stripe serialize even when unrelated. The stripe count only
//! trades memory for contention and never affects correctness.

use bucketdb_core::{Error, Result};
use std::sync::{Mutex, MutexGuard};
use xxhash_rust::xxh3::xxh3_64;

/// Held for the duration of one read-modify-write; released on drop.
pub type StripeGuard<'a> = MutexGuard<'a, ()>;

pub struct StripedLock {
    stripes: Box<[Mutex<()>]>,
}

impl StripedLock {
    /// `count` is clamped to at least one stripe.
    pub fn new(count: usize) -> Self {
        let stripes = (0..count.max(1)).map(|_| Mutex::new(())).collect();
        Self { stripes }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub fn index(&self, key: &[u8]) -> usize {
        (xxh3_64(key) % self.stripes.len() as u64) as usize
    }

    /// Blocks until the stripe owning `key` is free.
    pub fn lock(&self, key: &[u8]) -> Result<StripeGuard<'_>> {
        self.lock_index(self.index(key))
    }

    pub fn lock_index(&self, index: usize) -> Result<StripeGuard<'_>> {
        self.stripes
            .get(index)
            .ok_or_else(|| Error::InvalidOperation(format!("no lock stripe {}", index)))?
            .lock()
            .map_err(|_| Error::LockPoisoned)
    }
}
