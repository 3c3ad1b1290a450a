//! Resident buckets of seen keys.

use std::collections::HashSet;

use crate::models::{BucketKey, DedupKey};
use crate::store::SeenKeys;

/// Lifecycle position of a bucket as seen by the manager.
///
/// `Unloaded -> Loading -> Resident (dirty <-> clean) -> Evicted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// Never requested, or dropped from memory while its slot is still live
    Unloaded,
    /// Load from the store in flight
    Loading,
    /// In memory; `dirty` while keys are not yet durably written
    Resident { dirty: bool },
    /// Slot expired; events for it are late
    Evicted,
}

/// Keys seen within one time slot.
#[derive(Debug)]
pub struct Bucket {
    key: BucketKey,
    seen: SeenKeys,
    /// Seen but not yet handed to a write
    unwritten: HashSet<DedupKey>,
    write_in_flight: bool,
    last_access_ms: i64,
}

impl Bucket {
    /// Bucket rebuilt from what the store returned.
    #[must_use]
    pub fn loaded(key: BucketKey, seen: Option<SeenKeys>, now_ms: i64) -> Self {
        Self {
            key,
            seen: seen.unwrap_or_default(),
            unwritten: HashSet::new(),
            write_in_flight: false,
            last_access_ms: now_ms,
        }
    }

    #[must_use]
    pub fn key(&self) -> BucketKey {
        self.key
    }

    #[must_use]
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains(key)
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.last_access_ms = self.last_access_ms.max(now_ms);
    }

    /// Record a key; returns `true` if it was not seen before.
    pub fn insert(&mut self, key: DedupKey, now_ms: i64) -> bool {
        self.touch(now_ms);
        if self.seen.contains(&key) {
            return false;
        }
        self.unwritten.insert(key.clone());
        self.seen.insert(key);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.write_in_flight || !self.unwritten.is_empty()
    }

    #[must_use]
    pub fn last_access_ms(&self) -> i64 {
        self.last_access_ms
    }

    /// Hand unwritten keys to a write, unless one is already running.
    pub fn begin_flush(&mut self) -> Option<Vec<DedupKey>> {
        if self.write_in_flight || self.unwritten.is_empty() {
            return None;
        }
        self.write_in_flight = true;
        let mut keys: Vec<_> = self.unwritten.drain().collect();
        keys.sort_unstable();
        Some(keys)
    }

    /// Settle a write started by [`Bucket::begin_flush`].
    ///
    /// Failed keys go back to the unwritten set for the next flush.
    pub fn finish_flush(&mut self, keys: Vec<DedupKey>, succeeded: bool) {
        self.write_in_flight = false;
        if !succeeded {
            self.unwritten.extend(keys);
        }
    }
}
