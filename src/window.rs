//! Sliding-window arithmetic: slot partitioning, expiry, idle eviction.
//!
//! A slot `k` covers `[k * span, (k + 1) * span)`. It stays live while it is
//! one of the `bucket_count` most recent slots, plus the grace period:
//!
//! ```text
//! expired(k)  <=>  (k + bucket_count) * span + grace <= now
//! ```
//!
//! Everything here is pure so the sweep can be tested without a store.

use crate::config::DedupConfig;
use crate::errors::DedupError;
use crate::models::BucketKey;

/// A resident bucket considered for memory-pressure eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleCandidate {
    pub key: BucketKey,
    pub last_access_ms: i64,
    /// Clean, no write in flight
    pub evictable: bool,
}

/// Window settings reduced to integer milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    span_ms: u64,
    bucket_count: u64,
    grace_ms: u64,
    max_resident: usize,
}

impl WindowPolicy {
    #[must_use]
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            span_ms: config.bucket_span_ms().max(1),
            bucket_count: config.bucket_count.max(1),
            grace_ms: config.grace_period_ms(),
            max_resident: config.max_resident_buckets.max(1),
        }
    }

    /// Slot an event time falls into. Depends only on configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::MalformedKey`] for times before the epoch.
    pub fn bucket_key_for(&self, timestamp_ms: i64) -> Result<BucketKey, DedupError> {
        let ts = u64::try_from(timestamp_ms).map_err(|_| {
            DedupError::MalformedKey(format!("timestamp {timestamp_ms} is before the epoch"))
        })?;
        Ok(ts / self.span_ms)
    }

    /// Highest expired slot at `now_ms`, if any slot has expired yet.
    #[must_use]
    pub fn expiry_cutoff(&self, now_ms: i64) -> Option<BucketKey> {
        let now = u64::try_from(now_ms).ok()?;
        let horizon = now.checked_sub(self.grace_ms)?;
        (horizon / self.span_ms).checked_sub(self.bucket_count)
    }

    /// Live buckets to drop from memory to get back under the resident cap.
    ///
    /// Only evictable buckets idle for at least the grace period qualify,
    /// least recently used first.
    #[must_use]
    pub fn idle_victims(
        &self,
        candidates: &[IdleCandidate],
        resident: usize,
        now_ms: i64,
    ) -> Vec<BucketKey> {
        let overflow = resident.saturating_sub(self.max_resident);
        if overflow == 0 {
            return Vec::new();
        }

        let grace = i64::try_from(self.grace_ms).unwrap_or(i64::MAX);
        let mut idle: Vec<_> = candidates
            .iter()
            .filter(|c| c.evictable && now_ms.saturating_sub(c.last_access_ms) >= grace)
            .collect();
        idle.sort_by_key(|c| (c.last_access_ms, c.key));
        idle.into_iter().take(overflow).map(|c| c.key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(span_ms: u64, count: u64, grace_ms: u64, max_resident: usize) -> WindowPolicy {
        WindowPolicy::new(&DedupConfig {
            bucket_span: Duration::from_millis(span_ms),
            bucket_count: count,
            grace_period: Duration::from_millis(grace_ms),
            max_resident_buckets: max_resident,
            ..Default::default()
        })
    }

    #[test]
    fn test_bucket_key_is_floor_division() {
        let p = policy(1_000, 1, 0, 10);
        assert_eq!(p.bucket_key_for(0).unwrap(), 0);
        assert_eq!(p.bucket_key_for(999).unwrap(), 0);
        assert_eq!(p.bucket_key_for(1_000).unwrap(), 1);
    }

    #[test]
    fn test_negative_timestamp_is_malformed() {
        let p = policy(1_000, 1, 0, 10);
        assert!(matches!(
            p.bucket_key_for(-1),
            Err(DedupError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_expiry_cutoff_single_slot_window() {
        let p = policy(1_000, 1, 0, 10);
        assert_eq!(p.expiry_cutoff(999), None);
        // Slot 0 ends at 1000 and leaves the one-slot window right then
        assert_eq!(p.expiry_cutoff(1_000), Some(0));
        assert_eq!(p.expiry_cutoff(2_999), Some(1));
    }

    #[test]
    fn test_expiry_cutoff_counts_window_and_grace() {
        let p = policy(1_000, 3, 500, 10);
        // Slot 0 expires at (0 + 3) * 1000 + 500
        assert_eq!(p.expiry_cutoff(3_499), None);
        assert_eq!(p.expiry_cutoff(3_500), Some(0));
        assert_eq!(p.expiry_cutoff(4_500), Some(1));
        assert_eq!(p.expiry_cutoff(-5), None);
    }

    #[test]
    fn test_no_idle_victims_under_cap() {
        let p = policy(1_000, 1, 0, 4);
        let candidates = [IdleCandidate {
            key: 1,
            last_access_ms: 0,
            evictable: true,
        }];
        assert!(p.idle_victims(&candidates, 4, 10_000).is_empty());
    }

    #[test]
    fn test_idle_victims_lru_within_grace_rules() {
        let p = policy(1_000, 1, 100, 2);
        let candidates = [
            IdleCandidate {
                key: 1,
                last_access_ms: 50,
                evictable: true,
            },
            IdleCandidate {
                key: 2,
                last_access_ms: 10,
                evictable: true,
            },
            IdleCandidate {
                key: 3,
                last_access_ms: 5,
                evictable: false,
            },
            IdleCandidate {
                key: 4,
                last_access_ms: 980,
                evictable: true,
            },
        ];

        // Two over the cap; bucket 3 is dirty and bucket 4 was touched too recently
        assert_eq!(p.idle_victims(&candidates, 4, 1_000), vec![2, 1]);
        assert_eq!(p.idle_victims(&candidates, 3, 1_000), vec![2]);
    }
}
