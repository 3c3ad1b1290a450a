//! In-process bucket store.
//!
//! Clones share the same buckets, so a test can keep a handle while the
//! engine owns another. Supports injected failures and latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{BucketStore, SeenKeys};
use crate::errors::StoreError;
use crate::models::{BucketKey, DedupKey};

#[derive(Debug, Default)]
struct Inner {
    buckets: Mutex<HashMap<BucketKey, SeenKeys>>,
    fail_loads: AtomicU32,
    fail_writes: AtomicU32,
    corrupt_loads: AtomicU32,
    load_delay_ms: AtomicU64,
    write_delay_ms: AtomicU64,
    loads: AtomicU32,
    writes: AtomicU32,
}

/// Bucket store held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBucketStore {
    inner: Arc<Inner>,
}

impl MemoryBucketStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` loads fail with [`StoreError::Unavailable`].
    pub fn fail_next_loads(&self, n: u32) {
        self.inner.fail_loads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, n: u32) {
        self.inner.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` loads fail with [`StoreError::Corrupt`], which is not retried.
    pub fn corrupt_next_loads(&self, n: u32) {
        self.inner.corrupt_loads.store(n, Ordering::SeqCst);
    }

    /// Delay every load by `delay`.
    pub fn set_load_delay(&self, delay: Duration) {
        self.inner.load_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    /// Delay every write by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.inner.write_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    /// Number of load calls served (including failed ones).
    #[must_use]
    pub fn load_count(&self) -> u32 {
        self.inner.loads.load(Ordering::SeqCst)
    }

    /// Number of write calls served (including failed ones).
    #[must_use]
    pub fn write_count(&self) -> u32 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Current contents of a bucket.
    #[must_use]
    pub fn snapshot(&self, bucket: BucketKey) -> Option<SeenKeys> {
        self.buckets().ok()?.get(&bucket).cloned()
    }

    /// Bucket keys currently stored, ascending.
    #[must_use]
    pub fn bucket_keys(&self) -> Vec<BucketKey> {
        let mut keys: Vec<_> = self
            .buckets()
            .map(|b| b.keys().copied().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys
    }

    fn buckets(&self) -> Result<MutexGuard<'_, HashMap<BucketKey, SeenKeys>>, StoreError> {
        self.inner
            .buckets
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    async fn pause(delay_ms: &AtomicU64) {
        let delay = delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl BucketStore for MemoryBucketStore {
    async fn load(&self, bucket: BucketKey) -> Result<Option<SeenKeys>, StoreError> {
        self.inner.loads.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.inner.load_delay_ms).await;
        if Self::take_failure(&self.inner.corrupt_loads) {
            return Err(StoreError::Corrupt {
                bucket,
                reason: "injected corruption".into(),
            });
        }
        if Self::take_failure(&self.inner.fail_loads) {
            return Err(StoreError::Unavailable(format!(
                "injected load failure for bucket {bucket}"
            )));
        }
        Ok(self.buckets()?.get(&bucket).cloned())
    }

    async fn write(&self, bucket: BucketKey, keys: &[DedupKey]) -> Result<(), StoreError> {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.inner.write_delay_ms).await;
        if Self::take_failure(&self.inner.fail_writes) {
            return Err(StoreError::Unavailable(format!(
                "injected write failure for bucket {bucket}"
            )));
        }
        self.buckets()?
            .entry(bucket)
            .or_default()
            .extend(keys.iter().cloned());
        Ok(())
    }

    async fn delete_range(&self, low: BucketKey, high: BucketKey) -> Result<(), StoreError> {
        self.buckets()?
            .retain(|key, _| !(low..=high).contains(key));
        Ok(())
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_load_unions_keys() {
        let store = MemoryBucketStore::new();
        store.write(3, &[DedupKey::single("a")]).await.unwrap();
        store
            .write(3, &[DedupKey::single("a"), DedupKey::single("b")])
            .await
            .unwrap();

        let seen = store.load(3).await.unwrap().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(store.load(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryBucketStore::new();
        store.fail_next_loads(1);
        assert!(store.load(1).await.is_err());
        assert!(store.load(1).await.is_ok());
        assert_eq!(store.load_count(), 2);

        store.corrupt_next_loads(1);
        assert!(matches!(
            store.load(1).await,
            Err(StoreError::Corrupt { bucket: 1, .. })
        ));
        assert!(store.load(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_range_is_inclusive() {
        let store = MemoryBucketStore::new();
        for bucket in 1..=5 {
            store.write(bucket, &[DedupKey::single("k")]).await.unwrap();
        }
        store.delete_range(2, 4).await.unwrap();
        assert_eq!(store.bucket_keys(), vec![1, 5]);
    }
}
