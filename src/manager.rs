//! Bucket manager: partitioning, resident cache, async store I/O, eviction.
//!
//! The manager is owned by a single ingestion thread. Store calls run on a
//! private multi-threaded tokio runtime and report back over an unbounded
//! channel, so the ingestion side never waits unless it asks to
//! ([`BucketManager::wait_for_completion`]). That channel is the only point
//! where the two sides meet.
//!
//! Because the manager blocks on its own runtime when asked to wait, it must
//! not be driven from inside another tokio runtime.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::bucket::{Bucket, BucketState};
use crate::clock::Clock;
use crate::config::{DedupConfig, RetryConfig};
use crate::errors::{DedupError, StoreError};
use crate::models::{BucketKey, DedupKey};
use crate::retry::with_backoff;
use crate::store::{BucketStore, SeenKeys};
use crate::window::{IdleCandidate, WindowPolicy};

/// Grace given to in-flight store calls when shutting down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a store call, delivered to the ingestion thread.
#[derive(Debug)]
enum Completion {
    Loaded {
        bucket: BucketKey,
        result: Result<Option<SeenKeys>, StoreError>,
    },
    Written {
        bucket: BucketKey,
        keys: Vec<DedupKey>,
        result: Result<(), StoreError>,
    },
    Deleted {
        high: BucketKey,
        result: Result<(), StoreError>,
    },
}

/// What a finished load means for events waiting on that bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Bucket is resident; waiting events can be decided
    Resident(BucketKey),
    /// Slot expired while loading; the result was discarded
    Expired(BucketKey),
    /// Load gave up after retries; it will be requested again
    Failed(BucketKey),
    /// Store returned an error retrying cannot fix, such as corrupt content
    Rejected(BucketKey),
}

/// Changes made by one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Highest expired slot after the sweep
    pub expired_through: Option<BucketKey>,
    /// Resident buckets dropped because their slot expired
    pub expired: Vec<BucketKey>,
    /// Live buckets dropped from memory to respect the resident cap
    pub idle_evicted: Vec<BucketKey>,
    /// Storage range handed to `delete_range`
    pub delete_issued: Option<(BucketKey, BucketKey)>,
    /// Waiting events resolved as late because their slot expired
    pub late_resolved: usize,
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub resident: usize,
    pub loading: usize,
    pub dirty: usize,
    pub writes_in_flight: usize,
    pub expired_through: Option<BucketKey>,
    pub deleted_through: Option<BucketKey>,
}

/// Owns resident buckets and every interaction with the bucket store.
pub struct BucketManager<S: BucketStore> {
    policy: WindowPolicy,
    retry: RetryConfig,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    runtime: Option<Runtime>,
    completions_tx: UnboundedSender<Completion>,
    completions_rx: UnboundedReceiver<Completion>,
    buckets: HashMap<BucketKey, Bucket>,
    loading: HashSet<BucketKey>,
    writes_in_flight: HashSet<BucketKey>,
    delete_in_flight: bool,
    expired_through: Option<BucketKey>,
    deleted_through: Option<BucketKey>,
}

impl<S: BucketStore> BucketManager<S> {
    /// Validate `config` and start the store I/O runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::Config`] for invalid settings or
    /// [`DedupError::Runtime`] if the I/O threads cannot start.
    pub fn new(config: &DedupConfig, store: S, clock: Arc<dyn Clock>) -> Result<Self, DedupError> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.loader_threads)
            .thread_name("bucket-io")
            .enable_all()
            .build()?;
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Ok(Self {
            policy: WindowPolicy::new(config),
            retry: config.retry.clone(),
            store: Arc::new(store),
            clock,
            runtime: Some(runtime),
            completions_tx,
            completions_rx,
            buckets: HashMap::new(),
            loading: HashSet::new(),
            writes_in_flight: HashSet::new(),
            delete_in_flight: false,
            expired_through: None,
            deleted_through: None,
        })
    }

    /// Slot an event time falls into.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::MalformedKey`] for times before the epoch.
    pub fn bucket_key_for(&self, timestamp_ms: i64) -> Result<BucketKey, DedupError> {
        self.policy.bucket_key_for(timestamp_ms)
    }

    #[must_use]
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Whether the slot has been swept out of the window.
    #[must_use]
    pub fn is_expired(&self, bucket: BucketKey) -> bool {
        self.expired_through.is_some_and(|through| bucket <= through)
    }

    #[must_use]
    pub fn is_resident(&self, bucket: BucketKey) -> bool {
        self.buckets.contains_key(&bucket)
    }

    #[must_use]
    pub fn state(&self, bucket: BucketKey) -> BucketState {
        if self.is_expired(bucket) {
            BucketState::Evicted
        } else if let Some(b) = self.buckets.get(&bucket) {
            BucketState::Resident {
                dirty: b.is_dirty(),
            }
        } else if self.loading.contains(&bucket) {
            BucketState::Loading
        } else {
            BucketState::Unloaded
        }
    }

    /// Whether `key` was seen in a resident bucket; `None` if not resident.
    ///
    /// Counts as an access for idle eviction.
    pub fn is_seen(&mut self, bucket: BucketKey, key: &DedupKey) -> Option<bool> {
        let now = self.clock.now_ms();
        self.buckets.get_mut(&bucket).map(|b| {
            b.touch(now);
            b.contains(key)
        })
    }

    /// Record `key` in a resident bucket, marking it dirty.
    ///
    /// Returns `false` if the key was already seen or the bucket is not resident.
    pub fn new_event(&mut self, bucket: BucketKey, key: DedupKey) -> bool {
        let now = self.clock.now_ms();
        self.buckets
            .get_mut(&bucket)
            .is_some_and(|b| b.insert(key, now))
    }

    /// Request a bucket from the store unless it is resident, loading or expired.
    ///
    /// Returns `true` if a new load was issued.
    pub fn load_bucket_async(&mut self, bucket: BucketKey) -> bool {
        if self.is_expired(bucket)
            || self.buckets.contains_key(&bucket)
            || self.loading.contains(&bucket)
        {
            return false;
        }

        let store = Arc::clone(&self.store);
        let retry = self.retry.clone();
        let tx = self.completions_tx.clone();
        let spawned = self.spawn(async move {
            let result = with_backoff(&retry, "load", bucket, || store.load(bucket)).await;
            let _ = tx.send(Completion::Loaded { bucket, result });
        });

        if spawned {
            debug!(bucket, "bucket load issued");
            self.loading.insert(bucket);
        }
        spawned
    }

    /// Start a write for every dirty bucket without one in flight.
    ///
    /// Returns the number of writes issued.
    pub fn flush_dirty(&mut self) -> usize {
        if self.runtime.is_none() {
            return 0;
        }
        let batches: Vec<_> = self
            .buckets
            .values_mut()
            .filter_map(|b| b.begin_flush().map(|keys| (b.key(), keys)))
            .collect();

        let mut issued = 0;
        for (bucket, keys) in batches {
            let store = Arc::clone(&self.store);
            let retry = self.retry.clone();
            let tx = self.completions_tx.clone();
            let count = keys.len();
            // Keys are returned with the completion so a failure can requeue them
            let spawned = self.spawn(async move {
                let result =
                    with_backoff(&retry, "write", bucket, || store.write(bucket, &keys)).await;
                let _ = tx.send(Completion::Written {
                    bucket,
                    keys,
                    result,
                });
            });

            if spawned {
                debug!(bucket, keys = count, "bucket write issued");
                self.writes_in_flight.insert(bucket);
                issued += 1;
            } else if let Some(b) = self.buckets.get_mut(&bucket) {
                b.finish_flush(Vec::new(), true);
            }
        }
        issued
    }

    /// Apply every completion that has already arrived.
    pub fn poll_completions(&mut self) -> Vec<LoadOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(completion) = self.completions_rx.try_recv() {
            outcomes.extend(self.apply(completion));
        }
        outcomes
    }

    /// Block until a completion arrives or `timeout` passes, then apply it
    /// and anything else already queued.
    ///
    /// Returns `None` on timeout or after shutdown.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> Option<Vec<LoadOutcome>> {
        let runtime = self.runtime.as_ref()?;
        let rx = &mut self.completions_rx;
        let completion = runtime.block_on(async {
            tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
        })?;

        let mut outcomes: Vec<_> = self.apply(completion).into_iter().collect();
        outcomes.extend(self.poll_completions());
        Some(outcomes)
    }

    fn apply(&mut self, completion: Completion) -> Option<LoadOutcome> {
        match completion {
            Completion::Loaded { bucket, result } => {
                self.loading.remove(&bucket);
                match result {
                    _ if self.is_expired(bucket) => {
                        debug!(bucket, "discarding load for expired slot");
                        Some(LoadOutcome::Expired(bucket))
                    }
                    Ok(seen) => {
                        let bucket_state = Bucket::loaded(bucket, seen, self.clock.now_ms());
                        debug!(bucket, keys = bucket_state.len(), "bucket resident");
                        self.buckets.entry(bucket).or_insert(bucket_state);
                        Some(LoadOutcome::Resident(bucket))
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(bucket, "bucket load failed, events stay queued: {e}");
                        Some(LoadOutcome::Failed(bucket))
                    }
                    Err(e) => {
                        warn!(bucket, "bucket cannot be loaded: {e}");
                        Some(LoadOutcome::Rejected(bucket))
                    }
                }
            }
            Completion::Written {
                bucket,
                keys,
                result,
            } => {
                self.writes_in_flight.remove(&bucket);
                if let Err(e) = &result {
                    warn!(bucket, keys = keys.len(), "bucket write failed, keys stay dirty: {e}");
                }
                match self.buckets.get_mut(&bucket) {
                    Some(b) => b.finish_flush(keys, result.is_ok()),
                    None => debug!(bucket, "write finished for evicted bucket"),
                }
                None
            }
            Completion::Deleted { high, result } => {
                self.delete_in_flight = false;
                match result {
                    Ok(()) => self.deleted_through = Some(high),
                    Err(e) => warn!(high, "expired bucket deletion failed, will retry: {e}"),
                }
                None
            }
        }
    }

    #[must_use]
    pub fn loads_in_flight(&self) -> usize {
        self.loading.len()
    }

    #[must_use]
    pub fn writes_in_flight(&self) -> usize {
        self.writes_in_flight.len()
    }

    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.buckets.values().any(Bucket::is_dirty)
    }

    /// Expire slots that left the window, delete them from storage, and
    /// drop idle live buckets when over the resident cap.
    ///
    /// Only call this between event decisions.
    pub fn eviction_sweep(&mut self, now_ms: i64) -> SweepReport {
        let mut report = SweepReport::default();

        if let Some(cutoff) = self.policy.expiry_cutoff(now_ms) {
            if self.expired_through.is_none_or(|through| cutoff > through) {
                self.expired_through = Some(cutoff);
            }
        }

        if let Some(through) = self.expired_through {
            let mut expired: Vec<_> = self
                .buckets
                .keys()
                .copied()
                .filter(|k| *k <= through)
                .collect();
            expired.sort_unstable();
            for bucket in &expired {
                if let Some(b) = self.buckets.remove(bucket) {
                    if b.is_dirty() {
                        debug!(bucket, "dropping unwritten keys of expired bucket");
                    }
                }
            }
            report.expired = expired;
            report.delete_issued = self.delete_expired(through);
        }

        let candidates: Vec<_> = self
            .buckets
            .values()
            .map(|b| IdleCandidate {
                key: b.key(),
                last_access_ms: b.last_access_ms(),
                evictable: !b.is_dirty(),
            })
            .collect();
        report.idle_evicted = self
            .policy
            .idle_victims(&candidates, self.buckets.len(), now_ms);
        for bucket in &report.idle_evicted {
            self.buckets.remove(bucket);
        }

        report.expired_through = self.expired_through;
        if !report.expired.is_empty() || !report.idle_evicted.is_empty() {
            info!(
                expired = report.expired.len(),
                idle_evicted = report.idle_evicted.len(),
                expired_through = ?report.expired_through,
                resident = self.buckets.len(),
                "eviction sweep"
            );
        }
        report
    }

    /// Issue storage deletion for slots expired since the last deletion.
    fn delete_expired(&mut self, through: BucketKey) -> Option<(BucketKey, BucketKey)> {
        let low = self.deleted_through.map_or(0, |d| d.saturating_add(1));
        if low > through || self.delete_in_flight {
            return None;
        }
        // A write landing after the delete would resurrect the bucket
        if self.writes_in_flight.iter().any(|k| *k <= through) {
            debug!(through, "deferring deletion until expired writes settle");
            return None;
        }

        let store = Arc::clone(&self.store);
        let retry = self.retry.clone();
        let tx = self.completions_tx.clone();
        let spawned = self.spawn(async move {
            let result =
                with_backoff(&retry, "delete", through, || store.delete_range(low, through)).await;
            let _ = tx.send(Completion::Deleted {
                high: through,
                result,
            });
        });

        if spawned {
            self.delete_in_flight = true;
            Some((low, through))
        } else {
            None
        }
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            resident: self.buckets.len(),
            loading: self.loading.len(),
            dirty: self.buckets.values().filter(|b| b.is_dirty()).count(),
            writes_in_flight: self.writes_in_flight.len(),
            expired_through: self.expired_through,
            deleted_through: self.deleted_through,
        }
    }

    /// Stop the I/O runtime. In-flight calls get a short grace period.
    pub fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
            info!("bucket I/O runtime stopped");
        }
    }

    fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn(task);
                true
            }
            None => {
                warn!("bucket I/O requested after shutdown");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryBucketStore;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> DedupConfig {
        DedupConfig {
            bucket_span: Duration::from_millis(1_000),
            bucket_count: 1,
            grace_period: Duration::from_millis(0),
            max_resident_buckets: 16,
            retry: RetryConfig {
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn manager(
        config: &DedupConfig,
        store: &MemoryBucketStore,
        clock: &Arc<ManualClock>,
    ) -> BucketManager<MemoryBucketStore> {
        let clock: Arc<dyn Clock> = clock.clone();
        BucketManager::new(config, store.clone(), clock).unwrap()
    }

    fn await_outcome(m: &mut BucketManager<MemoryBucketStore>) -> Vec<LoadOutcome> {
        m.wait_for_completion(WAIT).expect("completion before timeout")
    }

    fn settle_writes(m: &mut BucketManager<MemoryBucketStore>) {
        while m.writes_in_flight() > 0 {
            m.wait_for_completion(WAIT).expect("write completion");
        }
    }

    #[test]
    fn test_load_transitions_to_resident() {
        let store = MemoryBucketStore::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        assert_eq!(m.state(3), BucketState::Unloaded);
        assert!(m.load_bucket_async(3));
        assert_eq!(m.state(3), BucketState::Loading);

        assert_eq!(await_outcome(&mut m), vec![LoadOutcome::Resident(3)]);
        assert_eq!(m.state(3), BucketState::Resident { dirty: false });
    }

    #[test]
    fn test_concurrent_requests_coalesce() {
        let store = MemoryBucketStore::new();
        store.set_load_delay(Duration::from_millis(20));
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        assert!(m.load_bucket_async(1));
        assert!(!m.load_bucket_async(1));
        assert!(!m.load_bucket_async(1));
        assert_eq!(m.loads_in_flight(), 1);
        await_outcome(&mut m);

        assert!(!m.load_bucket_async(1));
        assert_eq!(store.load_count(), 1);
    }

    #[test]
    fn test_new_event_requires_residency() {
        let store = MemoryBucketStore::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        let key = DedupKey::single("a");
        assert_eq!(m.is_seen(0, &key), None);
        assert!(!m.new_event(0, key.clone()));
        m.load_bucket_async(0);
        await_outcome(&mut m);

        assert_eq!(m.is_seen(0, &key), Some(false));
        assert!(m.new_event(0, key.clone()));
        assert!(!m.new_event(0, key.clone()));
        assert_eq!(m.is_seen(0, &key), Some(true));
        assert_eq!(m.state(0), BucketState::Resident { dirty: true });
    }

    #[test]
    fn test_flush_round_trips_through_store() {
        let store = MemoryBucketStore::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        m.load_bucket_async(0);
        await_outcome(&mut m);
        m.new_event(0, DedupKey::single("a"));
        m.new_event(0, DedupKey::single("b"));

        assert_eq!(m.flush_dirty(), 1);
        settle_writes(&mut m);
        assert_eq!(m.state(0), BucketState::Resident { dirty: false });
        assert_eq!(store.snapshot(0).unwrap().len(), 2);
        assert_eq!(m.flush_dirty(), 0);
    }

    #[test]
    fn test_failed_write_stays_dirty_until_retry_succeeds() {
        let store = MemoryBucketStore::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        m.load_bucket_async(0);
        await_outcome(&mut m);
        m.new_event(0, DedupKey::single("a"));

        // First attempt and its single retry both fail
        store.fail_next_writes(2);
        m.flush_dirty();
        settle_writes(&mut m);
        assert_eq!(m.state(0), BucketState::Resident { dirty: true });
        assert!(store.snapshot(0).is_none());

        m.flush_dirty();
        settle_writes(&mut m);
        assert_eq!(m.state(0), BucketState::Resident { dirty: false });
        assert!(store.snapshot(0).unwrap().contains(&DedupKey::single("a")));
    }

    #[test]
    fn test_failed_load_reports_and_can_be_reissued() {
        let store = MemoryBucketStore::new();
        store.fail_next_loads(2);
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        m.load_bucket_async(5);
        assert_eq!(await_outcome(&mut m), vec![LoadOutcome::Failed(5)]);
        assert_eq!(m.state(5), BucketState::Unloaded);

        assert!(m.load_bucket_async(5));
        assert_eq!(await_outcome(&mut m), vec![LoadOutcome::Resident(5)]);
    }

    #[test]
    fn test_corrupt_load_is_rejected_without_retry() {
        let store = MemoryBucketStore::new();
        store.corrupt_next_loads(1);
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        m.load_bucket_async(5);
        assert_eq!(await_outcome(&mut m), vec![LoadOutcome::Rejected(5)]);
        assert_eq!(store.load_count(), 1);
        assert_eq!(m.state(5), BucketState::Unloaded);

        assert!(m.load_bucket_async(5));
        assert_eq!(await_outcome(&mut m), vec![LoadOutcome::Resident(5)]);
    }

    #[test]
    fn test_sweep_expires_and_deletes_range() {
        let store = MemoryBucketStore::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        for bucket in [0, 1, 2] {
            m.load_bucket_async(bucket);
            await_outcome(&mut m);
            m.new_event(bucket, DedupKey::single("k"));
        }
        m.flush_dirty();
        settle_writes(&mut m);
        assert_eq!(store.bucket_keys(), vec![0, 1, 2]);

        // One-slot window: at 2000 slots 0 and 1 are out
        let report = m.eviction_sweep(2_000);
        assert_eq!(report.expired, vec![0, 1]);
        assert_eq!(report.expired_through, Some(1));
        assert_eq!(report.delete_issued, Some((0, 1)));
        assert_eq!(m.state(0), BucketState::Evicted);
        assert_eq!(m.state(2), BucketState::Resident { dirty: false });

        m.wait_for_completion(WAIT).expect("delete completion");
        assert_eq!(store.bucket_keys(), vec![2]);
        assert_eq!(m.stats().deleted_through, Some(1));

        // Nothing new to delete
        assert_eq!(m.eviction_sweep(2_000).delete_issued, None);
        assert!(!m.load_bucket_async(1));
    }

    #[test]
    fn test_deletion_waits_for_write_to_expired_bucket() {
        let store = MemoryBucketStore::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        m.load_bucket_async(0);
        await_outcome(&mut m);
        m.new_event(0, DedupKey::single("k"));
        store.set_write_delay(Duration::from_millis(100));
        assert_eq!(m.flush_dirty(), 1);

        // The write to slot 0 is still out when the slot expires
        let report = m.eviction_sweep(2_000);
        assert_eq!(report.expired, vec![0]);
        assert_eq!(report.delete_issued, None);
        assert_eq!(m.writes_in_flight(), 1);

        settle_writes(&mut m);
        assert_eq!(store.bucket_keys(), vec![0]);

        assert_eq!(m.eviction_sweep(2_000).delete_issued, Some((0, 1)));
        m.wait_for_completion(WAIT).expect("delete completion");
        assert!(store.bucket_keys().is_empty());
        assert_eq!(m.stats().deleted_through, Some(1));
    }

    #[test]
    fn test_load_completing_after_expiry_is_discarded() {
        let store = MemoryBucketStore::new();
        store.set_load_delay(Duration::from_millis(50));
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        m.load_bucket_async(0);
        m.eviction_sweep(5_000);

        let mut outcomes = Vec::new();
        while !outcomes.contains(&LoadOutcome::Expired(0)) {
            outcomes.extend(await_outcome(&mut m));
        }
        assert!(!m.is_resident(0));
        assert_eq!(m.state(0), BucketState::Evicted);
    }

    #[test]
    fn test_idle_buckets_leave_memory_but_not_storage() {
        let store = MemoryBucketStore::new();
        let clock = Arc::new(ManualClock::new(0));
        let config = DedupConfig {
            bucket_count: 1_000,
            max_resident_buckets: 2,
            ..config()
        };
        let mut m = manager(&config, &store, &clock);

        for bucket in [0, 1, 2] {
            clock.set(i64::try_from(bucket).unwrap());
            m.load_bucket_async(bucket);
            await_outcome(&mut m);
            m.new_event(bucket, DedupKey::single("k"));
        }

        // Dirty buckets are never dropped
        assert!(m.eviction_sweep(10).idle_evicted.is_empty());

        m.flush_dirty();
        settle_writes(&mut m);
        let report = m.eviction_sweep(10);
        assert_eq!(report.idle_evicted, vec![0]);
        assert_eq!(m.state(0), BucketState::Unloaded);
        assert!(store.snapshot(0).is_some());
    }

    #[test]
    fn test_no_io_after_shutdown() {
        let store = MemoryBucketStore::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut m = manager(&config(), &store, &clock);

        m.shutdown();
        assert!(!m.load_bucket_async(1));
        assert!(m.wait_for_completion(Duration::from_millis(10)).is_none());
    }
}
