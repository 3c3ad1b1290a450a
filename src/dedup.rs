//! Deduplication core.
//!
//! Each event is checked against the bucket for its time slot. When that
//! bucket is not in memory yet, the event waits in a per-bucket FIFO queue
//! while the bucket loads; once it lands, the queue is replayed in arrival
//! order so every key is decided exactly once.
//!
//! Events for a slot that has already expired cannot be proven duplicates
//! and are emitted as [`Decision::Late`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::DedupConfig;
use crate::errors::DedupError;
use crate::manager::{BucketManager, LoadOutcome, ManagerStats, SweepReport};
use crate::models::{BucketKey, DedupEvent, DedupKey};
use crate::store::BucketStore;

/// Downstream channel for novel events.
pub trait Emitter<O> {
    fn emit(&mut self, item: O);
}

impl<O> Emitter<O> for Vec<O> {
    fn emit(&mut self, item: O) {
        self.push(item);
    }
}

impl<O> Emitter<O> for mpsc::UnboundedSender<O> {
    fn emit(&mut self, item: O) {
        if self.send(item).is_err() {
            warn!("output receiver dropped, discarding emitted event");
        }
    }
}

impl<O> Emitter<O> for broadcast::Sender<O> {
    fn emit(&mut self, item: O) {
        // No subscribers is not an error for a broadcast feed
        let _ = self.send(item);
    }
}

/// How an event was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    /// First occurrence of the key in its slot
    Novel,
    /// Key already seen in its slot
    Duplicate,
    /// Slot already expired; emitted because it cannot be proven a duplicate
    Late,
}

impl Decision {
    /// Check if this decision emits the event downstream.
    #[must_use]
    pub fn should_emit(self) -> bool {
        match self {
            Self::Novel | Self::Late => true,
            Self::Duplicate => false,
        }
    }
}

/// Result of handing an event to [`Deduper::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Decided(Decision),
    /// Waiting for its bucket to load
    Deferred,
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Events accepted (excludes malformed)
    pub processed: u64,
    /// Events emitted downstream (novel plus late)
    pub emitted: u64,
    pub duplicates: u64,
    pub late: u64,
    pub malformed: u64,
    /// Events that had to wait for a bucket load
    pub deferred: u64,
    /// Events currently waiting for a bucket load
    pub awaiting: usize,
}

impl DedupStats {
    fn record(&mut self, decision: Decision) {
        match decision {
            Decision::Novel => self.emitted += 1,
            Decision::Late => {
                self.emitted += 1;
                self.late += 1;
            }
            Decision::Duplicate => self.duplicates += 1,
        }
    }

    /// Share of decided events that were duplicates (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn dupe_rate(&self) -> f64 {
        let decided = self.emitted + self.duplicates;
        if decided == 0 {
            0.0
        } else {
            self.duplicates as f64 / decided as f64
        }
    }
}

/// Summary returned by [`Deduper::end_window`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowReport {
    pub window: Option<u64>,
    /// Decisions made during this window, including replays of earlier events
    pub stats: DedupStats,
    pub buckets: ManagerStats,
    /// Buckets whose stored content could not be read; their events stay queued
    pub stalled: Vec<BucketKey>,
}

struct Waiting<E> {
    key: DedupKey,
    event: E,
}

/// Time-windowed deduplicator over a durable bucket store.
///
/// Drive it from one thread, outside any tokio runtime, following the host
/// lifecycle: `setup`, then repeated `begin_window` / `process` /
/// `end_window`, `handle_idle_time` whenever input is idle, and `teardown`.
pub struct Deduper<E, O, S: BucketStore> {
    manager: BucketManager<S>,
    awaiting: HashMap<BucketKey, VecDeque<Waiting<E>>>,
    /// Loads rejected by the store during the current window
    stalled: HashSet<BucketKey>,
    convert: Box<dyn FnMut(E) -> O + Send>,
    output: Box<dyn Emitter<O> + Send>,
    drain_timeout: Duration,
    window: Option<u64>,
    window_stats: DedupStats,
    stats: DedupStats,
}

impl<E, O, S> Deduper<E, O, S>
where
    E: DedupEvent,
    S: BucketStore,
{
    /// Build a deduplicator.
    ///
    /// `convert` turns each emitted event into its output record and runs
    /// exactly once per emission.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::Config`] for invalid settings or
    /// [`DedupError::Runtime`] if the store I/O threads cannot start.
    pub fn setup<F, Em>(
        config: &DedupConfig,
        store: S,
        clock: Arc<dyn Clock>,
        convert: F,
        output: Em,
    ) -> Result<Self, DedupError>
    where
        F: FnMut(E) -> O + Send + 'static,
        Em: Emitter<O> + Send + 'static,
    {
        let manager = BucketManager::new(config, store, clock)?;
        info!(
            span_ms = config.bucket_span_ms(),
            buckets = config.bucket_count,
            grace_ms = config.grace_period_ms(),
            "deduper ready"
        );

        Ok(Self {
            manager,
            awaiting: HashMap::new(),
            stalled: HashSet::new(),
            convert: Box::new(convert),
            output: Box::new(output),
            drain_timeout: config.drain_timeout,
            window: None,
            window_stats: DedupStats::default(),
            stats: DedupStats::default(),
        })
    }

    pub fn begin_window(&mut self, window: u64) {
        self.window = Some(window);
        self.window_stats = DedupStats::default();
        // Each window gets one more attempt at rejected buckets
        self.stalled.clear();
        debug!(window, "begin window");
    }

    /// Classify one event, emitting it if it is novel or late.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::MalformedKey`] if the event has no usable key or
    /// timestamp; such events are counted and never emitted.
    pub fn process(&mut self, event: E) -> Result<Disposition, DedupError> {
        let (key, bucket) = match self.locate(&event) {
            Ok(located) => located,
            Err(e) => {
                self.stats.malformed += 1;
                self.window_stats.malformed += 1;
                return Err(e);
            }
        };
        self.stats.processed += 1;
        self.window_stats.processed += 1;

        if self.manager.is_expired(bucket) {
            return Ok(Disposition::Decided(self.late(bucket, &key, event)));
        }

        // Anything already queued for this bucket goes first
        if let Some(queue) = self.awaiting.get_mut(&bucket) {
            queue.push_back(Waiting { key, event });
            self.defer();
            return Ok(Disposition::Deferred);
        }

        match self.decide(bucket, key, event) {
            Ok(decision) => Ok(Disposition::Decided(decision)),
            Err(waiting) => {
                self.awaiting.entry(bucket).or_default().push_back(waiting);
                self.manager.load_bucket_async(bucket);
                self.defer();
                Ok(Disposition::Deferred)
            }
        }
    }

    /// Idle hook: apply finished loads, retry stalled ones, and sweep
    /// expired or idle buckets.
    pub fn handle_idle_time(&mut self) -> SweepReport {
        let outcomes = self.manager.poll_completions();
        self.settle(outcomes);
        self.request_awaited_loads();

        let now = self.manager.now_ms();
        let mut report = self.manager.eviction_sweep(now);
        report.late_resolved = self.resolve_expired_awaiting();
        report
    }

    /// Close the current window: wait for outstanding loads so queued events
    /// get decided, then flush dirty buckets and wait for the writes.
    ///
    /// Waiting is bounded by the drain timeout; events still queued after
    /// that stay queued for the next window. Buckets the store rejected are
    /// not waited on and are listed in the report.
    pub fn end_window(&mut self) -> WindowReport {
        let deadline = Instant::now() + self.drain_timeout;

        let outcomes = self.manager.poll_completions();
        self.settle(outcomes);
        while self.has_loadable_awaiting() {
            self.request_awaited_loads();
            if !self.wait_until(deadline) {
                warn!(
                    window = ?self.window,
                    awaiting = self.awaiting_len(),
                    "bucket loads still pending at end of window"
                );
                break;
            }
        }

        self.manager.flush_dirty();
        while self.manager.writes_in_flight() > 0 {
            if !self.wait_until(deadline) {
                warn!(
                    window = ?self.window,
                    writes = self.manager.writes_in_flight(),
                    "bucket writes still pending at end of window"
                );
                break;
            }
        }

        let mut stalled: Vec<_> = self
            .stalled
            .iter()
            .copied()
            .filter(|b| self.awaiting.contains_key(b))
            .collect();
        stalled.sort_unstable();

        let report = WindowReport {
            window: self.window,
            stats: DedupStats {
                awaiting: self.awaiting_len(),
                ..self.window_stats
            },
            buckets: self.manager.stats(),
            stalled,
        };
        debug!(
            window = ?report.window,
            processed = report.stats.processed,
            emitted = report.stats.emitted,
            duplicates = report.stats.duplicates,
            late = report.stats.late,
            stalled = report.stalled.len(),
            "end window"
        );
        report
    }

    /// Flush what can be flushed and stop store I/O.
    ///
    /// Events still waiting for a bucket are dropped without a decision; on
    /// restart, state is rebuilt from the store alone.
    pub fn teardown(&mut self) {
        let deadline = Instant::now() + self.drain_timeout;
        self.manager.flush_dirty();
        while self.manager.writes_in_flight() > 0 && self.wait_until(deadline) {}

        if self.manager.has_dirty() {
            warn!("tearing down with unwritten keys");
        }
        let dropped = self.awaiting_len();
        if dropped > 0 {
            warn!(dropped, "tearing down with undecided events");
        }
        self.awaiting.clear();
        self.manager.shutdown();
        info!(
            processed = self.stats.processed,
            emitted = self.stats.emitted,
            duplicates = self.stats.duplicates,
            late = self.stats.late,
            "deduper stopped"
        );
    }

    #[must_use]
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            awaiting: self.awaiting_len(),
            ..self.stats
        }
    }

    #[must_use]
    pub fn manager(&self) -> &BucketManager<S> {
        &self.manager
    }

    fn locate(&self, event: &E) -> Result<(DedupKey, BucketKey), DedupError> {
        let key = event.dedup_key()?;
        let bucket = self.manager.bucket_key_for(event.timestamp_ms()?)?;
        Ok((key, bucket))
    }

    /// Decide against a resident bucket, or hand the event back if it is not.
    fn decide(
        &mut self,
        bucket: BucketKey,
        key: DedupKey,
        event: E,
    ) -> Result<Decision, Waiting<E>> {
        let decision = match self.manager.is_seen(bucket, &key) {
            None => return Err(Waiting { key, event }),
            Some(true) => Decision::Duplicate,
            Some(false) => {
                self.manager.new_event(bucket, key);
                self.emit(event);
                Decision::Novel
            }
        };
        self.record(decision);
        Ok(decision)
    }

    fn late(&mut self, bucket: BucketKey, key: &DedupKey, event: E) -> Decision {
        debug!(bucket, %key, "event for expired slot, emitting as late");
        self.emit(event);
        self.record(Decision::Late);
        Decision::Late
    }

    fn emit(&mut self, event: E) {
        let item = (self.convert)(event);
        self.output.emit(item);
    }

    fn record(&mut self, decision: Decision) {
        self.stats.record(decision);
        self.window_stats.record(decision);
    }

    fn defer(&mut self) {
        self.stats.deferred += 1;
        self.window_stats.deferred += 1;
    }

    fn settle(&mut self, outcomes: Vec<LoadOutcome>) {
        for outcome in outcomes {
            match outcome {
                LoadOutcome::Resident(bucket) => self.replay(bucket),
                LoadOutcome::Expired(bucket) => {
                    self.resolve_late(bucket);
                }
                // Reissued by the next idle tick or end-of-window drain
                LoadOutcome::Failed(_) => {}
                LoadOutcome::Rejected(bucket) => {
                    let queued = self.awaiting.get(&bucket).map_or(0, VecDeque::len);
                    warn!(bucket, queued, "bucket cannot be loaded, its events stay queued");
                    self.stalled.insert(bucket);
                }
            }
        }
    }

    /// Decide queued events of a freshly loaded bucket in arrival order.
    fn replay(&mut self, bucket: BucketKey) {
        let Some(mut queue) = self.awaiting.remove(&bucket) else {
            return;
        };
        let count = queue.len();

        while let Some(Waiting { key, event }) = queue.pop_front() {
            if let Err(waiting) = self.decide(bucket, key, event) {
                queue.push_front(waiting);
                self.awaiting.insert(bucket, queue);
                return;
            }
        }
        debug!(bucket, replayed = count, "replayed waiting events");
    }

    fn resolve_late(&mut self, bucket: BucketKey) -> usize {
        let Some(queue) = self.awaiting.remove(&bucket) else {
            return 0;
        };
        let count = queue.len();
        for Waiting { key, event } in queue {
            self.late(bucket, &key, event);
        }
        count
    }

    fn resolve_expired_awaiting(&mut self) -> usize {
        let expired: Vec<_> = self
            .awaiting
            .keys()
            .copied()
            .filter(|b| self.manager.is_expired(*b))
            .collect();
        expired.into_iter().map(|b| self.resolve_late(b)).sum()
    }

    fn request_awaited_loads(&mut self) {
        for bucket in self.awaiting.keys() {
            if !self.stalled.contains(bucket) {
                self.manager.load_bucket_async(*bucket);
            }
        }
    }

    fn has_loadable_awaiting(&self) -> bool {
        self.awaiting.keys().any(|b| !self.stalled.contains(b))
    }

    /// Wait for the next store completion and apply it.
    ///
    /// Returns `false` once the deadline has passed without one.
    fn wait_until(&mut self, deadline: Instant) -> bool {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match self.manager.wait_for_completion(remaining) {
            Some(outcomes) => {
                self.settle(outcomes);
                true
            }
            None => false,
        }
    }

    fn awaiting_len(&self) -> usize {
        self.awaiting.values().map(VecDeque::len).sum()
    }
}
