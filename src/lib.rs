//! BucketDedup - time-windowed event deduplication with durable seen-key state.
//!
//! Events are partitioned into fixed time slots. Each slot keeps the set of
//! keys seen in it, persisted through a [`BucketStore`], so a restarted
//! process still recognizes duplicates within the retention window.

pub mod bucket;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod manager;
pub mod models;
pub mod output;
pub mod retry;
pub mod server;
pub mod store;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DedupConfig, RetryConfig, StoreLocation};
pub use dedup::{Decision, DedupStats, Deduper, Disposition, Emitter, WindowReport};
pub use errors::{DedupError, StoreError};
pub use manager::{BucketManager, SweepReport};
pub use models::{BucketKey, DedupEvent, DedupKey, JsonEvent, KeyField, KeySpec};
pub use store::{AnyStore, BucketStore, FsBucketStore, MemoryBucketStore, S3BucketStore};
