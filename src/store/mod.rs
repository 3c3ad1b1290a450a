//! Durable bucket storage.
//!
//! A bucket store maps a bucket key to the set of dedup keys seen in that
//! slot. Writes append, so writing the same key twice is harmless; loads
//! return the union of everything written. No ordering is required across
//! different bucket keys.

mod fs;
mod memory;
mod s3;

use std::collections::HashSet;
use std::future::Future;

pub use fs::FsBucketStore;
pub use memory::MemoryBucketStore;
pub use s3::S3BucketStore;

use crate::config::StoreLocation;
use crate::errors::StoreError;
use crate::models::{BucketKey, DedupKey};

/// Seen keys persisted for one bucket.
pub type SeenKeys = HashSet<DedupKey>;

/// Key-range blob store holding seen-key sets per bucket.
pub trait BucketStore: Send + Sync + 'static {
    /// Load a bucket; `None` when nothing was ever written for it.
    fn load(
        &self,
        bucket: BucketKey,
    ) -> impl Future<Output = Result<Option<SeenKeys>, StoreError>> + Send;

    /// Append newly seen keys to a bucket.
    fn write(
        &self,
        bucket: BucketKey,
        keys: &[DedupKey],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove every bucket in `low..=high`.
    fn delete_range(
        &self,
        low: BucketKey,
        high: BucketKey,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Store backend chosen at startup.
#[derive(Debug)]
pub enum AnyStore {
    Memory(MemoryBucketStore),
    Fs(FsBucketStore),
    S3(S3BucketStore),
}

impl AnyStore {
    /// Build the backend for a configured location.
    #[must_use]
    pub fn open(location: &StoreLocation) -> Self {
        match location {
            StoreLocation::Memory => Self::Memory(MemoryBucketStore::new()),
            StoreLocation::Fs { root } => Self::Fs(FsBucketStore::new(root.clone())),
            StoreLocation::S3 {
                bucket,
                prefix,
                region,
                endpoint,
            } => Self::S3(S3BucketStore::new(
                bucket.clone(),
                prefix.clone(),
                region.clone(),
                endpoint.clone(),
            )),
        }
    }
}

impl BucketStore for AnyStore {
    async fn load(&self, bucket: BucketKey) -> Result<Option<SeenKeys>, StoreError> {
        match self {
            Self::Memory(s) => s.load(bucket).await,
            Self::Fs(s) => s.load(bucket).await,
            Self::S3(s) => s.load(bucket).await,
        }
    }

    async fn write(&self, bucket: BucketKey, keys: &[DedupKey]) -> Result<(), StoreError> {
        match self {
            Self::Memory(s) => s.write(bucket, keys).await,
            Self::Fs(s) => s.write(bucket, keys).await,
            Self::S3(s) => s.write(bucket, keys).await,
        }
    }

    async fn delete_range(&self, low: BucketKey, high: BucketKey) -> Result<(), StoreError> {
        match self {
            Self::Memory(s) => s.delete_range(low, high).await,
            Self::Fs(s) => s.delete_range(low, high).await,
            Self::S3(s) => s.delete_range(low, high).await,
        }
    }
}
