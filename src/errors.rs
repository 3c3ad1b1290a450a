//! Error types for bucketdedup.
//!
//! Uses `thiserror` for library-style error definitions.

use thiserror::Error;

use crate::models::BucketKey;

/// Errors raised by a bucket store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend could not be reached or refused the request
    #[error("bucket store unavailable: {0}")]
    Unavailable(String),

    /// Persisted bucket content could not be interpreted
    #[error("bucket {bucket} is corrupt: {reason}")]
    Corrupt { bucket: BucketKey, reason: String },

    /// Local filesystem failure
    #[error("bucket store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Key encoding failed
    #[error("failed to encode dedup keys: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same call can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io(_) => true,
            Self::Corrupt { .. } | Self::Codec(_) => false,
        }
    }
}

/// Errors surfaced by the deduplication engine.
#[derive(Error, Debug)]
pub enum DedupError {
    /// Event lacks a usable dedup key or timestamp
    #[error("malformed event key: {0}")]
    MalformedKey(String),

    /// Store call failed after retries
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Loader runtime could not be started
    #[error("failed to start loader runtime: {0}")]
    Runtime(#[from] std::io::Error),
}
