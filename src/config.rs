//! Engine and store configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::DedupError;

/// Backoff schedule for store calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Deduplication window and runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    /// Duration of one bucket slot
    pub bucket_span: Duration,
    /// Number of most recent slots kept live
    pub bucket_count: u64,
    /// Extra time a slot stays matchable after it leaves the window;
    /// also the minimum idle time before a live bucket may leave memory
    pub grace_period: Duration,
    /// Soft cap on buckets held in memory
    pub max_resident_buckets: usize,
    /// How long `end_window` waits for loads and writes
    pub drain_timeout: Duration,
    /// Worker threads for store I/O
    pub loader_threads: usize,
    pub retry: RetryConfig,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            bucket_span: Duration::from_secs(60),
            bucket_count: 60,
            grace_period: Duration::from_secs(60),
            max_resident_buckets: 1024,
            drain_timeout: Duration::from_secs(30),
            loader_threads: 2,
            retry: RetryConfig::default(),
        }
    }
}

impl DedupConfig {
    /// Check the settings can drive an engine.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<(), DedupError> {
        if self.bucket_span_ms() == 0 {
            return Err(DedupError::Config(
                "bucket span must be at least 1ms".into(),
            ));
        }
        if self.bucket_count == 0 {
            return Err(DedupError::Config("bucket count must be positive".into()));
        }
        if self.max_resident_buckets == 0 {
            return Err(DedupError::Config(
                "max resident buckets must be positive".into(),
            ));
        }
        if self.loader_threads == 0 {
            return Err(DedupError::Config("loader threads must be positive".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(DedupError::Config(format!(
                "backoff multiplier {} must be >= 1.0",
                self.retry.backoff_multiplier
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn bucket_span_ms(&self) -> u64 {
        u64::try_from(self.bucket_span.as_millis()).unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn grace_period_ms(&self) -> u64 {
        u64::try_from(self.grace_period.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Where seen-key buckets are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Process memory (lost on exit)
    Memory,
    /// One file per bucket under `root`
    Fs { root: PathBuf },
    /// Objects under `prefix` in an S3 bucket
    S3 {
        bucket: String,
        prefix: String,
        region: Option<String>,
        endpoint: Option<String>,
    },
}

/// Parse a duration such as `500ms`, `30s`, `5m` or `2h`.
///
/// A bare number is read as milliseconds.
///
/// # Errors
///
/// Returns a message naming the bad input.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;

    let millis = match unit.trim() {
        "" | "ms" => Some(value),
        "s" => value.checked_mul(1_000),
        "m" => value.checked_mul(60_000),
        "h" => value.checked_mul(3_600_000),
        other => return Err(format!("unknown duration unit '{other}' (expected ms, s, m, h)")),
    };

    millis
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration out of range: {s}"))
}
