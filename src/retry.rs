//! Exponential backoff for store calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::errors::StoreError;
use crate::models::BucketKey;

/// Run `f` until it succeeds, fails permanently, or retries run out.
///
/// The last error is returned once `config.max_retries` retries have failed.
///
/// # Errors
///
/// Returns the final [`StoreError`] from `f`.
pub async fn with_backoff<F, Fut, T>(
    config: &RetryConfig,
    op: &'static str,
    bucket: BucketKey,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    warn!(op, bucket, retries = config.max_retries, "giving up: {e}");
                    return Err(e);
                }

                warn!(
                    op,
                    bucket,
                    attempt,
                    delay_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    "store call failed, retrying: {e}"
                );
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, config);
            }
        }
    }
}

fn next_backoff(current: Duration, config: &RetryConfig) -> Duration {
    current
        .mul_f64(config.backoff_multiplier)
        .min(config.max_backoff)
}
