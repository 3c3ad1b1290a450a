//! S3 bucket store.
//!
//! S3 has no append, so every write becomes its own object:
//! `<prefix>/<bucket:020>/<nanos:020>-<seq:06>.json` holding a JSON array of
//! keys. A load lists the bucket's objects and unions them. Zero-padded
//! bucket keys keep listings sorted, which `delete_range` relies on.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use chrono::Utc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{BucketStore, SeenKeys};
use crate::errors::StoreError;
use crate::models::{BucketKey, DedupKey};

/// Bucket store backed by S3 (or an S3-compatible endpoint).
#[derive(Debug)]
pub struct S3BucketStore {
    bucket: String,
    root: String,
    region: Option<String>,
    endpoint: Option<String>,
    // Built on first use so it lives on the runtime that drives it
    client: OnceCell<Client>,
    seq: AtomicU64,
}

fn unavailable<E>(op: &str, e: E) -> StoreError
where
    E: std::error::Error,
{
    StoreError::Unavailable(format!("s3 {op} failed: {}", DisplayErrorContext(e)))
}

impl S3BucketStore {
    #[must_use]
    pub fn new(
        bucket: String,
        prefix: String,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Self {
        let trimmed = prefix.trim_matches('/');
        let root = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };

        Self {
            bucket,
            root,
            region,
            endpoint,
            client: OnceCell::new(),
            seq: AtomicU64::new(0),
        }
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
                if let Some(region) = &self.region {
                    loader = loader.region(Region::new(region.clone()));
                }
                if let Some(endpoint) = &self.endpoint {
                    loader = loader.endpoint_url(endpoint);
                }
                let sdk_config = loader.load().await;

                let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
                if self.endpoint.is_some() {
                    s3_config = s3_config.force_path_style(true);
                }
                info!(bucket = %self.bucket, root = %self.root, "s3 bucket store ready");
                Client::from_conf(s3_config.build())
            })
            .await
    }

    fn bucket_prefix(&self, bucket: BucketKey) -> String {
        format!("{}{bucket:020}/", self.root)
    }

    fn batch_object(&self, bucket: BucketKey) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        format!("{}{nanos:020}-{seq:06}.json", self.bucket_prefix(bucket))
    }

    /// Bucket key an object belongs to, if it follows our layout.
    fn bucket_of(&self, object: &str) -> Option<BucketKey> {
        let rest = object.strip_prefix(&self.root)?;
        let (segment, _) = rest.split_once('/')?;
        if segment.len() != 20 {
            return None;
        }
        segment.parse().ok()
    }

    /// List object keys, starting from `prefix` or after `start_after`.
    ///
    /// `keep` stops the listing early when it returns `false`.
    async fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        mut keep: impl FnMut(&str) -> bool,
    ) -> Result<Vec<String>, StoreError> {
        let client = self.client().await;
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut request = client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(after) = start_after {
                request = request.start_after(after);
            }
            if let Some(t) = &token {
                request = request.continuation_token(t);
            }
            let page = request
                .send()
                .await
                .map_err(|e| unavailable("list", e))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                if !keep(key) {
                    return Ok(objects);
                }
                objects.push(key.to_string());
            }

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => return Ok(objects),
            }
        }
    }

    async fn fetch(&self, bucket: BucketKey, object: &str) -> Result<Vec<DedupKey>, StoreError> {
        let response = self
            .client()
            .await
            .get_object()
            .bucket(&self.bucket)
            .key(object)
            .send()
            .await
            .map_err(|e| unavailable("get", e))?;
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| unavailable("read body", e))?;

        serde_json::from_slice(&body.into_bytes()).map_err(|e| StoreError::Corrupt {
            bucket,
            reason: format!("{object}: {e}"),
        })
    }
}

impl BucketStore for S3BucketStore {
    async fn load(&self, bucket: BucketKey) -> Result<Option<SeenKeys>, StoreError> {
        let objects = self.list(&self.bucket_prefix(bucket), None, |_| true).await?;
        if objects.is_empty() {
            return Ok(None);
        }

        let mut seen = HashSet::new();
        for object in &objects {
            seen.extend(self.fetch(bucket, object).await?);
        }
        debug!(bucket, objects = objects.len(), keys = seen.len(), "loaded bucket from s3");
        Ok(Some(seen))
    }

    async fn write(&self, bucket: BucketKey, keys: &[DedupKey]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }

        let body = serde_json::to_vec(keys)?;
        self.client()
            .await
            .put_object()
            .bucket(&self.bucket)
            .key(self.batch_object(bucket))
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| unavailable("put", e))?;
        Ok(())
    }

    async fn delete_range(&self, low: BucketKey, high: BucketKey) -> Result<(), StoreError> {
        let start_after = format!("{}{low:020}", self.root);
        let candidates = self
            .list(&self.root, Some(&start_after), |key| {
                self.bucket_of(key).is_none_or(|b| b <= high)
            })
            .await?;

        let client = self.client().await;
        let mut removed = 0usize;
        for object in candidates {
            if !self.bucket_of(&object).is_some_and(|b| (low..=high).contains(&b)) {
                continue;
            }
            client
                .delete_object()
                .bucket(&self.bucket)
                .key(&object)
                .send()
                .await
                .map_err(|e| unavailable("delete", e))?;
            removed += 1;
        }

        debug!(low, high, removed, "deleted bucket objects from s3");
        Ok(())
    }
}
