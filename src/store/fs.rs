//! Filesystem bucket store.
//!
//! Layout: `<root>/<bucket:020>.keys`, one JSON-encoded dedup key per line.
//! Writes append and sync, so a crash can at worst leave a torn final line.
//! Loads skip it; the next write cuts it off before appending.

use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{BucketStore, SeenKeys};
use crate::errors::StoreError;
use crate::models::{BucketKey, DedupKey};

const EXTENSION: &str = "keys";

/// Bucket store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsBucketStore {
    root: PathBuf,
}

impl FsBucketStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, bucket: BucketKey) -> PathBuf {
        self.root.join(format!("{bucket:020}.{EXTENSION}"))
    }
}

/// Bucket key encoded in a file name, if it is one of ours.
fn bucket_of(path: &Path) -> Option<BucketKey> {
    if path.extension()? != EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn decode(bucket: BucketKey, contents: &str) -> Result<SeenKeys, StoreError> {
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut seen = HashSet::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str::<DedupKey>(line) {
            Ok(key) => {
                seen.insert(key);
            }
            // Only the final line can be torn by a crash mid-append
            Err(e) if i + 1 == lines.len() && !contents.ends_with('\n') => {
                warn!(bucket, "skipping torn trailing line: {e}");
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    bucket,
                    reason: format!("line {}: {e}", i + 1),
                });
            }
        }
    }

    Ok(seen)
}

/// Cut a torn trailing line so the next append starts on a fresh line.
async fn trim_torn_tail(file: &mut fs::File, bucket: BucketKey) -> Result<(), StoreError> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }

    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(());
    }

    file.seek(SeekFrom::Start(0)).await?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).await?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);

    warn!(
        bucket,
        dropped = contents.len() - keep,
        "truncating torn trailing line before append"
    );
    file.set_len(u64::try_from(keep).unwrap_or(len)).await?;
    Ok(())
}

impl BucketStore for FsBucketStore {
    async fn load(&self, bucket: BucketKey) -> Result<Option<SeenKeys>, StoreError> {
        let path = self.path_for(bucket);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let seen = decode(bucket, &contents)?;
        debug!(bucket, keys = seen.len(), "loaded bucket file");
        Ok(Some(seen))
    }

    async fn write(&self, bucket: BucketKey, keys: &[DedupKey]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for key in keys {
            serde_json::to_writer(&mut buf, key)?;
            buf.push(b'\n');
        }

        fs::create_dir_all(&self.root).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.path_for(bucket))
            .await?;
        trim_torn_tail(&mut file, bucket).await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn delete_range(&self, low: BucketKey, high: BucketKey) -> Result<(), StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(bucket) = bucket_of(&path) else {
                continue;
            };
            if !(low..=high).contains(&bucket) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        debug!(low, high, removed, "deleted bucket files");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBucketStore::new(dir.path().join("state"));

        assert!(store.load(42).await.unwrap().is_none());

        store
            .write(42, &[DedupKey::single("a"), DedupKey::single("b")])
            .await
            .unwrap();
        store.write(42, &[DedupKey::single("b")]).await.unwrap();

        let reopened = FsBucketStore::new(dir.path().join("state"));
        let seen = reopened.load(42).await.unwrap().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&DedupKey::single("a")));
    }

    #[tokio::test]
    async fn test_delete_range_only_touches_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBucketStore::new(dir.path());
        for bucket in [1, 2, 3, 10] {
            store.write(bucket, &[DedupKey::single("x")]).await.unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        store.delete_range(2, 3).await.unwrap();

        assert!(store.load(1).await.unwrap().is_some());
        assert!(store.load(2).await.unwrap().is_none());
        assert!(store.load(3).await.unwrap().is_none());
        assert!(store.load(10).await.unwrap().is_some());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_delete_range_on_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBucketStore::new(dir.path().join("never-created"));
        assert!(store.delete_range(0, 100).await.is_ok());
    }

    #[tokio::test]
    async fn test_append_after_torn_tail_keeps_bucket_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBucketStore::new(dir.path());
        let path = store.path_for(0);
        std::fs::write(&path, "[\"a\"]\n[\"b").unwrap();
        assert_eq!(store.load(0).await.unwrap().unwrap().len(), 1);

        store.write(0, &[DedupKey::single("c")]).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[\"a\"]\n[\"c\"]\n");
        let seen = store.load(0).await.unwrap().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&DedupKey::single("a")));
        assert!(seen.contains(&DedupKey::single("c")));
    }

    #[tokio::test]
    async fn test_append_after_torn_only_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBucketStore::new(dir.path());
        std::fs::write(store.path_for(3), "[\"tor").unwrap();

        store.write(3, &[DedupKey::single("x")]).await.unwrap();

        let seen = store.load(3).await.unwrap().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.contains(&DedupKey::single("x")));
    }

    #[test]
    fn test_torn_tail_is_skipped() {
        let seen = decode(5, "[\"a\"]\n[\"b\"]\n[\"c").unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let result = decode(5, "[\"a\"]\ngarbage\n[\"c\"]\n");
        assert!(matches!(result, Err(StoreError::Corrupt { bucket: 5, .. })));
    }

    #[test]
    fn test_bucket_file_names() {
        assert_eq!(bucket_of(Path::new("/x/00000000000000000007.keys")), Some(7));
        assert_eq!(bucket_of(Path::new("/x/00000000000000000007.tmp")), None);
        assert_eq!(bucket_of(Path::new("/x/readme.keys")), None);
    }
}
