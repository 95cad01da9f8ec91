use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, warn};

use super::CacheKey;

/// Files examined in parallel during a sweep.
const SWEEP_CONCURRENCY: usize = 16;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Outcome of one pass over the cache directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

enum FileOutcome {
    Kept,
    Removed,
    Failed,
    Skipped,
}

/// One `<key>.pdf` file per entry; modification time is the only age signal.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    retention: Duration,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Reads the entry for `key`. Missing, stale and unreadable files are all misses.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let path = self.path_for(key);
        match fs::metadata(&path).await {
            Ok(meta) if is_older_than(&meta, self.retention) => {
                debug!(%key, "disk cache entry past retention; treating as miss");
                return None;
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to stat cached PDF");
                return None;
            }
        }

        match fs::read(&path).await {
            Ok(buffer) => Some(Bytes::from(buffer)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read cached PDF");
                None
            }
        }
    }

    /// Writes the entry through a temporary sibling and a rename, so a reader
    /// sees either the previous file or the complete new one.
    pub async fn put(&self, key: &CacheKey, buffer: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let temp = self.dir.join(format!(
            ".{}.{}-{}.tmp",
            key.file_name(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let written = match fs::write(&temp, buffer).await {
            Ok(()) => fs::rename(&temp, &path).await,
            Err(err) => Err(err),
        };
        if written.is_err() {
            let _ = fs::remove_file(&temp).await;
        }
        written
    }

    /// Deletes regular files older than the retention threshold. A failure on
    /// one file is counted and the sweep carries on.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return report,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "failed to list cache directory");
                report.failed += 1;
                return report;
            }
        };

        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => paths.push(entry.path()),
                Ok(None) => break,
                Err(err) => {
                    warn!(dir = %self.dir.display(), error = %err, "cache directory listing interrupted");
                    report.failed += 1;
                    break;
                }
            }
        }

        let outcomes: Vec<FileOutcome> = stream::iter(paths)
            .map(|path| async move { self.sweep_file(&path).await })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                FileOutcome::Kept => report.scanned += 1,
                FileOutcome::Removed => {
                    report.scanned += 1;
                    report.removed += 1;
                }
                FileOutcome::Failed => {
                    report.scanned += 1;
                    report.failed += 1;
                }
                FileOutcome::Skipped => {}
            }
        }
        report
    }

    async fn sweep_file(&self, path: &Path) -> FileOutcome {
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            // Raced with a concurrent rename or removal.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return FileOutcome::Skipped,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "sweep could not stat file");
                return FileOutcome::Failed;
            }
        };
        if !meta.is_file() {
            return FileOutcome::Skipped;
        }
        if !is_older_than(&meta, self.retention) {
            return FileOutcome::Kept;
        }
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "swept stale cache file");
                FileOutcome::Removed
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "sweep could not remove file");
                FileOutcome::Failed
            }
        }
    }
}

fn is_older_than(meta: &std::fs::Metadata, retention: Duration) -> bool {
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > retention)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn backdate(path: &Path, by: Duration) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .expect("open cache file");
        file.set_modified(SystemTime::now() - by)
            .expect("set mtime");
    }

    #[tokio::test]
    async fn put_then_get_returns_same_bytes() {
        let dir = tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path().join("pdf_cache"), DAY);
        let key = CacheKey::derive(b"<p>doc</p>", Some("Acme"));

        cache.put(&key, b"%PDF-1.7 body").await.expect("write");

        assert_eq!(cache.get(&key).await, Some(Bytes::from_static(b"%PDF-1.7 body")));
        assert!(cache.path_for(&key).ends_with(key.file_name()));
        let leftovers: Vec<_> = std::fs::read_dir(cache.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temporary files should be renamed away");
    }

    #[tokio::test]
    async fn missing_file_is_a_miss() {
        let dir = tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path(), DAY);
        assert!(cache.get(&CacheKey::derive(b"nope", None)).await.is_none());
    }

    #[tokio::test]
    async fn entry_past_retention_is_a_miss() {
        let dir = tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path(), DAY);
        let key = CacheKey::derive(b"old", None);
        cache.put(&key, b"%PDF").await.expect("write");
        backdate(&cache.path_for(&key), DAY + Duration::from_secs(60));

        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn write_failure_is_reported_to_caller() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let cache = DiskCache::new(&blocker, DAY);

        let result = cache.put(&CacheKey::derive(b"x", None), b"%PDF").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sweep_removes_stale_and_keeps_fresh() {
        let dir = tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path(), DAY);
        let stale = CacheKey::derive(b"stale", None);
        let fresh = CacheKey::derive(b"fresh", None);
        cache.put(&stale, b"%PDF stale").await.unwrap();
        cache.put(&fresh, b"%PDF fresh").await.unwrap();
        backdate(&cache.path_for(&stale), DAY + Duration::from_secs(3600));
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let report = cache.sweep().await;

        assert_eq!(
            report,
            SweepReport {
                scanned: 2,
                removed: 1,
                failed: 0
            }
        );
        assert!(!cache.path_for(&stale).exists());
        assert!(cache.path_for(&fresh).exists());
        assert!(dir.path().join("nested").exists(), "directories are left alone");
    }

    #[tokio::test]
    async fn sweep_of_missing_directory_is_empty() {
        let dir = tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path().join("never-created"), DAY);
        assert_eq!(cache.sweep().await, SweepReport::default());
    }
}
