//! Two-tier render cache.
//!
//! - [`key`] - content-derived cache keys
//! - [`memory`] - bounded, insertion-ordered in-memory tier with a TTL
//! - [`disk`] - one file per key under a cache directory, swept by age
//!
//! [`CacheManager`] owns both tiers and the background sweeper.

mod disk;
mod key;
mod memory;

pub use disk::{DiskCache, SweepReport};
pub use key::CacheKey;
pub use memory::{CacheEntry, MemoryCache};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_MEMORY_CAPACITY: usize = 50;
pub const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_DISK_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Directory holding `<key>.pdf` files.
    pub dir: PathBuf,
    /// Maximum number of in-memory entries.
    pub memory_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub memory_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub disk_retention: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("pdf_cache"),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            memory_ttl: DEFAULT_MEMORY_TTL,
            disk_retention: DEFAULT_DISK_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug)]
pub struct CacheManager {
    memory: MemoryCache,
    disk: DiskCache,
    sweep_interval: Duration,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Creates both tiers without touching the filesystem. The cache
    /// directory is created by the first disk write; until then disk reads miss.
    pub fn new(options: &CacheOptions) -> Self {
        Self {
            memory: MemoryCache::new(options.memory_capacity, options.memory_ttl),
            disk: DiskCache::new(&options.dir, options.disk_retention),
            sweep_interval: options.sweep_interval,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn key(content: &[u8], label: Option<&str>) -> CacheKey {
        CacheKey::derive(content, label)
    }

    pub fn get_memory(&self, key: &CacheKey) -> Option<Bytes> {
        self.memory.get(key)
    }

    pub fn put_memory(&self, key: CacheKey, buffer: Bytes) {
        self.memory.put(key, buffer);
    }

    pub async fn get_disk(&self, key: &CacheKey) -> Option<Bytes> {
        self.disk.get(key).await
    }

    pub async fn put_disk(&self, key: &CacheKey, buffer: &[u8]) -> std::io::Result<()> {
        self.disk.put(key, buffer).await
    }

    pub async fn sweep(&self) -> SweepReport {
        let report = self.disk.sweep().await;
        if report.removed > 0 || report.failed > 0 {
            info!(
                removed = report.removed,
                failed = report.failed,
                scanned = report.scanned,
                "disk cache sweep finished"
            );
        } else {
            debug!(scanned = report.scanned, "disk cache sweep found nothing to remove");
        }
        report
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    /// Starts the periodic sweeper; the first pass runs one interval from now.
    /// Calling this again while a sweeper is running has no effect.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let period = self.sweep_interval.max(Duration::from_millis(1));
        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                }
            }
            debug!("disk cache sweeper stopped");
        }));
    }

    /// Stops the sweeper and waits for an in-progress pass to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
