use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::CacheKey;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub buffer: Bytes,
    pub inserted_at: Instant,
}

/// Bounded, insertion-ordered in-memory tier.
///
/// Backed by an [`LruCache`] that is only ever touched through `peek`, `pop`
/// and `push`, so recency never changes on reads and the eviction victim is
/// always the oldest insertion.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the buffer if present and younger than the TTL. A stale entry is
    /// dropped as part of the lookup.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let mut entries = self.lock();
        let expired = match entries.peek(key) {
            None => return None,
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
        };
        if expired {
            entries.pop(key);
            debug!(%key, "dropped expired memory cache entry");
            return None;
        }
        entries.peek(key).map(|entry| entry.buffer.clone())
    }

    /// Inserts `buffer`, evicting the earliest insertion when full. Re-inserting
    /// an existing key moves it to the newest position with a fresh timestamp.
    pub fn put(&self, key: CacheKey, buffer: Bytes) {
        let entry = CacheEntry {
            key,
            buffer,
            inserted_at: Instant::now(),
        };
        let mut entries = self.lock();
        entries.pop(&key);
        if let Some((evicted, _)) = entries.push(key, entry) {
            debug!(key = %evicted, "evicted oldest memory cache entry");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains(key)
    }
}
