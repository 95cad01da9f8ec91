//! The cache-fronted render operation and its lifecycle hooks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::browser::{BrowserManager, Engine};
use crate::cache::{CacheKey, CacheManager};
use crate::config::Config;
use crate::render::PdfRenderer;
use crate::{PdfError, Result};

/// Which layer answered a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Memory,
    Disk,
    Miss,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Memory => "memory",
            CacheTier::Disk => "disk",
            CacheTier::Miss => "miss",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RenderResult {
    pub buffer: Bytes,
    pub tier: CacheTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub engine_connected: bool,
    pub memory_cache_size: usize,
}

/// Retries timeouts only, each time on a replaced engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
}

impl RetryPolicy {
    pub fn should_retry(&self, err: &PdfError, retries_so_far: usize) -> bool {
        err.is_timeout() && retries_so_far < self.max_retries
    }
}

/// Shared by `Arc` between callers. Construct inside a Tokio runtime: the
/// disk sweeper and idle reaper start immediately.
pub struct RenderService {
    cache: Arc<CacheManager>,
    browser: BrowserManager,
    renderer: PdfRenderer,
    retry: RetryPolicy,
    writes: TaskTracker,
}

impl RenderService {
    pub fn new(config: &Config, engine: Arc<dyn Engine>) -> Self {
        let cache = Arc::new(CacheManager::new(&config.cache));
        cache.start_sweeper();
        Self {
            cache,
            browser: BrowserManager::new(engine, config.browser.clone()),
            renderer: PdfRenderer::new(config.render.clone()),
            retry: RetryPolicy {
                max_retries: config.render.max_retries,
            },
            writes: TaskTracker::new(),
        }
    }

    /// Returns the PDF for `html`, from memory, disk, or a fresh render.
    ///
    /// An empty `brand` is the same as none; any other value, whitespace
    /// included, is keyed as given. A fresh render is stored in memory
    /// before returning; the disk write happens in the background.
    pub async fn render_and_cache(&self, html: &str, brand: Option<&str>) -> Result<RenderResult> {
        let brand = brand.filter(|b| !b.is_empty());
        let key = CacheManager::key(html.as_bytes(), brand);

        if let Some(buffer) = self.cache.get_memory(&key) {
            debug!(%key, tier = "memory", "cache hit");
            return Ok(RenderResult {
                buffer,
                tier: CacheTier::Memory,
            });
        }

        if let Some(buffer) = self.cache.get_disk(&key).await {
            debug!(%key, tier = "disk", "cache hit");
            self.cache.put_memory(key, buffer.clone());
            return Ok(RenderResult {
                buffer,
                tier: CacheTier::Disk,
            });
        }

        let started = Instant::now();
        let buffer = self.render_with_retry(html, brand).await?;
        info!(
            %key,
            tier = "miss",
            bytes = buffer.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rendered and cached PDF"
        );
        self.cache.put_memory(key, buffer.clone());
        self.persist(key, buffer.clone());
        Ok(RenderResult {
            buffer,
            tier: CacheTier::Miss,
        })
    }

    async fn render_with_retry(&self, html: &str, brand: Option<&str>) -> Result<Bytes> {
        let mut retries = 0;
        loop {
            let handle = self.browser.acquire().await?;
            match self.renderer.render(&handle, html, brand).await {
                Ok(buffer) => return Ok(buffer),
                Err(err) if self.retry.should_retry(&err, retries) => {
                    retries += 1;
                    warn!(
                        generation = handle.generation(),
                        retry = retries,
                        error = %err,
                        "render timed out; replacing engine and retrying"
                    );
                    self.browser.invalidate(&handle);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn persist(&self, key: CacheKey, buffer: Bytes) {
        let cache = Arc::clone(&self.cache);
        self.writes.spawn(async move {
            match cache.put_disk(&key, &buffer).await {
                Ok(()) => debug!(%key, "stored PDF in disk cache"),
                Err(err) => warn!(%key, error = %err, "failed to store PDF in disk cache"),
            }
        });
    }

    pub fn health_status(&self) -> HealthStatus {
        HealthStatus {
            engine_connected: self.browser.is_connected(),
            memory_cache_size: self.cache.memory_len(),
        }
    }

    /// Launches the engine ahead of the first request. Failure is logged; the
    /// next render tries again. Returns whether an engine is running.
    pub async fn warm_up(&self) -> bool {
        match self.browser.acquire().await {
            Ok(handle) => {
                info!(generation = handle.generation(), "engine warmed up");
                true
            }
            Err(err) => {
                warn!(error = %err, "failed to pre-launch engine");
                false
            }
        }
    }

    /// Waits for background disk writes started so far.
    pub async fn flush(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
        self.writes.close();
        self.writes.wait().await;
        self.browser.shutdown().await;
        info!("render service stopped");
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn browser(&self) -> &BrowserManager {
        &self.browser
    }

    pub fn renderer(&self) -> &PdfRenderer {
        &self.renderer
    }
}

impl fmt::Debug for RenderService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderService")
            .field("cache", &self.cache)
            .field("browser", &self.browser)
            .field("retry", &self.retry)
            .field("pending_writes", &self.writes.len())
            .finish()
    }
}
