//! Browser manager owning the single long-lived engine process.
//!
//! The engine moves through `Absent -> Launching -> Ready -> Absent`. It is
//! launched lazily by [`BrowserManager::acquire`] and reused while connected.
//! A disconnect observer, an idle reaper, forced replacement after a render
//! timeout, and shutdown all return it to `Absent`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{Engine, EngineProcess, Surface};
use crate::{PdfError, Result};

/// Default inactivity after which the engine is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default period of the idle reaper.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Default upper bound on waiting for outstanding leases before closing a retired engine.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle options for the managed engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserOptions {
    /// Close the engine after this long without an `acquire`.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How often the idle reaper checks.
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
    /// How long a replaced engine may keep serving handles still leased on it.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

struct HandleState {
    process: Arc<dyn EngineProcess>,
    generation: u64,
    last_used: Mutex<Instant>,
    /// Handles and pages currently holding this engine.
    leases: AtomicUsize,
    open_pages: AtomicUsize,
    released: Notify,
}

impl HandleState {
    fn new(process: Arc<dyn EngineProcess>, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            process,
            generation,
            last_used: Mutex::new(Instant::now()),
            leases: AtomicUsize::new(0),
            open_pages: AtomicUsize::new(0),
            released: Notify::new(),
        })
    }

    fn is_connected(&self) -> bool {
        self.process.is_connected()
    }

    fn leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    fn last_used_at(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Waits until every lease is released, up to `limit`. Returns whether it drained.
    async fn wait_released(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.leases() == 0 {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => return self.leases() == 0,
            }
        }
    }

    async fn close_quietly(&self) {
        if let Err(err) = self.process.close().await {
            warn!(
                generation = self.generation,
                error = %err,
                "failed to close engine; discarding handle"
            );
        }
    }
}

/// Keeps an engine out of idle reaping and delays closing a replaced one.
struct Lease(Arc<HandleState>);

impl Lease {
    fn new(state: Arc<HandleState>) -> Self {
        state.leases.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.0.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.released.notify_waiters();
        }
    }
}

/// Leased reference to an engine process.
///
/// The process stays open for as long as any handle (or a page opened through
/// one) is alive, even after the manager has replaced it; a replaced engine
/// is closed once the last lease is dropped, or when the drain timeout passes.
pub struct EngineHandle {
    lease: Lease,
}

impl EngineHandle {
    fn new(state: Arc<HandleState>) -> Self {
        Self {
            lease: Lease::new(state),
        }
    }

    fn state(&self) -> &Arc<HandleState> {
        &self.lease.0
    }

    /// Increases by one for every launch over the manager's lifetime.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn last_used_at(&self) -> Instant {
        self.state().last_used_at()
    }

    pub fn open_pages(&self) -> usize {
        self.state().open_pages.load(Ordering::SeqCst)
    }

    /// Handles and pages currently holding this engine, this one included.
    pub fn leases(&self) -> usize {
        self.state().leases()
    }

    /// Opens a new page; the page keeps its own lease until [`Page::close`].
    pub async fn open_page(&self) -> Result<Page> {
        let guard = PageGuard::new(Arc::clone(self.state()));
        let surface = self.state().process.new_page().await?;
        Ok(Page {
            surface,
            _guard: guard,
        })
    }
}

impl Clone for EngineHandle {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(self.state()))
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("generation", &self.generation())
            .field("connected", &self.is_connected())
            .field("leases", &self.leases())
            .field("open_pages", &self.open_pages())
            .finish()
    }
}

struct PageGuard {
    lease: Lease,
}

impl PageGuard {
    fn new(state: Arc<HandleState>) -> Self {
        state.open_pages.fetch_add(1, Ordering::SeqCst);
        Self {
            lease: Lease::new(state),
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.lease.0.open_pages.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A rendering surface opened through an [`EngineHandle`].
pub struct Page {
    surface: Box<dyn Surface>,
    _guard: PageGuard,
}

impl Page {
    pub fn surface(&mut self) -> &mut dyn Surface {
        self.surface.as_mut()
    }

    pub async fn close(self) -> Result<()> {
        let Page { surface, _guard } = self;
        surface.close().await
    }
}

struct ManagerState {
    engine: Arc<dyn Engine>,
    options: BrowserOptions,
    current: Mutex<Option<Arc<HandleState>>>,
    launch_lock: tokio::sync::Mutex<()>,
    generations: AtomicU64,
    replacements: AtomicU64,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the process-wide engine handle.
#[derive(Clone)]
pub struct BrowserManager {
    inner: Arc<ManagerState>,
}

impl BrowserManager {
    /// Creates the manager and starts its idle reaper. Must be called from
    /// within a Tokio runtime.
    pub fn new(engine: Arc<dyn Engine>, options: BrowserOptions) -> Self {
        let manager = Self {
            inner: Arc::new(ManagerState {
                engine,
                options,
                current: Mutex::new(None),
                launch_lock: tokio::sync::Mutex::new(()),
                generations: AtomicU64::new(0),
                replacements: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                reaper: Mutex::new(None),
            }),
        };
        manager.start_reaper();
        manager
    }

    pub fn options(&self) -> &BrowserOptions {
        &self.inner.options
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<HandleState>>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Leases the current engine if it is connected. The lease is taken under
    /// the slot lock, so `invalidate` and `reap_idle` always see it.
    fn live_handle(&self) -> Option<EngineHandle> {
        let current = self.current();
        let state = current.as_ref().filter(|state| state.is_connected())?;
        state.touch();
        Some(EngineHandle::new(Arc::clone(state)))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PdfError::Unavailable(
                "browser manager has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the live engine, launching one if there is none.
    ///
    /// Launches are serialized: callers arriving while a launch is in flight
    /// wait for it and share the result.
    pub async fn acquire(&self) -> Result<EngineHandle> {
        self.ensure_running()?;
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }

        let _launching = self.inner.launch_lock.lock().await;
        self.ensure_running()?;
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }

        let stale = self.current().take();
        if let Some(stale) = stale {
            debug!(generation = stale.generation, "discarding disconnected engine");
            tokio::spawn(async move { stale.close_quietly().await });
        }

        let started = Instant::now();
        let process = self.inner.engine.launch().await?;
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let state = HandleState::new(process, generation);
        let handle = EngineHandle::new(Arc::clone(&state));
        *self.current() = Some(state);
        self.watch_disconnect(&handle);
        info!(
            generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine launched"
        );
        Ok(handle)
    }

    /// Clears the slot as soon as the engine reports a disconnect, provided
    /// the slot still holds that engine.
    fn watch_disconnect(&self, handle: &EngineHandle) {
        let mut disconnected = handle.state().process.disconnected();
        let generation = handle.generation();
        let state = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = disconnected.wait_for(|gone| *gone) => {}
            }
            let Some(state) = state.upgrade() else {
                return;
            };
            let manager = BrowserManager { inner: state };
            let mut current = manager.current();
            if current.as_ref().is_some_and(|s| s.generation == generation) {
                *current = None;
                warn!(generation, "engine disconnected; next request will relaunch");
            }
        });
    }

    /// Forces the next [`acquire`](Self::acquire) to launch a fresh engine.
    ///
    /// Only acts if `handle` is still the current engine; the retired process
    /// is closed once every lease on it is released. Returns whether it was
    /// replaced.
    pub fn invalidate(&self, handle: &EngineHandle) -> bool {
        let retired = {
            let mut current = self.current();
            if current
                .as_ref()
                .is_some_and(|s| s.generation == handle.generation())
            {
                current.take()
            } else {
                None
            }
        };
        let Some(retired) = retired else {
            return false;
        };

        self.inner.replacements.fetch_add(1, Ordering::SeqCst);
        warn!(generation = retired.generation, "forcing engine replacement");
        let drain_timeout = self.inner.options.drain_timeout;
        tokio::spawn(async move {
            if !retired.wait_released(drain_timeout).await {
                warn!(
                    generation = retired.generation,
                    leases = retired.leases(),
                    "closing replaced engine while still leased"
                );
            }
            retired.close_quietly().await;
        });
        true
    }

    /// Closes the engine if it has been unused for longer than the idle
    /// timeout and nobody holds a handle to it. Returns whether it was closed.
    pub async fn reap_idle(&self) -> bool {
        let idle_timeout = self.inner.options.idle_timeout;
        let idle = {
            let mut current = self.current();
            let expired = current
                .as_ref()
                .is_some_and(|s| s.leases() == 0 && s.last_used_at().elapsed() > idle_timeout);
            if expired {
                current.take()
            } else {
                None
            }
        };
        match idle {
            Some(state) => {
                info!(generation = state.generation, "closing idle engine");
                state.close_quietly().await;
                true
            }
            None => false,
        }
    }

    fn start_reaper(&self) {
        let period = self.inner.options.reaper_interval.max(Duration::from_millis(1));
        let state: Weak<ManagerState> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(state) = state.upgrade() else {
                            break;
                        };
                        BrowserManager { inner: state }.reap_idle().await;
                    }
                }
            }
            debug!("idle reaper stopped");
        });
        *self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Stops background tasks and closes the engine unconditionally. Later
    /// calls to [`acquire`](Self::acquire) fail.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let reaper = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }

        // Let an in-flight launch land in the slot so it is closed too.
        let _launching = self.inner.launch_lock.lock().await;
        let current = self.current().take();
        if let Some(state) = current {
            info!(generation = state.generation, "closing engine for shutdown");
            state.close_quietly().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current().as_ref().is_some_and(|s| s.is_connected())
    }

    /// Generation of the engine currently held, connected or not.
    pub fn current_generation(&self) -> Option<u64> {
        self.current().as_ref().map(|s| s.generation)
    }

    /// Number of engines launched so far.
    pub fn launches(&self) -> u64 {
        self.inner.generations.load(Ordering::SeqCst)
    }

    /// Number of forced replacements via [`invalidate`](Self::invalidate).
    pub fn replacements(&self) -> u64 {
        self.inner.replacements.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for BrowserManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserManager")
            .field("options", &self.inner.options)
            .field("current_generation", &self.current_generation())
            .field("launches", &self.launches())
            .field("replacements", &self.replacements())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MockEngine;

    fn manager(engine: &MockEngine) -> BrowserManager {
        BrowserManager::new(Arc::new(engine.clone()), BrowserOptions::default())
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn browser_options_default_values() {
        let opts = BrowserOptions::default();
        assert_eq!(opts.idle_timeout, Duration::from_secs(300));
        assert_eq!(opts.reaper_interval, Duration::from_secs(60));
        assert_eq!(opts.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
    }

    #[tokio::test]
    async fn acquire_launches_lazily_and_reuses() {
        let engine = MockEngine::new();
        let manager = manager(&engine);
        assert!(!manager.is_connected());
        assert_eq!(engine.launches(), 0);

        let first = manager.acquire().await.expect("launch");
        let second = manager.acquire().await.expect("reuse");

        assert_eq!(first.generation(), second.generation());
        assert_eq!(engine.launches(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn concurrent_acquirers_share_one_launch() {
        let engine = MockEngine::new().with_launch_delay(Duration::from_millis(50));
        let manager = manager(&engine);

        let handles = futures::future::join_all((0..8).map(|_| manager.acquire())).await;

        assert_eq!(engine.launches(), 1);
        let generations: Vec<u64> = handles
            .into_iter()
            .map(|h| h.expect("acquire").generation())
            .collect();
        assert!(generations.iter().all(|g| *g == generations[0]));
    }

    #[tokio::test]
    async fn launch_failure_propagates() {
        let engine = MockEngine::new().with_failing_launch();
        let manager = manager(&engine);

        let err = manager.acquire().await.expect_err("launch should fail");
        assert!(matches!(err, PdfError::Launch(_)), "got {err:?}");
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn disconnect_clears_handle_and_next_acquire_relaunches() {
        let engine = MockEngine::new();
        let manager = manager(&engine);
        let first = manager.acquire().await.unwrap();

        engine.disconnect_all();
        settle().await;

        assert!(!manager.is_connected());
        assert_eq!(manager.current_generation(), None);
        let second = manager.acquire().await.unwrap();
        assert_ne!(first.generation(), second.generation());
        assert_eq!(engine.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_closes_idle_engine() {
        let engine = MockEngine::new();
        let manager = manager(&engine);
        manager.acquire().await.unwrap();

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(!manager.reap_idle().await, "not idle long enough");

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        settle().await;

        assert!(!manager.is_connected(), "background reaper should have closed it");
        assert_eq!(engine.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_spares_engine_with_open_pages() {
        let engine = MockEngine::new();
        let manager = manager(&engine);
        let handle = manager.acquire().await.unwrap();
        let page = handle.open_page().await.unwrap();

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        assert!(!manager.reap_idle().await);
        assert!(manager.is_connected());

        page.close().await.unwrap();
        assert!(!manager.reap_idle().await, "handle is still held");

        drop(handle);
        assert!(manager.reap_idle().await);
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_spares_engine_with_held_handle() {
        let engine = MockEngine::new();
        let manager = manager(&engine);
        let handle = manager.acquire().await.unwrap();

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        assert!(!manager.reap_idle().await);

        let page = handle.open_page().await.expect("handle still usable");
        page.close().await.unwrap();
        assert_eq!(engine.closes(), 0);
    }

    #[tokio::test]
    async fn invalidate_replaces_only_the_current_generation() {
        let engine = MockEngine::new();
        let manager = manager(&engine);
        let first = manager.acquire().await.unwrap();

        assert!(manager.invalidate(&first));
        assert!(!manager.invalidate(&first), "already replaced");
        assert_eq!(manager.replacements(), 1);

        let second = manager.acquire().await.unwrap();
        assert_ne!(first.generation(), second.generation());
        assert!(!manager.invalidate(&first));
        assert_eq!(manager.current_generation(), Some(second.generation()));
    }

    #[tokio::test]
    async fn replaced_engine_closes_after_its_pages() {
        let engine = MockEngine::new();
        let manager = manager(&engine);
        let handle = manager.acquire().await.unwrap();
        let mut page = handle.open_page().await.unwrap();

        manager.invalidate(&handle);
        settle().await;
        assert!(handle.is_connected(), "open page keeps the process alive");
        page.surface()
            .set_viewport(crate::page::Viewport::default())
            .await
            .expect("page still usable");

        page.close().await.unwrap();
        settle().await;
        assert_eq!(engine.closes(), 0, "handle still leases the engine");

        drop(handle);
        settle().await;
        assert_eq!(engine.closes(), 1);
    }

    #[tokio::test]
    async fn replaced_engine_serves_handles_acquired_before_replacement() {
        let engine = MockEngine::new();
        let manager = manager(&engine);
        let timed_out = manager.acquire().await.unwrap();
        let waiting = manager.acquire().await.unwrap();
        assert_eq!(waiting.leases(), 2);

        assert!(manager.invalidate(&timed_out));
        drop(timed_out);
        settle().await;

        let page = waiting.open_page().await.expect("engine not closed under a live lease");
        page.close().await.unwrap();
        assert_eq!(engine.closes(), 0);

        drop(waiting);
        settle().await;
        assert_eq!(engine.closes(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_engine_and_rejects_acquire() {
        let engine = MockEngine::new();
        let manager = manager(&engine);
        manager.acquire().await.unwrap();

        manager.shutdown().await;

        assert!(!manager.is_connected());
        assert_eq!(engine.closes(), 1);
        let err = manager.acquire().await.expect_err("shut down");
        assert!(matches!(err, PdfError::Unavailable(_)));
    }
}
