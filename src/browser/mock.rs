//! In-process engine that fakes Chromium for tests and offline runs.
//!
//! Selected by `PDFCACHE_MOCK_ENGINE=1`. Output is deterministic: the same
//! HTML, viewport and footer always produce the same bytes.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;

use super::engine::{Engine, EngineProcess, Surface};
use crate::page::{PdfOptions, Viewport};
use crate::{PdfError, Result};

/// HTML containing this attribute makes the page load crash.
pub const MOCK_FAULT_MARKER: &str = "data-mock-fault";

/// HTML containing this attribute never finishes loading.
pub const MOCK_TIMEOUT_MARKER: &str = "data-mock-timeout";

#[derive(Default)]
struct MockState {
    launches: AtomicUsize,
    closes: AtomicUsize,
    open_pages: AtomicUsize,
    peak_open_pages: AtomicUsize,
    pages_opened: AtomicUsize,
    renders: AtomicUsize,
    timeouts_remaining: AtomicUsize,
    fail_launch: AtomicBool,
    launch_delay: Mutex<Duration>,
    render_delay: Mutex<Duration>,
    processes: Mutex<Vec<Weak<MockProcess>>>,
}

impl MockState {
    fn delay(slot: &Mutex<Duration>) -> Duration {
        *slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_timeout(&self) -> bool {
        self.timeouts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Cheaply cloneable; clones share counters and knobs.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` page loads time out.
    pub fn with_timeouts(self, count: usize) -> Self {
        self.state.timeouts_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_launch_delay(self, delay: Duration) -> Self {
        *self.state.launch_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
        self
    }

    /// Each page load takes `delay`; loads slower than their timeout fail.
    pub fn with_render_delay(self, delay: Duration) -> Self {
        *self.state.render_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
        self
    }

    pub fn with_failing_launch(self) -> Self {
        self.set_failing_launch(true);
        self
    }

    pub fn set_failing_launch(&self, failing: bool) {
        self.state.fail_launch.store(failing, Ordering::SeqCst);
    }

    /// Simulates every live process crashing.
    pub fn disconnect_all(&self) {
        let processes: Vec<Arc<MockProcess>> = self
            .state
            .processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for process in processes {
            process.mark_disconnected();
        }
    }

    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Processes closed through [`EngineProcess::close`].
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn open_pages(&self) -> usize {
        self.state.open_pages.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open pages seen so far.
    pub fn peak_open_pages(&self) -> usize {
        self.state.peak_open_pages.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.state.pages_opened.load(Ordering::SeqCst)
    }

    /// Successful PDF exports.
    pub fn renders(&self) -> usize {
        self.state.renders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn launch(&self) -> Result<Arc<dyn EngineProcess>> {
        let delay = MockState::delay(&self.state.launch_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_launch.load(Ordering::SeqCst) {
            return Err(PdfError::launch("mock engine configured to fail"));
        }

        self.state.launches.fetch_add(1, Ordering::SeqCst);
        let (disconnected, _) = watch::channel(false);
        let process = Arc::new(MockProcess {
            state: Arc::clone(&self.state),
            connected: Arc::new(AtomicBool::new(true)),
            disconnected,
        });
        let mut processes = self
            .state
            .processes
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        processes.retain(|p| p.strong_count() > 0);
        processes.push(Arc::downgrade(&process));
        Ok(process)
    }
}

struct MockProcess {
    state: Arc<MockState>,
    connected: Arc<AtomicBool>,
    disconnected: watch::Sender<bool>,
}

impl MockProcess {
    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnected.send_replace(true);
    }
}

#[async_trait]
impl EngineProcess for MockProcess {
    async fn new_page(&self) -> Result<Box<dyn Surface>> {
        if !self.is_connected() {
            return Err(PdfError::Disconnected("mock engine is gone".to_string()));
        }
        let open = self.state.open_pages.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_open_pages.fetch_max(open, Ordering::SeqCst);
        self.state.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSurface {
            state: Arc::clone(&self.state),
            connected: Arc::clone(&self.connected),
            viewport: Viewport::default(),
            html: None,
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        self.disconnected.send_replace(true);
        Ok(())
    }
}

struct MockSurface {
    state: Arc<MockState>,
    connected: Arc<AtomicBool>,
    viewport: Viewport,
    html: Option<String>,
}

impl MockSurface {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PdfError::Disconnected(
                "Target page, context or browser has been closed".to_string(),
            ))
        }
    }
}

#[async_trait]
impl Surface for MockSurface {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.ensure_connected()?;
        self.viewport = viewport;
        Ok(())
    }

    async fn set_content(&mut self, html: &str, timeout: Duration) -> Result<()> {
        self.ensure_connected()?;
        let delay = MockState::delay(&self.state.render_delay);
        if html.contains(MOCK_TIMEOUT_MARKER) || self.state.take_timeout() || delay > timeout {
            tokio::time::sleep(timeout.min(delay)).await;
            return Err(PdfError::timeout(format!(
                "setContent: Timeout {}ms exceeded",
                timeout.as_millis()
            )));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.ensure_connected()?;
        if html.contains(MOCK_FAULT_MARKER) {
            return Err(PdfError::render("Page crashed while loading content"));
        }
        self.html = Some(html.to_string());
        Ok(())
    }

    async fn wait_for_condition(&mut self, _expression: &str, _timeout: Duration) -> Result<()> {
        self.ensure_connected()
    }

    async fn export_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        let html = self
            .html
            .as_deref()
            .ok_or_else(|| PdfError::render("no content loaded before export"))?;
        let content = hex::encode(Sha256::digest(html.as_bytes()));
        let footer = hex::encode(Sha256::digest(options.footer_template.as_bytes()));
        let body = format!(
            "%PDF-1.7\n% pdfcache mock engine\n1 0 obj\n<< /Viewport ({}) /Format ({}) /Content ({}) /Footer ({}) >>\nendobj\n%%EOF\n",
            self.viewport,
            options.format,
            content,
            footer
        );
        self.state.renders.fetch_add(1, Ordering::SeqCst);
        Ok(body.into_bytes())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.state.open_pages.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageLayout;

    #[tokio::test]
    async fn export_is_deterministic_per_content_and_footer() {
        let engine = MockEngine::new();
        let process = engine.launch().await.unwrap();
        let options = PageLayout::default().pdf_options("Acme");

        let render = |html: &'static str| {
            let process = Arc::clone(&process);
            let options = options.clone();
            async move {
                let mut page = process.new_page().await.unwrap();
                page.set_content(html, Duration::from_secs(1)).await.unwrap();
                let pdf = page.export_pdf(&options).await.unwrap();
                page.close().await.unwrap();
                pdf
            }
        };

        let a = render("<p>a</p>").await;
        let again = render("<p>a</p>").await;
        let b = render("<p>b</p>").await;

        assert!(a.starts_with(b"%PDF-"));
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(engine.open_pages(), 0);
        assert_eq!(engine.renders(), 3);
    }

    #[tokio::test]
    async fn scripted_timeouts_are_consumed_in_order() {
        let engine = MockEngine::new().with_timeouts(1);
        let process = engine.launch().await.unwrap();
        let mut page = process.new_page().await.unwrap();

        let first = page.set_content("<p>x</p>", Duration::from_millis(10)).await;
        assert!(first.expect_err("first load times out").is_timeout());
        page.set_content("<p>x</p>", Duration::from_millis(10))
            .await
            .expect("second load succeeds");
    }

    #[tokio::test]
    async fn fault_marker_is_a_render_error() {
        let engine = MockEngine::new();
        let process = engine.launch().await.unwrap();
        let mut page = process.new_page().await.unwrap();

        let err = page
            .set_content("<div data-mock-fault></div>", Duration::from_secs(1))
            .await
            .expect_err("fault");
        assert!(matches!(err, PdfError::Render(_)));
    }

    #[tokio::test]
    async fn disconnect_fails_pages_and_notifies_watchers() {
        let engine = MockEngine::new();
        let process = engine.launch().await.unwrap();
        let mut watcher = process.disconnected();
        let mut page = process.new_page().await.unwrap();

        engine.disconnect_all();

        assert!(!process.is_connected());
        assert!(*watcher.borrow_and_update());
        let err = page.set_viewport(Viewport::default()).await.expect_err("gone");
        assert!(matches!(err, PdfError::Disconnected(_)));
        assert_eq!(engine.closes(), 0, "crash is not a close");
    }
}
