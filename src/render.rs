//! Single-attempt HTML to PDF rendering on an engine handle.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

use crate::browser::{EngineHandle, Surface};
use crate::page::{PageLayout, Viewport};
use crate::{PdfError, Result};

pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_BRAND: &str = "ReadmeCodeGen";
pub const DEFAULT_MAX_CONCURRENT_PAGES: usize = 8;
pub const DEFAULT_MAX_RETRIES: usize = 1;

/// Waits for highlight.js, but only on documents that load it.
pub const DEFAULT_READY_CONDITION: &str = "!document.querySelector('script[src*=\"highlight\"]') || typeof window.hljs !== 'undefined'";

const FONTS_READY: &str = "document.fonts.status === 'loaded'";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub viewport: Viewport,
    /// Bounds the load phase and, separately, the export.
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,
    /// JavaScript expression that must be truthy before export.
    pub ready_condition: Option<String>,
    pub wait_for_fonts: bool,
    /// Footer text when the request carries no brand.
    pub default_brand: String,
    pub layout: PageLayout,
    pub max_concurrent_pages: usize,
    /// Extra attempts after a timeout, each on a freshly launched engine.
    pub max_retries: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            ready_condition: Some(DEFAULT_READY_CONDITION.to_string()),
            wait_for_fonts: true,
            default_brand: DEFAULT_BRAND.to_string(),
            layout: PageLayout::default(),
            max_concurrent_pages: DEFAULT_MAX_CONCURRENT_PAGES,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug)]
pub struct PdfRenderer {
    options: RenderOptions,
    permits: Arc<Semaphore>,
}

impl PdfRenderer {
    pub fn new(options: RenderOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent_pages.max(1)));
        Self { options, permits }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Renders `html` once. The page is closed whether or not the render
    /// succeeds; timeouts surface as [`PdfError::Timeout`].
    pub async fn render(
        &self,
        handle: &EngineHandle,
        html: &str,
        brand: Option<&str>,
    ) -> Result<Bytes> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PdfError::Unavailable("renderer is closed".to_string()))?;

        let started = Instant::now();
        let mut page = handle.open_page().await?;
        let result = self.drive(page.surface(), html, brand).await;
        if let Err(err) = page.close().await {
            debug!(generation = handle.generation(), error = %err, "failed to close rendering surface");
        }

        let buffer = result?;
        debug!(
            generation = handle.generation(),
            bytes = buffer.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rendered PDF"
        );
        Ok(buffer)
    }

    async fn drive(
        &self,
        surface: &mut dyn Surface,
        html: &str,
        brand: Option<&str>,
    ) -> Result<Bytes> {
        let budget = self.options.load_timeout;
        tokio::time::timeout(budget, self.load(&mut *surface, html))
            .await
            .map_err(|_| PdfError::timeout(format!("page load exceeded {budget:?}")))??;

        let brand = brand.unwrap_or(&self.options.default_brand);
        let options = self.options.layout.pdf_options(brand);
        let pdf = tokio::time::timeout(budget, surface.export_pdf(&options))
            .await
            .map_err(|_| PdfError::timeout(format!("PDF export exceeded {budget:?}")))??;
        if pdf.is_empty() {
            return Err(PdfError::render("engine produced an empty PDF"));
        }
        Ok(Bytes::from(pdf))
    }

    async fn load(&self, surface: &mut dyn Surface, html: &str) -> Result<()> {
        let deadline = Instant::now() + self.options.load_timeout;
        surface.set_viewport(self.options.viewport).await?;
        surface.set_content(html, remaining(deadline)).await?;
        if let Some(condition) = &self.options.ready_condition {
            surface
                .wait_for_condition(condition, remaining(deadline))
                .await?;
        }
        if self.options.wait_for_fonts {
            surface
                .wait_for_condition(FONTS_READY, remaining(deadline))
                .await?;
        }
        Ok(())
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserManager, BrowserOptions, MockEngine, MOCK_FAULT_MARKER};

    fn setup(engine: &MockEngine, options: RenderOptions) -> (BrowserManager, PdfRenderer) {
        let manager = BrowserManager::new(Arc::new(engine.clone()), BrowserOptions::default());
        (manager, PdfRenderer::new(options))
    }

    #[test]
    fn default_options_follow_document_conventions() {
        let opts = RenderOptions::default();
        assert_eq!(opts.viewport, Viewport::default());
        assert_eq!(opts.load_timeout, Duration::from_secs(20));
        assert_eq!(opts.default_brand, "ReadmeCodeGen");
        assert_eq!(opts.max_concurrent_pages, 8);
        assert_eq!(opts.max_retries, 1);
        assert!(opts
            .ready_condition
            .as_deref()
            .is_some_and(|c| c.contains("hljs")));
    }

    #[tokio::test]
    async fn render_produces_pdf_and_closes_page() {
        let engine = MockEngine::new();
        let (manager, renderer) = setup(&engine, RenderOptions::default());
        let handle = manager.acquire().await.unwrap();

        let pdf = renderer
            .render(&handle, "<h1>Hello</h1>", Some("Acme"))
            .await
            .expect("render");

        assert!(pdf.starts_with(b"%PDF-"));
        assert_eq!(engine.open_pages(), 0);
        assert_eq!(handle.open_pages(), 0);
    }

    #[tokio::test]
    async fn brand_changes_output_and_default_brand_is_used_when_absent() {
        let engine = MockEngine::new();
        let (manager, renderer) = setup(&engine, RenderOptions::default());
        let handle = manager.acquire().await.unwrap();

        let branded = renderer.render(&handle, "<p>x</p>", Some("Acme")).await.unwrap();
        let unbranded = renderer.render(&handle, "<p>x</p>", None).await.unwrap();
        let explicit_default = renderer
            .render(&handle, "<p>x</p>", Some(DEFAULT_BRAND))
            .await
            .unwrap();

        assert_ne!(branded, unbranded);
        assert_eq!(unbranded, explicit_default);
    }

    #[tokio::test]
    async fn engine_fault_is_render_error_and_page_is_closed() {
        let engine = MockEngine::new();
        let (manager, renderer) = setup(&engine, RenderOptions::default());
        let handle = manager.acquire().await.unwrap();

        let html = format!("<div {MOCK_FAULT_MARKER}></div>");
        let err = renderer.render(&handle, &html, None).await.expect_err("fault");

        assert!(matches!(err, PdfError::Render(_)), "got {err:?}");
        assert_eq!(engine.open_pages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_load_is_timeout_class() {
        let engine = MockEngine::new().with_render_delay(Duration::from_secs(30));
        let (manager, renderer) = setup(&engine, RenderOptions::default());
        let handle = manager.acquire().await.unwrap();

        let err = renderer
            .render(&handle, "<p>slow</p>", None)
            .await
            .expect_err("timeout");

        assert!(err.is_timeout(), "got {err:?}");
        assert_eq!(engine.open_pages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn admission_limit_bounds_open_pages() {
        let engine = MockEngine::new().with_render_delay(Duration::from_millis(100));
        let options = RenderOptions {
            max_concurrent_pages: 2,
            ..RenderOptions::default()
        };
        let (manager, renderer) = setup(&engine, options);
        let handle = manager.acquire().await.unwrap();

        let renders = (0..6).map(|i| {
            let html = format!("<p>{i}</p>");
            let renderer = &renderer;
            let handle = &handle;
            async move { renderer.render(handle, &html, None).await }
        });
        let results = futures::future::join_all(renders).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(engine.pages_opened(), 6);
        assert_eq!(engine.peak_open_pages(), 2);
    }
}
