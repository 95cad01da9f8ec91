//! The headless engine as seen by the rest of the crate.
//!
//! An [`Engine`] launches [`EngineProcess`]es; a process opens [`Surface`]s
//! (pages). The production implementation drives Chromium through a
//! Playwright helper; tests and `PDFCACHE_MOCK_ENGINE` use the mock engine.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::page::{PdfOptions, Viewport};
use crate::Result;

/// Chromium flags for running without a sandbox inside containers.
pub const HARDENED_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-gpu",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-features=TranslateUI",
    "--disable-ipc-flooding-protection",
    "--no-first-run",
    "--no-zygote",
    "--single-process",
];

#[async_trait]
pub trait Engine: Send + Sync {
    /// Starts a new browser process.
    async fn launch(&self) -> Result<Arc<dyn EngineProcess>>;
}

#[async_trait]
pub trait EngineProcess: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn Surface>>;

    /// Cheap liveness check.
    fn is_connected(&self) -> bool;

    /// Flips to `true` once the process has disconnected, whether it crashed,
    /// exited, or was closed.
    fn disconnected(&self) -> watch::Receiver<bool>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Surface: Send {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<()>;

    /// Loads `html` and waits for network idle, failing with a timeout-class
    /// error after `timeout`.
    async fn set_content(&mut self, html: &str, timeout: Duration) -> Result<()>;

    /// Waits until the JavaScript `expression` is truthy in the page.
    async fn wait_for_condition(&mut self, expression: &str, timeout: Duration) -> Result<()>;

    async fn export_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>>;

    async fn close(self: Box<Self>) -> Result<()>;
}
