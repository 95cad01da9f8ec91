//! Headless engine lifecycle.
//!
//! # Module Structure
//!
//! - [`engine`] - the traits every engine implements, plus the hardened launch flags
//! - [`manager`] - single shared engine with lazy launch, idle reaping and replacement
//! - [`playwright`] - Chromium through a long-lived Node/Playwright helper
//! - [`mock`] - deterministic in-process engine
//!
//! # Example
//!
//! ```no_run
//! use pdfcache_lib::browser::{BrowserManager, BrowserOptions, PlaywrightEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> pdfcache_lib::Result<()> {
//! let manager = BrowserManager::new(Arc::new(PlaywrightEngine::default()), BrowserOptions::default());
//! let handle = manager.acquire().await?;
//! let page = handle.open_page().await?;
//! page.close().await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod engine;
mod manager;
mod mock;
mod playwright;

use std::sync::Arc;
use tracing::info;

pub use engine::{Engine, EngineProcess, Surface, HARDENED_ARGS};
pub use manager::{
    BrowserManager, BrowserOptions, EngineHandle, Page, DEFAULT_DRAIN_TIMEOUT,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_REAPER_INTERVAL,
};
pub use mock::{MockEngine, MOCK_FAULT_MARKER, MOCK_TIMEOUT_MARKER};
pub use playwright::{PlaywrightEngine, PlaywrightOptions, DEFAULT_LAUNCH_TIMEOUT};

/// Environment variable that swaps Chromium for [`MockEngine`].
pub const MOCK_ENGINE_ENV: &str = "PDFCACHE_MOCK_ENGINE";

/// Checks if the mock engine is requested via the environment.
pub fn is_mock_engine_enabled() -> bool {
    std::env::var(MOCK_ENGINE_ENV)
        .map(|value| {
            let value = value.trim();
            !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        })
        .unwrap_or(false)
}

/// The engine the CLI should use: the mock when requested, Playwright otherwise.
pub fn engine_from_env(options: &PlaywrightOptions) -> Arc<dyn Engine> {
    if is_mock_engine_enabled() {
        info!("{MOCK_ENGINE_ENV} set; using the mock engine");
        Arc::new(MockEngine::new())
    } else {
        Arc::new(PlaywrightEngine::new(options.clone()))
    }
}
