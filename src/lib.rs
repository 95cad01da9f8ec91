//! pdfcache library
//!
//! Cached HTML-to-PDF rendering over a single, lazily launched and recycled
//! headless browser. Rendered documents are kept in a bounded in-memory tier
//! and an on-disk tier keyed by the document content and its footer brand.
//!
//! # Module Overview
//!
//! - [`cache`] - cache keys, memory and disk tiers, and the disk sweeper
//! - [`browser`] - engine traits, the Playwright and mock engines, and the engine lifecycle
//! - [`render`] - one render attempt on an engine handle
//! - [`service`] - the cache-fronted render operation with timeout retries
//! - [`page`] - viewport and PDF page layout
//! - [`config`] - TOML configuration
//! - [`output`] - JSON output schemas
//!
//! # Example
//!
//! ```no_run
//! use pdfcache_lib::{Config, MockEngine, RenderService};
//! use std::sync::Arc;
//!
//! # async fn example() -> pdfcache_lib::Result<()> {
//! let service = RenderService::new(&Config::default(), Arc::new(MockEngine::new()));
//! let first = service.render_and_cache("<h1>Hello</h1>", Some("Acme")).await?;
//! let again = service.render_and_cache("<h1>Hello</h1>", Some("Acme")).await?;
//! println!("{} then {}", first.tier, again.tier);
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod browser;
pub mod cache;
pub mod config;
pub mod error;
pub mod output;
pub mod page;
pub mod render;
pub mod service;

pub use browser::{
    engine_from_env, BrowserManager, BrowserOptions, Engine, EngineHandle, MockEngine,
    PlaywrightEngine, PlaywrightOptions,
};
pub use cache::{CacheKey, CacheManager, CacheOptions, SweepReport};
pub use config::Config;
pub use error::{ErrorCategory, ErrorPayload, PdfError, Result};
pub use output::{
    ErrorOutput, HealthOutput, PdfcacheOutput, RenderItem, RenderOutput, SweepOutput,
    PDFCACHE_OUTPUT_VERSION,
};
pub use page::{PageLayout, Viewport};
pub use render::{PdfRenderer, RenderOptions};
pub use service::{CacheTier, HealthStatus, RenderResult, RenderService, RetryPolicy};
