use std::path::{Path, PathBuf};
use std::time::Duration;

use pdfcache_lib::{Config, PdfError, Viewport};
use tracing::info;

/// CLI flags that override config values when present.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub cache_dir: Option<PathBuf>,
    pub load_timeout_secs: Option<u64>,
    pub retention_hours: Option<u64>,
    pub viewport: Option<Viewport>,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.cache_dir {
            config.cache.dir = dir.clone();
        }
        if let Some(secs) = self.load_timeout_secs {
            config.render.load_timeout = Duration::from_secs(secs);
        }
        if let Some(hours) = self.retention_hours {
            config.cache.disk_retention = Duration::from_secs(hours * 60 * 60);
        }
        if let Some(viewport) = self.viewport {
            config.render.viewport = viewport;
        }
    }
}

/// Load config from a TOML file, central config, or return defaults.
/// Priority: explicit path > <config_dir>/pdfcache/config.toml > defaults
pub fn load_config(path: Option<&Path>) -> Result<Config, PdfError> {
    Config::load(path).map_err(|e| {
        let loc = path
            .map(|p| p.display().to_string())
            .or_else(|| Config::central_config_path().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "defaults".to_string());
        PdfError::Config(format!("Failed to read config {}: {}", loc, e))
    })
}

/// Loads the config, applies CLI overrides, then validates the result.
pub fn resolve_config(path: Option<&Path>, overrides: &Overrides) -> Result<Config, PdfError> {
    let mut cfg = load_config(path)?;
    overrides.apply(&mut cfg);
    cfg.validate().map_err(|e| {
        let prefix = path
            .map(|p| format!("Invalid config ({}): {}", p.display(), e))
            .unwrap_or_else(|| format!("Invalid config: {}", e));
        PdfError::Config(prefix)
    })?;
    log_effective_config(path, &cfg);
    Ok(cfg)
}

fn log_effective_config(config_path: Option<&Path>, config: &Config) {
    info!("{}", format_effective_config(config, config_path));
}

/// Format effective config as a single-line string.
pub fn format_effective_config(config: &Config, config_source: Option<&Path>) -> String {
    let source = config_source
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    format!(
        "Effective config [{source}]: cache dir={}, memory={} entries/{}s ttl, disk retention={}s, idle timeout={}s, load timeout={}s, viewport={}, max pages={}, retries={}",
        config.cache.dir.display(),
        config.cache.memory_capacity,
        config.cache.memory_ttl.as_secs(),
        config.cache.disk_retention.as_secs(),
        config.browser.idle_timeout.as_secs(),
        config.render.load_timeout.as_secs(),
        config.render.viewport,
        config.render.max_concurrent_pages,
        config.render.max_retries,
    )
}
