use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::browser::{BrowserOptions, PlaywrightOptions};
use crate::cache::CacheOptions;
use crate::render::RenderOptions;

/// Complete service configuration, one TOML table per component.
///
/// ```toml
/// [cache]
/// dir = "/var/cache/pdfcache"
/// memory_ttl = "10m"
///
/// [browser]
/// idle_timeout = "5m"
///
/// [render]
/// load_timeout = "20s"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheOptions,
    pub browser: BrowserOptions,
    pub engine: PlaywrightOptions,
    pub render: RenderOptions,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

impl Config {
    /// `<config_dir>/pdfcache/config.toml`, if the platform has a config dir.
    pub fn central_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pdfcache").join("config.toml"))
    }

    /// Loads `path` if given, else the central config if it exists, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::central_config_path().filter(|p| p.is_file()) {
                Some(central) => central,
                None => return Ok(Self::default()),
            },
        };
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("cache.memory_ttl", self.cache.memory_ttl),
            ("cache.disk_retention", self.cache.disk_retention),
            ("cache.sweep_interval", self.cache.sweep_interval),
            ("browser.idle_timeout", self.browser.idle_timeout),
            ("browser.reaper_interval", self.browser.reaper_interval),
            ("engine.launch_timeout", self.engine.launch_timeout),
            ("render.load_timeout", self.render.load_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| *d == Duration::ZERO) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.cache.dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache.dir must not be empty".to_string()));
        }
        if self.engine.node_command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "engine.node_command must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
