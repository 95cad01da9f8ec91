use std::path::PathBuf;
use std::process::ExitCode;

use pdfcache_lib::{CacheManager, PdfError, PdfcacheOutput, SweepOutput, PDFCACHE_OUTPUT_VERSION};

use crate::cli::OutputFormat;
use crate::formatting::{render_error, write_output};
use crate::settings::{resolve_config, Overrides};

/// Run the sweep command: one pass over the disk cache, no background tasks.
pub async fn run_sweep(
    config_path: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    retention: Option<u64>,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> ExitCode {
    let overrides = Overrides {
        cache_dir,
        retention_hours: retention,
        ..Overrides::default()
    };
    let config = match resolve_config(config_path.as_deref(), &overrides) {
        Ok(cfg) => cfg,
        Err(err) => return render_error(err, format, output),
    };

    let cache = CacheManager::new(&config.cache);
    let report = cache.sweep().await;

    let body = PdfcacheOutput::Sweep(SweepOutput {
        version: PDFCACHE_OUTPUT_VERSION.to_string(),
        dir: config.cache.dir.clone(),
        retention_secs: config.cache.disk_retention.as_secs(),
        report,
    });
    if let Err(err) = write_output(&body, format, output.clone()) {
        return render_error(PdfError::Unknown(err.to_string()), format, output);
    }
    ExitCode::SUCCESS
}
