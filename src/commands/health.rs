use std::path::PathBuf;
use std::process::ExitCode;

use pdfcache_lib::{
    engine_from_env, HealthOutput, PdfError, PdfcacheOutput, RenderService,
    PDFCACHE_OUTPUT_VERSION,
};

use crate::cli::OutputFormat;
use crate::formatting::{exit_code_for_health, render_error, write_output};
use crate::settings::{resolve_config, Overrides};

/// Run the health command.
pub async fn run_health(
    config_path: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    warm: bool,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> ExitCode {
    let overrides = Overrides {
        cache_dir,
        ..Overrides::default()
    };
    let config = match resolve_config(config_path.as_deref(), &overrides) {
        Ok(cfg) => cfg,
        Err(err) => return render_error(err, format, output),
    };

    let service = RenderService::new(&config, engine_from_env(&config.engine));
    if warm {
        service.warm_up().await;
    }
    let health = service.health_status();
    let launches = service.browser().launches();
    service.shutdown().await;

    let body = PdfcacheOutput::Health(HealthOutput {
        version: PDFCACHE_OUTPUT_VERSION.to_string(),
        health,
        launches,
    });
    if let Err(err) = write_output(&body, format, output.clone()) {
        return render_error(PdfError::Unknown(err.to_string()), format, output);
    }
    exit_code_for_health(warm, health.engine_connected)
}
