mod cli;
mod commands;
mod formatting;
mod settings;

use std::process::ExitCode;

use cli::Commands;
use commands::{run_health, run_render, run_sweep, RenderArgs};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    run().await
}

async fn run() -> ExitCode {
    let args = cli::parse();
    init_tracing(args.verbose);

    match args.command {
        Commands::Render {
            inputs,
            brand,
            out_dir,
            timeout,
            viewport,
            format,
            output,
        } => {
            run_render(RenderArgs {
                config_path: args.config,
                cache_dir: args.cache_dir,
                inputs,
                brand,
                out_dir,
                timeout,
                viewport,
                format,
                output,
            })
            .await
        }
        Commands::Sweep {
            retention,
            format,
            output,
        } => run_sweep(args.config, args.cache_dir, retention, format, output).await,
        Commands::Health {
            warm,
            format,
            output,
        } => run_health(args.config, args.cache_dir, warm, format, output).await,
    }
}

/// Logs go to stderr so stdout stays machine-readable. 0 = warn, 1 = info,
/// 2+ = debug, unless RUST_LOG is set.
fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("pdfcache=warn,pdfcache_lib=warn"),
        1 => EnvFilter::new("pdfcache=info,pdfcache_lib=info"),
        _ => EnvFilter::new("pdfcache=debug,pdfcache_lib=debug"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
