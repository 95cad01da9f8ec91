use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use pdfcache_lib::Viewport;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pdfcache")]
#[command(
    version,
    about = "Cached HTML-to-PDF rendering over a recycled headless browser",
    long_about = "pdfcache\n\nCommands:\n- render: convert HTML documents to PDF, serving repeats from the memory/disk cache.\n- sweep: delete disk cache files older than the retention period.\n- health: report engine connectivity and memory cache size.\n\nSet PDFCACHE_MOCK_ENGINE=1 to render with the built-in mock engine instead of Chromium."
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short,
        long,
        global = true,
        action = ArgAction::Count,
        help = "Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence"
    )]
    pub verbose: u8,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Optional config file (TOML) with [cache], [browser], [engine] and [render] tables; CLI flags override config"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "PDFCACHE_CACHE_DIR",
        help = "Disk cache directory (overrides cache.dir)"
    )]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render HTML documents to PDF through the cache
    Render {
        #[arg(
            required = true,
            value_name = "INPUT",
            help = "HTML files to render; use - to read one document from stdin"
        )]
        inputs: Vec<String>,

        #[arg(long, help = "Footer brand text (defaults to render.default_brand)")]
        brand: Option<String>,

        #[arg(
            long,
            value_name = "DIR",
            default_value = ".",
            help = "Directory for <stem>.pdf files; created if missing"
        )]
        out_dir: PathBuf,

        #[arg(long, value_name = "SECS", help = "Page load timeout in seconds")]
        timeout: Option<u64>,

        #[arg(long, help = "Viewport dimensions (WIDTHxHEIGHT)")]
        viewport: Option<Viewport>,

        #[arg(long, value_enum, default_value = "json", help = "Output format")]
        format: OutputFormat,

        #[arg(long, short, help = "Report file path (stdout if omitted)")]
        output: Option<PathBuf>,
    },
    /// Delete disk cache files older than the retention period
    Sweep {
        #[arg(
            long,
            value_name = "HOURS",
            help = "Retention in hours (overrides cache.disk_retention)"
        )]
        retention: Option<u64>,

        #[arg(long, value_enum, default_value = "json", help = "Output format")]
        format: OutputFormat,

        #[arg(long, short, help = "Report file path (stdout if omitted)")]
        output: Option<PathBuf>,
    },
    /// Report engine connectivity and memory cache size
    Health {
        #[arg(long, help = "Launch the engine first and fail if it does not come up")]
        warm: bool,

        #[arg(long, value_enum, default_value = "json", help = "Output format")]
        format: OutputFormat,

        #[arg(long, short, help = "Report file path (stdout if omitted)")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Json,
    Pretty,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_command_parses_inputs_and_overrides() {
        let cli = Cli::parse_from([
            "pdfcache",
            "-vv",
            "--cache-dir",
            "/tmp/pdfs",
            "render",
            "a.html",
            "b.html",
            "--brand",
            "Acme",
            "--out-dir",
            "out",
            "--timeout",
            "5",
            "--viewport",
            "1280x720",
            "--format",
            "pretty",
        ]);

        assert_eq!(cli.verbose, 2);
        assert_eq!(
            cli.cache_dir.as_deref(),
            Some(std::path::Path::new("/tmp/pdfs"))
        );
        match cli.command {
            Commands::Render {
                inputs,
                brand,
                out_dir,
                timeout,
                viewport,
                format,
                output,
            } => {
                assert_eq!(inputs, vec!["a.html".to_string(), "b.html".to_string()]);
                assert_eq!(brand.as_deref(), Some("Acme"));
                assert_eq!(out_dir, PathBuf::from("out"));
                assert_eq!(timeout, Some(5));
                assert_eq!(viewport.map(|v| v.width), Some(1280));
                assert!(matches!(format, OutputFormat::Pretty));
                assert!(output.is_none());
            }
            _ => panic!("expected render command"),
        }
    }

    #[test]
    fn render_requires_an_input() {
        assert!(Cli::try_parse_from(["pdfcache", "render"]).is_err());
    }

    #[test]
    fn health_command_defaults() {
        let cli = Cli::parse_from(["pdfcache", "health"]);
        assert_eq!(cli.verbose, 0);
        match cli.command {
            Commands::Health { warm, format, .. } => {
                assert!(!warm);
                assert!(matches!(format, OutputFormat::Json));
            }
            _ => panic!("expected health command"),
        }
    }

    #[test]
    fn sweep_accepts_retention_hours() {
        let cli = Cli::parse_from(["pdfcache", "sweep", "--retention", "48"]);
        match cli.command {
            Commands::Sweep { retention, .. } => assert_eq!(retention, Some(48)),
            _ => panic!("expected sweep command"),
        }
    }
}
