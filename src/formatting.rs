use std::fmt::Write as FmtWrite;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use pdfcache_lib::{ErrorOutput, PdfError, PdfcacheOutput, PDFCACHE_OUTPUT_VERSION};

use crate::cli::OutputFormat;

/// Write output in the requested format.
pub fn write_output(
    body: &PdfcacheOutput,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => write_json_output(body, output.as_deref())?,
        OutputFormat::Pretty => write_pretty_output(body, output.as_deref())?,
    };
    Ok(())
}

/// Render an error and return the appropriate exit code.
pub fn render_error(err: PdfError, format: OutputFormat, output: Option<PathBuf>) -> ExitCode {
    let error_payload = err.to_payload();
    let payload = PdfcacheOutput::Error(ErrorOutput {
        version: PDFCACHE_OUTPUT_VERSION.to_string(),
        message: Some(err.to_string()),
        error: error_payload,
    });

    match format {
        OutputFormat::Json => {
            let content =
                serde_json::to_string(&payload).unwrap_or_else(|_| "{\"mode\":\"error\"}".into());
            if let Some(path) = output {
                if let Err(write_err) = std::fs::write(&path, &content) {
                    eprintln!("Failed to write error output: {}", write_err);
                    println!("{content}");
                }
            } else {
                println!("{content}");
            }
        }
        OutputFormat::Pretty => {
            if let Err(write_err) = write_pretty_output(&payload, output.as_deref()) {
                eprintln!("Failed to write error output: {}", write_err);
            }
        }
    };

    // Exit code 2 is fatal; 1 is an unhealthy health check.
    ExitCode::from(2)
}

/// Write JSON output to file or stdout.
fn write_json_output(
    body: &PdfcacheOutput,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let content = serde_json::to_string(body)?;
    if let Some(path) = output {
        std::fs::write(path, content)?;
    } else {
        println!("{content}");
    }
    Ok(())
}

/// Write pretty output to file or stdout.
fn write_pretty_output(body: &PdfcacheOutput, output: Option<&Path>) -> io::Result<()> {
    let use_human = output.is_none() && std::io::stdout().is_terminal();

    if use_human {
        let content = format_pretty(body, true);
        println!("{content}");
        return Ok(());
    }

    // Non-tty or file output: keep JSON shape for pipelines/files.
    let content =
        serde_json::to_string_pretty(body).unwrap_or_else(|_| "{\"mode\":\"error\"}".to_string());
    if let Some(path) = output {
        std::fs::write(path, &content)?;
    } else {
        println!("{content}");
    }
    Ok(())
}

/// Format output for human consumption in a terminal.
pub fn format_pretty(body: &PdfcacheOutput, colorize: bool) -> String {
    let mut buf = String::new();
    match body {
        PdfcacheOutput::Render(out) => {
            let header = color("[RENDER]", "36", colorize);
            writeln!(buf, "{} {} document(s)", header, out.items.len()).ok();
            for item in &out.items {
                let tier = color(item.tier.as_str(), tier_color_code(item.tier.as_str()), colorize);
                writeln!(
                    buf,
                    "- {:6} {} -> {} ({} bytes, {} ms)",
                    tier,
                    item.input,
                    item.output_path.display(),
                    item.bytes,
                    item.elapsed_ms
                )
                .ok();
            }
            writeln!(
                buf,
                "Engine connected: {}, memory cache entries: {}",
                out.health.engine_connected, out.health.memory_cache_size
            )
            .ok();
        }
        PdfcacheOutput::Sweep(out) => {
            let header = color("[SWEEP]", "36", colorize);
            writeln!(buf, "{} {}", header, out.dir.display()).ok();
            writeln!(
                buf,
                "Scanned {}, removed {}, failed {} (retention {}h)",
                out.report.scanned,
                out.report.removed,
                out.report.failed,
                out.retention_secs / 3600
            )
            .ok();
        }
        PdfcacheOutput::Health(out) => {
            let (status, code) = if out.health.engine_connected {
                ("UP", "32")
            } else {
                ("IDLE", "33")
            };
            writeln!(buf, "{} Engine", color(status, code, colorize)).ok();
            writeln!(buf, "Memory cache entries: {}", out.health.memory_cache_size).ok();
            writeln!(buf, "Launches: {}", out.launches).ok();
        }
        PdfcacheOutput::Error(out) => {
            let header = color("[ERROR]", "31", colorize);
            let message = out
                .message
                .as_deref()
                .unwrap_or(out.error.message.as_str());
            writeln!(buf, "{} {}", header, message).ok();
            if let Some(remediation) = &out.error.remediation {
                writeln!(buf, "Hint: {}", remediation).ok();
            }
        }
    }
    buf
}

/// Apply ANSI color codes when enabled.
fn color(text: &str, code: &str, colorize: bool) -> String {
    if colorize {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    } else {
        text.to_string()
    }
}

fn tier_color_code(tier: &str) -> &'static str {
    match tier {
        "memory" => "32",
        "disk" => "36",
        _ => "33",
    }
}

/// Determine exit code for the health command.
pub fn exit_code_for_health(warm: bool, connected: bool) -> ExitCode {
    if warm && !connected {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdfcache_lib::{
        CacheTier, HealthOutput, HealthStatus, RenderItem, RenderOutput, SweepOutput, SweepReport,
    };

    #[test]
    fn exit_code_for_health_fails_only_failed_warmups() {
        assert_eq!(exit_code_for_health(false, false), ExitCode::SUCCESS);
        assert_eq!(exit_code_for_health(true, true), ExitCode::SUCCESS);
        assert_eq!(exit_code_for_health(true, false), ExitCode::from(1));
    }

    #[test]
    fn render_error_always_returns_fatal_exit_code() {
        let code = render_error(
            PdfError::InvalidInput("empty document".to_string()),
            OutputFormat::Json,
            None,
        );
        assert_eq!(code, ExitCode::from(2));
    }

    #[test]
    fn format_pretty_lists_render_items_with_tiers() {
        let output = PdfcacheOutput::Render(RenderOutput {
            version: PDFCACHE_OUTPUT_VERSION.to_string(),
            items: vec![
                RenderItem {
                    input: "a.html".to_string(),
                    output_path: PathBuf::from("out/a.pdf"),
                    tier: CacheTier::Miss,
                    bytes: 1200,
                    elapsed_ms: 640,
                },
                RenderItem {
                    input: "b.html".to_string(),
                    output_path: PathBuf::from("out/b.pdf"),
                    tier: CacheTier::Disk,
                    bytes: 900,
                    elapsed_ms: 3,
                },
            ],
            health: HealthStatus {
                engine_connected: true,
                memory_cache_size: 2,
            },
        });

        let pretty = format_pretty(&output, false);
        assert!(pretty.contains("[RENDER] 2 document(s)"));
        assert!(pretty.contains("miss   a.html -> out/a.pdf (1200 bytes, 640 ms)"));
        assert!(pretty.contains("disk   b.html"));
        assert!(pretty.contains("memory cache entries: 2"));
    }

    #[test]
    fn format_pretty_summarizes_sweep_and_health() {
        let sweep = PdfcacheOutput::Sweep(SweepOutput {
            version: PDFCACHE_OUTPUT_VERSION.to_string(),
            dir: PathBuf::from("pdf_cache"),
            retention_secs: 86_400,
            report: SweepReport {
                scanned: 5,
                removed: 2,
                failed: 1,
            },
        });
        let pretty = format_pretty(&sweep, false);
        assert!(pretty.contains("Scanned 5, removed 2, failed 1 (retention 24h)"));

        let health = PdfcacheOutput::Health(HealthOutput {
            version: PDFCACHE_OUTPUT_VERSION.to_string(),
            health: HealthStatus {
                engine_connected: false,
                memory_cache_size: 0,
            },
            launches: 0,
        });
        assert!(format_pretty(&health, false).starts_with("IDLE Engine"));
    }

    #[test]
    fn format_pretty_shows_error_with_remediation() {
        let err = PdfError::timeout("page load exceeded 20s");
        let output = PdfcacheOutput::Error(ErrorOutput {
            version: PDFCACHE_OUTPUT_VERSION.to_string(),
            message: Some(err.to_string()),
            error: err.to_payload(),
        });

        let pretty = format_pretty(&output, false);
        assert!(pretty.contains("[ERROR] Render timed out: page load exceeded 20s"));
        assert!(pretty.contains("Hint: Ensure referenced assets load quickly"));
    }
}
