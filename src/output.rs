use crate::cache::SweepReport;
use crate::error::ErrorPayload;
use crate::service::{CacheTier, HealthStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Schema version for output payloads.
pub const PDFCACHE_OUTPUT_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum PdfcacheOutput {
    Render(RenderOutput),
    Sweep(SweepOutput),
    Health(HealthOutput),
    Error(ErrorOutput),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderOutput {
    pub version: String,
    pub items: Vec<RenderItem>,
    pub health: HealthStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderItem {
    /// Input path, or `-` for stdin.
    pub input: String,
    pub output_path: PathBuf,
    pub tier: CacheTier,
    pub bytes: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOutput {
    pub version: String,
    pub dir: PathBuf,
    pub retention_secs: u64,
    #[serde(flatten)]
    pub report: SweepReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthOutput {
    pub version: String,
    #[serde(flatten)]
    pub health: HealthStatus,
    pub launches: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOutput {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub error: ErrorPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_output_serializes() {
        let output = PdfcacheOutput::Render(RenderOutput {
            version: PDFCACHE_OUTPUT_VERSION.to_string(),
            items: vec![RenderItem {
                input: "readme.html".to_string(),
                output_path: PathBuf::from("out/readme.pdf"),
                tier: CacheTier::Miss,
                bytes: 2048,
                elapsed_ms: 812,
            }],
            health: HealthStatus {
                engine_connected: true,
                memory_cache_size: 1,
            },
        });

        let json = serde_json::to_string(&output).expect("serialize render output");
        assert!(json.contains("\"mode\":\"render\""));
        assert!(json.contains("\"tier\":\"miss\""));
        assert!(json.contains("\"outputPath\":\"out/readme.pdf\""));
        assert!(json.contains("\"memoryCacheSize\":1"));
    }

    #[test]
    fn sweep_output_flattens_report() {
        let output = PdfcacheOutput::Sweep(SweepOutput {
            version: PDFCACHE_OUTPUT_VERSION.to_string(),
            dir: PathBuf::from("pdf_cache"),
            retention_secs: 86_400,
            report: SweepReport {
                scanned: 4,
                removed: 3,
                failed: 0,
            },
        });

        let value = serde_json::to_value(&output).expect("serialize sweep output");
        assert_eq!(value["mode"], "sweep");
        assert_eq!(value["removed"], 3);
        assert_eq!(value["retentionSecs"], 86_400);
    }

    #[test]
    fn health_output_round_trips() {
        let json = r#"{"mode":"health","version":"0.1.0","engineConnected":false,"memoryCacheSize":0,"launches":0}"#;
        let parsed: PdfcacheOutput = serde_json::from_str(json).expect("parse health output");
        match parsed {
            PdfcacheOutput::Health(out) => {
                assert!(!out.health.engine_connected);
                assert_eq!(out.launches, 0);
            }
            other => panic!("expected health output, got {other:?}"),
        }
    }
}
