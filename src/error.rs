use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Engine launch failed: {0}")]
    Launch(String),

    #[error("Render timed out: {0}")]
    Timeout(String),

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Engine disconnected: {0}")]
    Disconnected(String),

    #[error("Browser manager unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected error: {0}")]
    Unknown(String),
}

impl PdfError {
    pub fn launch(message: impl Into<String>) -> Self {
        PdfError::Launch(message.into())
    }

    pub fn render(message: impl Into<String>) -> Self {
        PdfError::Render(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        PdfError::Timeout(message.into())
    }

    /// Timeout-class failures are the only ones the render retry policy acts on.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PdfError::Timeout(_))
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            PdfError::Io(e) => ErrorPayload::new(
                ErrorCategory::Config,
                e.to_string(),
                "Check file paths/permissions for the input files and cache directory.",
            ),
            PdfError::Serialization(e) => ErrorPayload::new(
                ErrorCategory::Engine,
                e.to_string(),
                "The engine helper produced malformed output; rerun with -vv for details.",
            ),
            PdfError::Config(msg) => ErrorPayload::new(
                ErrorCategory::Config,
                msg.to_string(),
                "Check the config file (TOML) and flags such as --cache-dir/--timeout.",
            ),
            PdfError::InvalidInput(msg) => ErrorPayload::new(
                ErrorCategory::Input,
                msg.to_string(),
                "Provide a non-empty HTML document (file path or `-` for stdin).",
            ),
            PdfError::Launch(msg) => {
                let lower = msg.to_ascii_lowercase();
                if lower.contains("playwright npm package is missing") {
                    ErrorPayload::new(
                        ErrorCategory::Engine,
                        msg.to_string(),
                        "Install Playwright (e.g., `npm install playwright` and `npx playwright install chromium`).",
                    )
                } else if lower.contains("executable doesn't exist")
                    || lower.contains("chromium executable")
                {
                    ErrorPayload::new(
                        ErrorCategory::Engine,
                        msg.to_string(),
                        "Run `npx playwright install chromium` to download the browser.",
                    )
                } else if lower.contains("not found on path") || lower.contains("node command") {
                    ErrorPayload::new(
                        ErrorCategory::Engine,
                        msg.to_string(),
                        "Install Node.js and ensure the node binary is on PATH (or set engine.node_command).",
                    )
                } else {
                    ErrorPayload::new(
                        ErrorCategory::Engine,
                        msg.to_string(),
                        "Check that headless Chromium can start in this environment; rerun with -vv.",
                    )
                }
            }
            PdfError::Timeout(msg) => ErrorPayload::new(
                ErrorCategory::Timeout,
                msg.to_string(),
                "Ensure referenced assets load quickly or raise render.load_timeout (--timeout).",
            ),
            PdfError::Render(msg) => ErrorPayload::new(
                ErrorCategory::Render,
                msg.to_string(),
                "Inspect the HTML for scripts or markup that crash the page.",
            ),
            PdfError::Disconnected(msg) => ErrorPayload::new(
                ErrorCategory::Engine,
                msg.to_string(),
                "The browser exited mid-render; retry the request (a fresh engine is launched).",
            ),
            PdfError::Unavailable(msg) => ErrorPayload::new(
                ErrorCategory::Engine,
                msg.to_string(),
                "The service is shutting down; retry against a running instance.",
            ),
            PdfError::Unknown(msg) => ErrorPayload::new(
                ErrorCategory::Unknown,
                msg.to_string(),
                "Re-run with -vv; file an issue if persistent.",
            ),
        }
    }
}

pub type Result<T> = std::result::Result<T, PdfError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Input,
    Engine,
    Timeout,
    Render,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl ErrorPayload {
    pub fn new(category: ErrorCategory, message: String, remediation: impl Into<String>) -> Self {
        Self {
            category,
            message,
            remediation: Some(remediation.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        assert!(PdfError::timeout("setContent exceeded 20000ms").is_timeout());
        assert!(!PdfError::render("page crashed").is_timeout());
        assert!(!PdfError::launch("no chromium").is_timeout());
        assert!(!PdfError::Disconnected("eof".into()).is_timeout());
    }

    #[test]
    fn launch_payload_includes_playwright_remediation() {
        let err = PdfError::launch(
            "Playwright npm package is missing; install with `npm install playwright`.",
        );
        let payload = err.to_payload();
        assert_eq!(payload.category, ErrorCategory::Engine);
        let remediation = payload.remediation.unwrap_or_default();
        assert!(
            remediation.contains("npm install playwright"),
            "expected remediation to mention npm install playwright, got: {remediation}"
        );
    }

    #[test]
    fn launch_payload_includes_chromium_install_hint() {
        let err = PdfError::launch("browserType.launch: Executable doesn't exist at /ms-playwright");
        let remediation = err.to_payload().remediation.unwrap_or_default();
        assert!(
            remediation.contains("playwright install chromium"),
            "expected chromium install hint, got: {remediation}"
        );
    }

    #[test]
    fn launch_payload_includes_node_install_hint() {
        let err =
            PdfError::launch("Unable to spawn Playwright helper; 'node' was not found on PATH");
        let remediation = err.to_payload().remediation.unwrap_or_default();
        assert!(
            remediation.to_ascii_lowercase().contains("node"),
            "expected node install/path remediation, got: {remediation}"
        );
    }

    #[test]
    fn timeout_payload_uses_timeout_category() {
        let payload = PdfError::timeout("page load exceeded 20s").to_payload();
        assert_eq!(payload.category, ErrorCategory::Timeout);
        assert!(payload
            .remediation
            .unwrap_or_default()
            .contains("load_timeout"));
    }

    #[test]
    fn payload_serializes_category_lowercase() {
        let payload = PdfError::InvalidInput("No HTML provided".into()).to_payload();
        let json = serde_json::to_string(&payload).expect("serialize payload");
        assert!(json.contains("\"category\":\"input\""));
        assert!(json.contains("No HTML provided"));
    }
}
