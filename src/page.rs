//! Page geometry and PDF export options.
//!
//! [`Viewport`] is the fixed rendering surface size; [`PageLayout`] describes
//! the paginated output and produces the [`PdfOptions`] handed to the engine,
//! including the branded footer.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Error)]
pub enum ViewportParseError {
    #[error("Invalid viewport format: expected WIDTHxHEIGHT (e.g., 1920x1080)")]
    InvalidFormat,
    #[error("Invalid width: {0}")]
    InvalidWidth(String),
    #[error("Invalid height: {0}")]
    InvalidHeight(String),
    #[error("Viewport dimensions must be positive")]
    Zero,
}

impl FromStr for Viewport {
    type Err = ViewportParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .split_once('x')
            .ok_or(ViewportParseError::InvalidFormat)?;

        let width: u32 = width
            .trim()
            .parse()
            .map_err(|_| ViewportParseError::InvalidWidth(width.to_string()))?;
        let height: u32 = height
            .trim()
            .parse()
            .map_err(|_| ViewportParseError::InvalidHeight(height.to_string()))?;

        if width == 0 || height == 0 {
            return Err(ViewportParseError::Zero);
        }

        Ok(Viewport { width, height })
    }
}

impl std::fmt::Display for Viewport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Paper sizes understood by the engine's PDF export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageFormat {
    #[default]
    A4,
    Letter,
    Legal,
}

impl PageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageFormat::A4 => "A4",
            PageFormat::Letter => "Letter",
            PageFormat::Legal => "Legal",
        }
    }
}

/// CSS lengths, as accepted by the engine (e.g. `40px`, `1cm`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Margins {
    pub top: String,
    pub bottom: String,
    pub left: String,
    pub right: String,
}

impl Default for Margins {
    fn default() -> Self {
        Self {
            top: "40px".to_string(),
            bottom: "40px".to_string(),
            left: "20px".to_string(),
            right: "20px".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageLayout {
    pub format: PageFormat,
    pub print_background: bool,
    pub margins: Margins,
    /// Draw a thin border around every page.
    pub page_border: bool,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self {
            format: PageFormat::A4,
            print_background: true,
            margins: Margins::default(),
            page_border: true,
        }
    }
}

const PAGE_BORDER_HEADER: &str = r#"<style>
  .page-border {
    position: absolute;
    top: 10px;
    left: 10px;
    right: 10px;
    bottom: 10px;
    border: 2px solid #000;
  }
</style>
<div class="page-border"></div>"#;

impl PageLayout {
    /// Export options for one document, with `brand` shown in the footer.
    pub fn pdf_options(&self, brand: &str) -> PdfOptions {
        PdfOptions {
            format: self.format.as_str().to_string(),
            print_background: self.print_background,
            margin: self.margins.clone(),
            prefer_css_page_size: false,
            display_header_footer: true,
            header_template: if self.page_border {
                PAGE_BORDER_HEADER.to_string()
            } else {
                "<span></span>".to_string()
            },
            footer_template: footer_template(brand),
        }
    }
}

/// Footer with the brand on the left and the page number on the right.
/// The brand is caller-supplied text and is escaped before interpolation.
pub fn footer_template(brand: &str) -> String {
    format!(
        r#"<div style="font-size: 10px; width: 100%; color: #666; padding-left: 40px; padding-right: 40px; display: flex; justify-content: space-between; align-items: center;">
  <span>{}</span>
  <div>Page <span class="pageNumber"></span></div>
</div>"#,
        ammonia::clean_text(brand)
    )
}

/// Wire form of the engine's `pdf()` options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfOptions {
    pub format: String,
    pub print_background: bool,
    pub margin: Margins,
    #[serde(rename = "preferCSSPageSize")]
    pub prefer_css_page_size: bool,
    pub display_header_footer: bool,
    pub header_template: String,
    pub footer_template: String,
}
