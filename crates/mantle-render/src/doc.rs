// SPDX-License-Identifier: MIT OR Apache-2.0
//! Document rendering: margin normalization and the PDF boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Normalized page margins, original units preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Margins {
    /// Top margin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<String>,
    /// Right margin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
    /// Bottom margin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom: Option<String>,
    /// Left margin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
}

/// Document rendering failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocError {
    /// A margin value failed to parse as `<number><mm|cm|in|px>`.
    #[error("[DOC_MARGIN_INVALID] invalid margin value: {value}")]
    InvalidMargin {
        /// The offending input.
        value: String,
    },
    /// A margin converts to more than 100 mm (or is negative).
    #[error("[DOC_MARGIN_OUT_OF_RANGE] margin out of range: {value}")]
    MarginOutOfRange {
        /// The offending input.
        value: String,
    },
}

/// Maximum margin in millimetres.
const MAX_MARGIN_MM: f64 = 100.0;

fn margin_to_mm(value: &str) -> Result<f64, DocError> {
    let unit_at = value
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| DocError::InvalidMargin {
            value: value.to_string(),
        })?;
    let (number, unit) = value.split_at(unit_at);
    let number: f64 = number.parse().map_err(|_| DocError::InvalidMargin {
        value: value.to_string(),
    })?;
    if number < 0.0 {
        return Err(DocError::MarginOutOfRange {
            value: value.to_string(),
        });
    }
    let mm = match unit {
        "mm" => number,
        "cm" => number * 10.0,
        "in" => number * 25.4,
        "px" => number * 0.264_583,
        _ => {
            return Err(DocError::InvalidMargin {
                value: value.to_string(),
            });
        }
    };
    Ok(mm)
}

/// Validate and normalize a margin map. Each present side must parse as
/// `<number><mm|cm|in|px>` and convert to at most 100 mm; the original
/// strings are kept.
///
/// # Errors
///
/// [`DocError::InvalidMargin`] or [`DocError::MarginOutOfRange`].
pub fn normalize_margins(raw: &BTreeMap<String, String>) -> Result<Margins, DocError> {
    let mut out = Margins::default();
    for side in ["top", "right", "bottom", "left"] {
        let Some(value) = raw.get(side).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
            continue;
        };
        let mm = margin_to_mm(value)?;
        if mm > MAX_MARGIN_MM {
            return Err(DocError::MarginOutOfRange {
                value: value.to_string(),
            });
        }
        let owned = Some(value.to_string());
        match side {
            "top" => out.top = owned,
            "right" => out.right = owned,
            "bottom" => out.bottom = owned,
            _ => out.left = owned,
        }
    }
    Ok(out)
}

/// Wrap header or footer HTML with horizontal padding matching the page
/// margins, so the band aligns with the body.
#[must_use]
pub fn wrap_band_html(html: &str, margins: &Margins) -> String {
    let left = margins.left.as_deref().unwrap_or("0");
    let right = margins.right.as_deref().unwrap_or("0");
    format!(
        "<div style=\"width:100%;box-sizing:border-box;padding-left:{left};padding-right:{right};\">{html}</div>"
    )
}

/// Headless HTML-to-PDF rendering boundary. The production implementation
/// drives an external browser process; tests use [`MockPdfRenderer`].
pub trait PdfRenderer: Send + Sync {
    /// Render HTML to PDF bytes.
    ///
    /// # Errors
    ///
    /// Implementation-defined rendering failures.
    fn render_pdf(
        &self,
        html: &str,
        paper_size: &str,
        margins: &Margins,
        header_html: Option<&str>,
        footer_html: Option<&str>,
    ) -> anyhow::Result<Vec<u8>>;
}

/// Deterministic stand-in renderer for tests: emits a tiny PDF-shaped
/// byte stream embedding the input lengths.
#[derive(Debug, Default)]
pub struct MockPdfRenderer;

impl PdfRenderer for MockPdfRenderer {
    fn render_pdf(
        &self,
        html: &str,
        paper_size: &str,
        _margins: &Margins,
        header_html: Option<&str>,
        footer_html: Option<&str>,
    ) -> anyhow::Result<Vec<u8>> {
        let mut out = format!(
            "%PDF-1.4\n% mock paper={paper_size} body={} header={} footer={}\n%%EOF\n",
            html.len(),
            header_html.map_or(0, str::len),
            footer_html.map_or(0, str::len),
        )
        .into_bytes();
        out.shrink_to_fit();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn margins(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn accepts_all_units() {
        let normalized =
            normalize_margins(&margins(&[("top", "12mm"), ("right", "1cm"), ("bottom", "0.5in"), ("left", "10px")]))
                .unwrap();
        assert_eq!(normalized.top.as_deref(), Some("12mm"));
        assert_eq!(normalized.left.as_deref(), Some("10px"));
    }

    #[test]
    fn rejects_garbage_and_oversize() {
        let err = normalize_margins(&margins(&[("top", "12pt")])).unwrap_err();
        assert!(matches!(err, DocError::InvalidMargin { .. }));

        let err = normalize_margins(&margins(&[("top", "12cm")])).unwrap_err();
        assert!(matches!(err, DocError::MarginOutOfRange { .. }));

        let err = normalize_margins(&margins(&[("top", "banana")])).unwrap_err();
        assert!(matches!(err, DocError::InvalidMargin { .. }));
    }

    #[test]
    fn empty_sides_are_skipped() {
        let normalized = normalize_margins(&margins(&[("top", ""), ("left", "5mm")])).unwrap();
        assert!(normalized.top.is_none());
        assert_eq!(normalized.left.as_deref(), Some("5mm"));
    }

    #[test]
    fn band_wrapping_uses_margins() {
        let m = normalize_margins(&margins(&[("left", "10mm"), ("right", "12mm")])).unwrap();
        let wrapped = wrap_band_html("<span>h</span>", &m);
        assert!(wrapped.contains("padding-left:10mm"));
        assert!(wrapped.contains("padding-right:12mm"));
    }

    #[test]
    fn mock_renderer_emits_pdf_bytes() {
        let bytes = MockPdfRenderer
            .render_pdf("<p>x</p>", "A4", &Margins::default(), None, None)
            .unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }
}
