// SPDX-License-Identifier: MIT OR Apache-2.0
//! Rendered artifacts: the locked template sandbox and the document/PDF
//! boundary.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod doc;
mod template;
mod templates;

pub use doc::{DocError, Margins, MockPdfRenderer, PdfRenderer, normalize_margins, wrap_band_html};
pub use template::{
    ALLOWED_FILTERS, ALLOWED_TESTS, TemplateError, TemplateIssue, render_template,
    sanitize_context, validate_templates,
};
pub use templates::{DocTemplate, DocTemplateStore};
