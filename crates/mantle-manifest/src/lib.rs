// SPDX-License-Identifier: MIT OR Apache-2.0
//! Manifest model, normalization, and the validation pipeline.
//!
//! A manifest flows through this crate in one direction:
//!
//! 1. [`normalize_manifest`] fills defaults (scaffolded views and pages,
//!    enum options, workflow status actions, nav wiring) and is idempotent —
//!    a second application is a byte-level fixed point;
//! 2. [`validate_manifest_raw`] reports hard `MANIFEST_*` shape errors;
//! 3. [`strict_validate`] enforces namespacing and reference discipline;
//! 4. [`completeness_check`] verifies every entity has working pages
//!    (only when no errors were found so far);
//! 5. [`design_lint`] adds advisory warnings.
//!
//! [`validate_full`] runs the whole pipeline and returns a
//! [`ValidationReport`] suitable for the draft-validation surface.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod completeness;
mod compile;
mod issue;
mod lint;
mod normalize;
mod patch;
mod raw;
mod strict;
mod util;

pub use compile::{
    ActionDef, ActionKind, CompiledManifest, EntityDef, EnumOption, FieldDef, FieldType,
    TriggerDef, ViewDef, WorkflowDef, WorkflowState, compile_manifest,
};
pub use completeness::completeness_check;
pub use issue::Issue;
pub use lint::design_lint;
pub use normalize::normalize_manifest;
pub use patch::{
    AppliedOp, PatchError, PatchOp, PatchOutcome, apply_patchset, validate_patchset,
};
pub use raw::{ACTION_KINDS, FIELD_TYPES, TRIGGER_EVENTS, validate_manifest_raw};
pub use strict::strict_validate;
pub use util::{canonical_entity_id, entity_slug, title_case};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of the full validation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// The normalized manifest.
    pub normalized: Value,
    /// Hard `MANIFEST_*` errors.
    pub errors: Vec<Issue>,
    /// Normalization warnings.
    pub warnings: Vec<Issue>,
    /// Strict structural errors.
    pub strict: Vec<Issue>,
    /// Completeness errors and warnings.
    pub completeness: Vec<Issue>,
    /// Advisory design warnings.
    pub design_warnings: Vec<Issue>,
}

impl ValidationReport {
    /// Whether the manifest may be installed.
    #[must_use]
    pub fn installable(&self) -> bool {
        self.errors.is_empty()
            && self.strict.is_empty()
            && !self
                .completeness
                .iter()
                .any(|issue| issue.code.starts_with("INCOMPLETE_") && !issue.code.contains("ORPHAN"))
    }
}

/// Run normalization and every validator in order.
///
/// The completeness check only runs when the raw and strict validators
/// found nothing; its orphan findings are warnings, everything else it
/// reports is a gating error.
#[must_use]
pub fn validate_full(manifest: &Value, module_id: &str) -> ValidationReport {
    let (normalized, errors, warnings) = validate_manifest_raw(manifest, module_id);
    let strict = if errors.is_empty() {
        strict_validate(&normalized)
    } else {
        Vec::new()
    };
    let completeness = if errors.is_empty() && strict.is_empty() {
        completeness_check(&normalized)
    } else {
        Vec::new()
    };
    let design_warnings = if errors.is_empty() {
        design_lint(&normalized)
    } else {
        Vec::new()
    };

    ValidationReport {
        normalized,
        errors,
        warnings,
        strict,
        completeness,
        design_warnings,
    }
}
