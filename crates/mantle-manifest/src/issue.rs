// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured validation issues.
//!
//! Every error and warning produced by the manifest pipeline carries a
//! stable code, a human message, the dot/bracket path, and the equivalent
//! RFC 6901 pointer. The path→pointer conversion is deterministic so the
//! two forms always agree.

use mantle_canonical::dot_path_to_pointer;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single validation error or warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Issue {
    /// Stable machine-readable code (e.g. `MANIFEST_ENTITY_INVALID`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Dot/bracket path of the offending node, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// RFC 6901 pointer equivalent of `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_pointer: Option<String>,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl Issue {
    /// Build an issue at `path`, deriving the JSON pointer form.
    #[must_use]
    pub fn at(code: impl Into<String>, message: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let json_pointer = Some(dot_path_to_pointer(&path));
        Self {
            code: code.into(),
            message: message.into(),
            path: Some(path),
            json_pointer,
            detail: None,
        }
    }

    /// Build an issue with no path (document-level).
    #[must_use]
    pub fn root(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            path: None,
            json_pointer: None,
            detail: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_derived_from_path() {
        let issue = Issue::at("X", "msg", "entities[0].fields[1].id");
        assert_eq!(issue.json_pointer.as_deref(), Some("/entities/0/fields/1/id"));
    }
}
