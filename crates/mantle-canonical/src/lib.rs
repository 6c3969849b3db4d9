// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic canonical JSON serialization and content hashing.
//!
//! Canonical form is the *only* identity-producing path for manifests:
//! two manifests with identical canonical form hash identically, and a
//! manifest's id is `sha256:<hex>` of its canonical UTF-8 bytes.
//!
//! Rules:
//! - object keys are emitted in lexicographic order, recursively;
//! - array order is preserved;
//! - non-ASCII text is preserved raw (no `\u` escapes);
//! - no whitespace;
//! - integers and floats stay distinct (`1` is not `1.0`);
//! - NaN and ±Inf are rejected;
//! - non-string map keys and non-JSON scalars (bytes, etc.) are rejected.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod pointer;
mod selector;
mod ser;

pub use pointer::{dot_path_to_pointer, pointer_to_dot_path};
pub use selector::{SelectorPathError, resolve_selector_path};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Errors raised while producing canonical JSON.
///
/// Every variant carries the JSON path (`$`-rooted dot/bracket form) of the
/// offending node so validation surfaces can report it precisely.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalJsonError {
    /// A float was NaN or ±Inf.
    #[error("non-finite float at {path}")]
    NonFiniteNumber {
        /// JSON path of the offending value.
        path: String,
    },

    /// A map key was not a string.
    #[error("unsupported key type at {path}")]
    NonStringKey {
        /// JSON path of the enclosing object.
        path: String,
    },

    /// A value outside the JSON data model (bytes, unit structs, etc.).
    #[error("unsupported type at {path}: {kind}")]
    UnsupportedType {
        /// JSON path of the offending value.
        path: String,
        /// Human-readable name of the rejected type.
        kind: String,
    },
}

/// Serialize `value` to deterministic canonical JSON.
///
/// # Errors
///
/// Returns [`CanonicalJsonError`] for non-finite floats, non-string map
/// keys, and values outside the JSON data model.
///
/// # Examples
///
/// ```
/// use serde_json::json;
///
/// let out = mantle_canonical::canonical_dumps(&json!({"b": 1, "a": 2})).unwrap();
/// assert_eq!(out, r#"{"a":2,"b":1}"#);
///
/// assert!(mantle_canonical::canonical_dumps(&f64::NAN).is_err());
/// ```
pub fn canonical_dumps<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let node = value.serialize(ser::CanonicalSerializer::root())?;
    let mut out = String::new();
    node.write(&mut out);
    Ok(out)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Return the canonical content hash for a manifest value.
///
/// The result is `"sha256:" + hex(sha256(canonical_utf8(value)))` and is
/// referentially transparent: equal canonical forms hash equally.
///
/// # Errors
///
/// Propagates [`CanonicalJsonError`] from canonical serialization.
pub fn manifest_hash<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let canonical = canonical_dumps(value)?;
    Ok(format!("sha256:{}", sha256_hex(canonical.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_key_ordering() {
        let out = canonical_dumps(&json!({"b": 1, "a": {"d": 4, "c": 3}})).unwrap();
        assert_eq!(out, r#"{"a":{"c":3,"d":4},"b":1}"#);
    }

    #[test]
    fn list_order_preserved() {
        let out = canonical_dumps(&json!({"list": [2, 1, 3]})).unwrap();
        assert_eq!(out, r#"{"list":[2,1,3]}"#);
    }

    #[test]
    fn non_ascii_preserved() {
        let out = canonical_dumps(&json!({"name": "café"})).unwrap();
        assert!(out.contains("café"));
        assert!(!out.contains("\\u"));
    }

    #[test]
    fn numeric_distinction() {
        let int = canonical_dumps(&json!({"n": 1})).unwrap();
        let float = canonical_dumps(&json!({"n": 1.0})).unwrap();
        assert_ne!(int, float);
    }

    #[test]
    fn rejects_non_finite() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = canonical_dumps(&bad).unwrap_err();
            assert!(matches!(err, CanonicalJsonError::NonFiniteNumber { .. }));
        }
    }

    #[test]
    fn non_finite_path_points_at_member() {
        #[derive(Serialize)]
        struct Holder {
            bad: f64,
        }
        let err = canonical_dumps(&Holder { bad: f64::NAN }).unwrap_err();
        assert_eq!(
            err,
            CanonicalJsonError::NonFiniteNumber {
                path: "$.bad".into()
            }
        );
    }

    #[test]
    fn rejects_bytes() {
        struct Blob;
        impl Serialize for Blob {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_bytes(&[1, 2, 3])
            }
        }
        let err = canonical_dumps(&json!({"ok": 1})).and(canonical_dumps(&Blob));
        assert!(matches!(
            err.unwrap_err(),
            CanonicalJsonError::UnsupportedType { .. }
        ));
    }

    #[test]
    fn manifest_hash_is_prefixed_and_stable() {
        let a = manifest_hash(&json!({"b": 1, "a": 2})).unwrap();
        let b = manifest_hash(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
    }
}
