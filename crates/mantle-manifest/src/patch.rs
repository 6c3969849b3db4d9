// SPDX-License-Identifier: MIT OR Apache-2.0
//! Patchset operations over manifests.
//!
//! Ops are addressed by RFC 6901 pointers, optionally using `@[id=...]`
//! selector segments which are resolved against the document first.
//! `set` picks add-or-replace based on existence; `rename_id` is two-phase:
//! replace the id field, then rewrite every `entity`/`entity_id`/`entityId`
//! reference to the old id.

use mantle_canonical::resolve_selector_path;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Insert a value at `path` (array insert or object insert-or-replace).
    Add {
        /// Pointer (selector segments permitted).
        path: String,
        /// Value to insert.
        value: Value,
    },
    /// Replace the value at `path`, adding it when absent.
    Set {
        /// Pointer (selector segments permitted).
        path: String,
        /// Value to write.
        value: Value,
    },
    /// Remove the value at `path`.
    Remove {
        /// Pointer (selector segments permitted).
        path: String,
    },
    /// Rename the `id` of the node at `path` and rewrite all references.
    RenameId {
        /// Pointer to the node carrying the id (selector segments permitted).
        path: String,
        /// The new id.
        to: String,
    },
}

impl PatchOp {
    /// The pointer this op addresses.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Set { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::RenameId { path, .. } => path,
        }
    }
}

/// Errors from patchset validation or application.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    /// The pointer (or a selector within it) could not be resolved.
    #[error("[PATCHSET_POINTER_INVALID] {detail} (path={path})")]
    PointerInvalid {
        /// The offending pointer.
        path: String,
        /// Resolution failure detail.
        detail: String,
    },

    /// The op targeted a node that does not exist.
    #[error("[PATCHSET_TARGET_NOT_FOUND] no value at {path}")]
    TargetNotFound {
        /// The offending pointer.
        path: String,
    },

    /// The op is malformed for its target (e.g. rename on a non-object).
    #[error("[PATCHSET_OP_INVALID] {detail} (path={path})")]
    OpInvalid {
        /// The offending pointer.
        path: String,
        /// What is wrong.
        detail: String,
    },

    /// The batch exceeds the configured op limit.
    #[error("[PATCHSET_LIMIT_EXCEEDED] {count} ops exceed the limit of {limit}")]
    LimitExceeded {
        /// Number of ops submitted.
        count: usize,
        /// Configured maximum.
        limit: usize,
    },
}

impl PatchError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            PatchError::PointerInvalid { .. } => "PATCHSET_POINTER_INVALID",
            PatchError::TargetNotFound { .. } => "PATCHSET_TARGET_NOT_FOUND",
            PatchError::OpInvalid { .. } => "PATCHSET_OP_INVALID",
            PatchError::LimitExceeded { .. } => "PATCHSET_LIMIT_EXCEEDED",
        }
    }
}

/// Record of one applied op, with its fully numeric pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOp {
    /// Op discriminator (`add`, `set`, `remove`, `rename_id`).
    pub op: String,
    /// Numeric pointer the op landed on.
    pub pointer: String,
}

/// Result of applying a patchset.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    /// The patched manifest.
    pub manifest: Value,
    /// Ops applied, in order.
    pub applied: Vec<AppliedOp>,
}

/// Validate a patchset without keeping the result.
///
/// # Errors
///
/// Same failure modes as [`apply_patchset`].
pub fn validate_patchset(
    manifest: &Value,
    ops: &[PatchOp],
    max_ops: Option<usize>,
) -> Result<Vec<AppliedOp>, PatchError> {
    apply_patchset(manifest, ops, max_ops).map(|outcome| outcome.applied)
}

/// Apply a patchset to a manifest, returning the patched tree and the
/// numeric pointer each op resolved to. The input is never mutated; a
/// failing op leaves no partial result.
///
/// # Errors
///
/// Returns [`PatchError`] when the batch exceeds `max_ops`, a pointer fails
/// to resolve, or an op is malformed for its target.
pub fn apply_patchset(
    manifest: &Value,
    ops: &[PatchOp],
    max_ops: Option<usize>,
) -> Result<PatchOutcome, PatchError> {
    if let Some(limit) = max_ops {
        if ops.len() > limit {
            return Err(PatchError::LimitExceeded {
                count: ops.len(),
                limit,
            });
        }
    }

    let mut doc = manifest.clone();
    let mut applied = Vec::with_capacity(ops.len());

    for op in ops {
        let pointer = match op {
            PatchOp::Add { path, value } => {
                let pointer = resolve_parent_scope(&doc, path)?;
                apply_add(&mut doc, &pointer, value.clone())?;
                pointer
            }
            PatchOp::Set { path, value } => {
                let pointer = resolve_parent_scope(&doc, path)?;
                if doc.pointer(&pointer).is_some() {
                    *doc.pointer_mut(&pointer).expect("checked above") = value.clone();
                } else {
                    apply_add(&mut doc, &pointer, value.clone())?;
                }
                pointer
            }
            PatchOp::Remove { path } => {
                let pointer = resolve_full(&doc, path)?;
                apply_remove(&mut doc, &pointer)?;
                pointer
            }
            PatchOp::RenameId { path, to } => {
                let pointer = resolve_full(&doc, path)?;
                apply_rename_id(&mut doc, &pointer, to)?;
                pointer
            }
        };
        applied.push(AppliedOp {
            op: match op {
                PatchOp::Add { .. } => "add",
                PatchOp::Set { .. } => "set",
                PatchOp::Remove { .. } => "remove",
                PatchOp::RenameId { .. } => "rename_id",
            }
            .to_string(),
            pointer,
        });
    }

    Ok(PatchOutcome {
        manifest: doc,
        applied,
    })
}

/// Resolve a pointer whose target must already exist.
fn resolve_full(doc: &Value, path: &str) -> Result<String, PatchError> {
    resolve_selector_path(doc, path).map_err(|err| PatchError::PointerInvalid {
        path: path.to_string(),
        detail: err.to_string(),
    })
}

/// Resolve a pointer whose *parent* must exist; the final token may be new.
/// Selector segments in the final token are not meaningful for adds.
fn resolve_parent_scope(doc: &Value, path: &str) -> Result<String, PatchError> {
    let Some((parent, token)) = path.rsplit_once('/') else {
        return Err(PatchError::PointerInvalid {
            path: path.to_string(),
            detail: "pointer must start with '/'".into(),
        });
    };
    if parent.is_empty() {
        return Ok(format!("/{token}"));
    }
    let parent_pointer = resolve_full(doc, parent)?;
    Ok(format!("{parent_pointer}/{token}"))
}

fn apply_add(doc: &mut Value, pointer: &str, value: Value) -> Result<(), PatchError> {
    let Some((parent_ptr, token)) = pointer.rsplit_once('/') else {
        return Err(PatchError::PointerInvalid {
            path: pointer.to_string(),
            detail: "pointer must start with '/'".into(),
        });
    };
    let Some(parent) = doc.pointer_mut(parent_ptr) else {
        return Err(PatchError::TargetNotFound {
            path: parent_ptr.to_string(),
        });
    };
    let token = token.replace("~1", "/").replace("~0", "~");
    match parent {
        Value::Object(map) => {
            map.insert(token, value);
            Ok(())
        }
        Value::Array(items) => {
            if token == "-" {
                items.push(value);
                return Ok(());
            }
            let idx: usize = token.parse().map_err(|_| PatchError::OpInvalid {
                path: pointer.to_string(),
                detail: "array index must be numeric or '-'".into(),
            })?;
            if idx > items.len() {
                return Err(PatchError::OpInvalid {
                    path: pointer.to_string(),
                    detail: "array index out of range".into(),
                });
            }
            items.insert(idx, value);
            Ok(())
        }
        _ => Err(PatchError::OpInvalid {
            path: pointer.to_string(),
            detail: "parent is not a container".into(),
        }),
    }
}

fn apply_remove(doc: &mut Value, pointer: &str) -> Result<(), PatchError> {
    let Some((parent_ptr, token)) = pointer.rsplit_once('/') else {
        return Err(PatchError::PointerInvalid {
            path: pointer.to_string(),
            detail: "pointer must start with '/'".into(),
        });
    };
    let Some(parent) = doc.pointer_mut(parent_ptr) else {
        return Err(PatchError::TargetNotFound {
            path: parent_ptr.to_string(),
        });
    };
    let token = token.replace("~1", "/").replace("~0", "~");
    match parent {
        Value::Object(map) => map
            .remove(&token)
            .map(|_| ())
            .ok_or(PatchError::TargetNotFound {
                path: pointer.to_string(),
            }),
        Value::Array(items) => {
            let idx: usize = token.parse().map_err(|_| PatchError::OpInvalid {
                path: pointer.to_string(),
                detail: "array index must be numeric".into(),
            })?;
            if idx >= items.len() {
                return Err(PatchError::TargetNotFound {
                    path: pointer.to_string(),
                });
            }
            items.remove(idx);
            Ok(())
        }
        _ => Err(PatchError::OpInvalid {
            path: pointer.to_string(),
            detail: "parent is not a container".into(),
        }),
    }
}

/// Keys that carry entity references a rename must follow.
const REFERENCE_KEYS: &[&str] = &["entity", "entity_id", "entityId"];

fn apply_rename_id(doc: &mut Value, pointer: &str, new_id: &str) -> Result<(), PatchError> {
    let old_id = {
        let Some(node) = doc.pointer_mut(pointer) else {
            return Err(PatchError::TargetNotFound {
                path: pointer.to_string(),
            });
        };
        let Some(map) = node.as_object_mut() else {
            return Err(PatchError::OpInvalid {
                path: pointer.to_string(),
                detail: "rename_id target must be an object".into(),
            });
        };
        let Some(old) = map.get("id").and_then(Value::as_str).map(String::from) else {
            return Err(PatchError::OpInvalid {
                path: pointer.to_string(),
                detail: "rename_id target has no string id".into(),
            });
        };
        map.insert("id".into(), Value::String(new_id.to_string()));
        old
    };

    rewrite_references(doc, &old_id, new_id);
    Ok(())
}

fn rewrite_references(value: &mut Value, old_id: &str, new_id: &str) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if REFERENCE_KEYS.contains(&key.as_str())
                    && child.as_str() == Some(old_id)
                {
                    *child = Value::String(new_id.to_string());
                } else {
                    rewrite_references(child, old_id, new_id);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_references(item, old_id, new_id);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "entities": [
                {"id": "entity.a", "fields": [{"id": "a.name", "type": "string"}]},
            ],
            "views": [{"id": "a.list", "kind": "list", "entity": "entity.a"}],
            "actions": [{"id": "action.a_new", "kind": "create_record", "entity_id": "entity.a"}],
        })
    }

    #[test]
    fn add_appends_to_arrays() {
        let ops = vec![PatchOp::Add {
            path: "/entities/0/fields/-".into(),
            value: json!({"id": "a.code", "type": "string"}),
        }];
        let outcome = apply_patchset(&doc(), &ops, None).unwrap();
        let fields = outcome.manifest["entities"][0]["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn set_replaces_or_creates() {
        let ops = vec![
            PatchOp::Set {
                path: "/entities/@[id=entity.a]/label".into(),
                value: json!("Alpha"),
            },
            PatchOp::Set {
                path: "/entities/@[id=entity.a]/label".into(),
                value: json!("Beta"),
            },
        ];
        let outcome = apply_patchset(&doc(), &ops, None).unwrap();
        assert_eq!(outcome.manifest["entities"][0]["label"], json!("Beta"));
    }

    #[test]
    fn remove_missing_target_fails() {
        let ops = vec![PatchOp::Remove {
            path: "/entities/0/fields/5".into(),
        }];
        let err = apply_patchset(&doc(), &ops, None).unwrap_err();
        assert_eq!(err.code(), "PATCHSET_TARGET_NOT_FOUND");
    }

    #[test]
    fn rename_id_rewrites_references() {
        let ops = vec![PatchOp::RenameId {
            path: "/entities/@[id=entity.a]".into(),
            to: "entity.alpha".into(),
        }];
        let outcome = apply_patchset(&doc(), &ops, None).unwrap();
        assert_eq!(outcome.manifest["entities"][0]["id"], json!("entity.alpha"));
        assert_eq!(outcome.manifest["views"][0]["entity"], json!("entity.alpha"));
        assert_eq!(outcome.manifest["actions"][0]["entity_id"], json!("entity.alpha"));
    }

    #[test]
    fn op_limit_enforced() {
        let ops = vec![
            PatchOp::Set { path: "/x".into(), value: json!(1) },
            PatchOp::Set { path: "/y".into(), value: json!(2) },
        ];
        let err = apply_patchset(&doc(), &ops, Some(1)).unwrap_err();
        assert_eq!(err.code(), "PATCHSET_LIMIT_EXCEEDED");
    }

    #[test]
    fn selector_paths_resolve_before_application() {
        let ops = vec![PatchOp::Set {
            path: "/entities/@[id=entity.a]/fields/@[id=a.name]/label".into(),
            value: json!("Name"),
        }];
        let outcome = apply_patchset(&doc(), &ops, None).unwrap();
        assert_eq!(outcome.applied[0].pointer, "/entities/0/fields/0/label");
        assert_eq!(
            outcome.manifest["entities"][0]["fields"][0]["label"],
            json!("Name")
        );
    }
}
