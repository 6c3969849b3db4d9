// SPDX-License-Identifier: MIT OR Apache-2.0
//! Selector-path resolution: JSON Pointer extended with `@[id=...]` segments.
//!
//! Patch surfaces address manifest nodes by id rather than index, e.g.
//! `/entities/@[id=entity.job]/fields/@[id=job.status]`. Resolution walks
//! the document, replaces each selector with the matching array index, and
//! returns a pure numeric RFC 6901 pointer.

use serde_json::Value;

/// Errors raised while resolving a selector path.
///
/// Every variant names the failing segment and the pointer resolved so far.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorPathError {
    /// A plain pointer segment could not be resolved (missing key, bad or
    /// out-of-range index, traversal into a scalar).
    #[error("{message} (segment={segment:?}, pointer={pointer_so_far:?})")]
    PointerResolve {
        /// What went wrong.
        message: String,
        /// The raw segment that failed.
        segment: String,
        /// Pointer resolved before the failure.
        pointer_so_far: String,
    },

    /// A selector segment was applied to a non-array node.
    #[error("selector segment used on non-array (segment={segment:?}, pointer={pointer_so_far:?})")]
    SelectorType {
        /// The raw selector segment.
        segment: String,
        /// Pointer resolved before the failure.
        pointer_so_far: String,
    },

    /// No array element carried the requested id.
    #[error("selector did not match any element (segment={segment:?}, pointer={pointer_so_far:?})")]
    SelectorNotFound {
        /// The raw selector segment.
        segment: String,
        /// Pointer resolved before the failure.
        pointer_so_far: String,
    },

    /// More than one array element carried the requested id.
    #[error("selector matched multiple elements (segment={segment:?}, pointer={pointer_so_far:?})")]
    SelectorNotUnique {
        /// The raw selector segment.
        segment: String,
        /// Pointer resolved before the failure.
        pointer_so_far: String,
    },
}

fn decode_segment(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

fn encode_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn is_selector(segment: &str) -> bool {
    segment.starts_with("@[id=") && segment.ends_with(']') && segment.len() > 6
}

fn selector_id(segment: &str) -> &str {
    &segment["@[id=".len()..segment.len() - 1]
}

/// Resolve selector segments against `doc` and return a numeric JSON Pointer.
///
/// # Errors
///
/// - [`SelectorPathError::SelectorType`] when a selector hits a non-array;
/// - [`SelectorPathError::SelectorNotFound`] / [`SelectorPathError::SelectorNotUnique`]
///   when the id matches zero or multiple elements;
/// - [`SelectorPathError::PointerResolve`] for plain-pointer failures.
pub fn resolve_selector_path(doc: &Value, selector_path: &str) -> Result<String, SelectorPathError> {
    if selector_path.is_empty() {
        return Ok(String::new());
    }

    let segments: Vec<&str> = selector_path
        .strip_prefix('/')
        .unwrap_or(selector_path)
        .split('/')
        .collect();

    let mut current = doc;
    let mut out_segments: Vec<String> = Vec::with_capacity(segments.len());

    for raw_segment in segments {
        let pointer_so_far = if out_segments.is_empty() {
            String::new()
        } else {
            format!("/{}", out_segments.join("/"))
        };

        if is_selector(raw_segment) {
            let Value::Array(items) = current else {
                return Err(SelectorPathError::SelectorType {
                    segment: raw_segment.to_string(),
                    pointer_so_far,
                });
            };
            let target_id = selector_id(raw_segment);
            let matches: Vec<usize> = items
                .iter()
                .enumerate()
                .filter(|(_, item)| {
                    item.get("id").and_then(Value::as_str) == Some(target_id)
                })
                .map(|(idx, _)| idx)
                .collect();
            match matches.as_slice() {
                [] => {
                    return Err(SelectorPathError::SelectorNotFound {
                        segment: raw_segment.to_string(),
                        pointer_so_far,
                    });
                }
                [idx] => {
                    current = &items[*idx];
                    out_segments.push(idx.to_string());
                }
                _ => {
                    return Err(SelectorPathError::SelectorNotUnique {
                        segment: raw_segment.to_string(),
                        pointer_so_far,
                    });
                }
            }
            continue;
        }

        let segment = decode_segment(raw_segment);
        match current {
            Value::Object(map) => {
                let Some(next) = map.get(&segment) else {
                    return Err(SelectorPathError::PointerResolve {
                        message: "missing object key".into(),
                        segment: raw_segment.to_string(),
                        pointer_so_far,
                    });
                };
                current = next;
                out_segments.push(encode_segment(&segment));
            }
            Value::Array(items) => {
                let idx: usize = match segment.parse() {
                    Ok(idx) if segment.bytes().all(|b| b.is_ascii_digit()) => idx,
                    _ => {
                        return Err(SelectorPathError::PointerResolve {
                            message: "invalid array index".into(),
                            segment: raw_segment.to_string(),
                            pointer_so_far,
                        });
                    }
                };
                let Some(next) = items.get(idx) else {
                    return Err(SelectorPathError::PointerResolve {
                        message: "array index out of range".into(),
                        segment: raw_segment.to_string(),
                        pointer_so_far,
                    });
                };
                current = next;
                out_segments.push(idx.to_string());
            }
            _ => {
                return Err(SelectorPathError::PointerResolve {
                    message: "cannot traverse into non-container".into(),
                    segment: raw_segment.to_string(),
                    pointer_so_far,
                });
            }
        }
    }

    Ok(format!("/{}", out_segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_selectors() {
        let doc = json!({
            "entities": [{
                "id": "entity.job",
                "fields": [
                    {"id": "job.title"},
                    {"id": "job.status"},
                    {"id": "job.priority"},
                ],
            }]
        });
        let path = "/entities/@[id=entity.job]/fields/@[id=job.status]";
        assert_eq!(resolve_selector_path(&doc, path).unwrap(), "/entities/0/fields/1");
    }

    #[test]
    fn selector_not_found() {
        let doc = json!({"entities": [{"id": "entity.job"}]});
        let err = resolve_selector_path(&doc, "/entities/@[id=missing]").unwrap_err();
        assert!(matches!(err, SelectorPathError::SelectorNotFound { .. }));
    }

    #[test]
    fn selector_not_unique() {
        let doc = json!({"entities": [{"id": "dup"}, {"id": "dup"}]});
        let err = resolve_selector_path(&doc, "/entities/@[id=dup]").unwrap_err();
        assert!(matches!(err, SelectorPathError::SelectorNotUnique { .. }));
    }

    #[test]
    fn selector_on_non_array() {
        let doc = json!({"entities": {"id": "entity.job"}});
        let err = resolve_selector_path(&doc, "/entities/@[id=entity.job]").unwrap_err();
        assert!(matches!(err, SelectorPathError::SelectorType { .. }));
    }

    #[test]
    fn missing_key_is_pointer_error() {
        let doc = json!({"entities": []});
        let err = resolve_selector_path(&doc, "/missing").unwrap_err();
        assert!(matches!(err, SelectorPathError::PointerResolve { .. }));
    }

    #[test]
    fn rfc6901_tokens_round_trip() {
        let doc = json!({"a/b": {"~key": 1}});
        assert_eq!(
            resolve_selector_path(&doc, "/a~1b/~0key").unwrap(),
            "/a~1b/~0key"
        );
    }
}
