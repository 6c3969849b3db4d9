// SPDX-License-Identifier: MIT OR Apache-2.0
//! Small tree interpreter for the condition AST shared by permission gates,
//! list filters, lookup domains, trigger filters, and automation steps.
//!
//! Conditions are JSON objects:
//!
//! ```json
//! {"op": "and", "children": [
//!   {"op": "eq", "left": {"var": "record.status"}, "right": {"literal": "done"}}
//! ]}
//! ```
//!
//! Leaves are value nodes with exactly one of `var`, `literal`, `array`, or
//! `ref`. `var` and `ref` resolve dot-wise against the evaluation context
//! (`ref` values carry a leading `$`, e.g. `$candidate.a.region`).
//!
//! Evaluation depth is capped at [`MAX_DEPTH`]; the evaluator runs on an
//! explicit work stack, so hostile nesting cannot overflow the native stack
//! and worst-case cost is linear in node count.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on condition nesting depth.
pub const MAX_DEPTH: usize = 10;

/// Error raised by condition evaluation or validation.
///
/// Surfaced to callers under the `CONDITION_INVALID` code with the failing
/// node's path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (path={path})")]
pub struct ConditionError {
    /// What went wrong.
    pub message: String,
    /// Dot/bracket path of the failing node.
    pub path: String,
}

impl ConditionError {
    fn new(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: path.into(),
        }
    }
}

/// Resolve a dot path (`a.b.c`) against a JSON context.
///
/// Record fields are namespaced with dots (`job.status`), so at every
/// object the whole remaining path is tried as a literal key before
/// splitting off the next segment. Returns `None` when any step is
/// missing or not an object.
#[must_use]
pub fn resolve_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = ctx;
    let mut rest = path;
    loop {
        let map = current.as_object()?;
        if let Some(found) = map.get(rest) {
            return Some(found);
        }
        let (head, tail) = rest.split_once('.')?;
        current = map.get(head)?;
        rest = tail;
    }
}

fn resolve_var(ctx: &Value, name: &str, path: &str) -> Result<Value, ConditionError> {
    resolve_path(ctx, name)
        .cloned()
        .ok_or_else(|| ConditionError::new(format!("variable not found: {name}"), path))
}

/// Resolve a value node against `ctx`.
///
/// # Errors
///
/// Returns [`ConditionError`] for malformed nodes, unresolvable variables,
/// or nesting beyond [`MAX_DEPTH`].
pub fn resolve_value_node(node: &Value, ctx: &Value, path: &str) -> Result<Value, ConditionError> {
    resolve_value_node_at(node, ctx, path, 1)
}

fn resolve_value_node_at(
    node: &Value,
    ctx: &Value,
    path: &str,
    depth: usize,
) -> Result<Value, ConditionError> {
    if depth > MAX_DEPTH {
        return Err(ConditionError::new("condition depth exceeded", path));
    }
    let Value::Object(map) = node else {
        return Err(ConditionError::new("invalid value node", path));
    };
    if map.len() != 1 {
        return Err(ConditionError::new("invalid value node shape", path));
    }
    if let Some(var) = map.get("var") {
        let Some(name) = var.as_str() else {
            return Err(ConditionError::new("var must be string", path));
        };
        return resolve_var(ctx, name, path);
    }
    if let Some(literal) = map.get("literal") {
        return Ok(literal.clone());
    }
    if let Some(arr) = map.get("array") {
        let Value::Array(items) = arr else {
            return Err(ConditionError::new("array must be list", path));
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(resolve_value_node_at(
                item,
                ctx,
                &format!("{path}.array"),
                depth + 1,
            )?);
        }
        return Ok(Value::Array(out));
    }
    if let Some(reference) = map.get("ref") {
        let Some(name) = reference.as_str() else {
            return Err(ConditionError::new("ref must be string", path));
        };
        let name = name.strip_prefix('$').unwrap_or(name);
        return resolve_var(ctx, name, path);
    }
    Err(ConditionError::new("unknown value node", path))
}

/// How a boolean combinator folds its children's results.
enum Combine {
    All,
    Any,
    Negate,
}

/// Work item for the explicit evaluation stack.
enum Task<'a> {
    Eval {
        cond: &'a Value,
        path: String,
        depth: usize,
    },
    Fold {
        combine: Combine,
        arity: usize,
    },
}

/// Evaluate a condition against `ctx`.
///
/// Supported operators: `and`, `or`, `not` (over `children`), `eq`, `neq`
/// (over `left`/`right` value nodes), `exists`, `not_exists` (over `left`).
/// `exists` is true when the resolved value is non-null; an unresolvable
/// variable under `exists`/`not_exists` counts as absent rather than failing.
///
/// # Errors
///
/// Returns [`ConditionError`] for malformed conditions, unsupported
/// operators, unresolvable variables under `eq`/`neq`, or nesting beyond
/// [`MAX_DEPTH`].
pub fn eval_condition(cond: &Value, ctx: &Value) -> Result<bool, ConditionError> {
    eval_condition_inner(cond, ctx, false)
}

/// [`eval_condition`] with strict variable resolution: an unresolvable
/// variable is an error even under `exists`/`not_exists`. Permission gates
/// use this mode so a typo in a condition denies loudly instead of
/// silently evaluating to absent.
///
/// # Errors
///
/// As [`eval_condition`], plus unresolvable variables anywhere.
pub fn eval_condition_strict(cond: &Value, ctx: &Value) -> Result<bool, ConditionError> {
    eval_condition_inner(cond, ctx, true)
}

fn eval_condition_inner(cond: &Value, ctx: &Value, strict: bool) -> Result<bool, ConditionError> {
    let mut tasks = vec![Task::Eval {
        cond,
        path: "$".into(),
        depth: 1,
    }];
    let mut results: Vec<bool> = Vec::new();

    while let Some(task) = tasks.pop() {
        match task {
            Task::Fold { combine, arity } => {
                let at = results.len().checked_sub(arity).ok_or_else(|| {
                    ConditionError::new("internal evaluation underflow", "$")
                })?;
                let folded = {
                    let children = &results[at..];
                    match combine {
                        Combine::All => children.iter().all(|b| *b),
                        Combine::Any => children.iter().any(|b| *b),
                        Combine::Negate => !children[0],
                    }
                };
                results.truncate(at);
                results.push(folded);
            }
            Task::Eval { cond, path, depth } => {
                if depth > MAX_DEPTH {
                    return Err(ConditionError::new("condition depth exceeded", path));
                }
                let Value::Object(map) = cond else {
                    return Err(ConditionError::new("condition must be object", path));
                };
                let op = map.get("op").and_then(Value::as_str).unwrap_or_default();
                match op {
                    "and" | "or" => {
                        let Some(Value::Array(children)) = map.get("children") else {
                            return Err(ConditionError::new("children required", path));
                        };
                        if children.is_empty() {
                            return Err(ConditionError::new("children required", path));
                        }
                        tasks.push(Task::Fold {
                            combine: if op == "and" { Combine::All } else { Combine::Any },
                            arity: children.len(),
                        });
                        for child in children.iter().rev() {
                            tasks.push(Task::Eval {
                                cond: child,
                                path: format!("{path}.children"),
                                depth: depth + 1,
                            });
                        }
                    }
                    "not" => {
                        let Some(Value::Array(children)) = map.get("children") else {
                            return Err(ConditionError::new("not requires single child", path));
                        };
                        if children.len() != 1 {
                            return Err(ConditionError::new("not requires single child", path));
                        }
                        tasks.push(Task::Fold {
                            combine: Combine::Negate,
                            arity: 1,
                        });
                        tasks.push(Task::Eval {
                            cond: &children[0],
                            path: format!("{path}.children"),
                            depth: depth + 1,
                        });
                    }
                    "eq" | "neq" => {
                        let left = map
                            .get("left")
                            .ok_or_else(|| ConditionError::new("left required", &*path))?;
                        let right = map
                            .get("right")
                            .ok_or_else(|| ConditionError::new("right required", &*path))?;
                        let left =
                            resolve_value_node_at(left, ctx, &format!("{path}.left"), depth + 1)?;
                        let right =
                            resolve_value_node_at(right, ctx, &format!("{path}.right"), depth + 1)?;
                        let equal = left == right;
                        results.push(if op == "eq" { equal } else { !equal });
                    }
                    "exists" | "not_exists" => {
                        let left = map
                            .get("left")
                            .ok_or_else(|| ConditionError::new("left required", &*path))?;
                        let resolved =
                            resolve_value_node_at(left, ctx, &format!("{path}.left"), depth + 1);
                        let exists = match resolved {
                            Ok(value) => !value.is_null(),
                            Err(err) if strict => return Err(err),
                            // Unresolvable variables count as absent here.
                            Err(_) => false,
                        };
                        results.push(if op == "exists" { exists } else { !exists });
                    }
                    _ => return Err(ConditionError::new("unsupported op", path)),
                }
            }
        }
    }

    results
        .pop()
        .ok_or_else(|| ConditionError::new("empty condition", "$"))
}

/// Shape-validate a value node without evaluating it.
///
/// Collects one [`ConditionError`] per malformed node.
pub fn validate_value_node(node: &Value, path: &str, errors: &mut Vec<ConditionError>) {
    let Value::Object(map) = node else {
        errors.push(ConditionError::new("value node must be object", path));
        return;
    };
    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    match keys.as_slice() {
        ["var"] => {
            if !map["var"].is_string() {
                errors.push(ConditionError::new("var must be string", path));
            }
        }
        ["ref"] => {
            if !map["ref"].is_string() {
                errors.push(ConditionError::new("ref must be string", path));
            }
        }
        ["literal"] => {}
        ["array"] => match &map["array"] {
            Value::Array(items) => {
                for (idx, item) in items.iter().enumerate() {
                    validate_value_node(item, &format!("{path}.array[{idx}]"), errors);
                }
            }
            _ => errors.push(ConditionError::new("array must be list", path)),
        },
        _ => errors.push(ConditionError::new("invalid value node shape", path)),
    }
}

/// Shape-validate a condition tree without evaluating it.
pub fn validate_condition(cond: &Value, path: &str, errors: &mut Vec<ConditionError>) {
    validate_condition_at(cond, path, 1, errors);
}

fn validate_condition_at(cond: &Value, path: &str, depth: usize, errors: &mut Vec<ConditionError>) {
    if depth > MAX_DEPTH {
        errors.push(ConditionError::new("condition depth exceeded", path));
        return;
    }
    let Value::Object(map) = cond else {
        errors.push(ConditionError::new("condition must be object", path));
        return;
    };
    let op = map.get("op").and_then(Value::as_str).unwrap_or_default();
    match op {
        "and" | "or" | "not" => match map.get("children") {
            Some(Value::Array(children)) if !children.is_empty() => {
                if op == "not" && children.len() != 1 {
                    errors.push(ConditionError::new("not requires single child", path));
                }
                for child in children {
                    validate_condition_at(child, &format!("{path}.children"), depth + 1, errors);
                }
            }
            _ => errors.push(ConditionError::new("children required", path)),
        },
        "eq" | "neq" => {
            match map.get("left") {
                Some(left) => validate_value_node(left, &format!("{path}.left"), errors),
                None => errors.push(ConditionError::new("left required", path)),
            }
            match map.get("right") {
                Some(right) => validate_value_node(right, &format!("{path}.right"), errors),
                None => errors.push(ConditionError::new("right required", path)),
            }
        }
        "exists" | "not_exists" => match map.get("left") {
            Some(left) => validate_value_node(left, &format!("{path}.left"), errors),
            None => errors.push(ConditionError::new("left required", path)),
        },
        _ => errors.push(ConditionError::new("unsupported op", path)),
    }
}

/// A single automation trigger filter: `path` resolved dot-wise against the
/// event payload, compared with `value` under `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerFilter {
    /// Dot path into the event payload.
    pub path: String,
    /// One of `eq`, `neq`, `exists`, `not_exists`.
    pub op: String,
    /// Comparison value (ignored by the existence operators).
    #[serde(default)]
    pub value: Value,
}

/// Evaluate trigger filters against an event payload. All filters must
/// pass; an unknown operator fails the filter set.
#[must_use]
pub fn match_filters(filters: &[TriggerFilter], payload: &Value) -> bool {
    filters.iter().all(|filter| {
        let resolved = resolve_path(payload, &filter.path);
        match filter.op.as_str() {
            "eq" => resolved == Some(&filter.value),
            "neq" => resolved != Some(&filter.value),
            "exists" => resolved.is_some_and(|v| !v.is_null()),
            "not_exists" => !resolved.is_some_and(|v| !v.is_null()),
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_over_var_and_literal() {
        let cond = json!({"op": "eq", "left": {"var": "record.status"}, "right": {"literal": "done"}});
        let ctx = json!({"record": {"status": "done"}});
        assert!(eval_condition(&cond, &ctx).unwrap());
    }

    #[test]
    fn ref_strips_dollar_prefix() {
        let cond = json!({
            "op": "eq",
            "left": {"ref": "$candidate.a.region"},
            "right": {"ref": "$record.b.region"},
        });
        let ctx = json!({
            "candidate": {"a": {"region": "N"}},
            "record": {"b": {"region": "N"}},
        });
        assert!(eval_condition(&cond, &ctx).unwrap());
    }

    #[test]
    fn and_or_not_combinators() {
        let ctx = json!({"a": 1, "b": 2});
        let cond = json!({
            "op": "and",
            "children": [
                {"op": "eq", "left": {"var": "a"}, "right": {"literal": 1}},
                {"op": "not", "children": [
                    {"op": "eq", "left": {"var": "b"}, "right": {"literal": 3}},
                ]},
            ],
        });
        assert!(eval_condition(&cond, &ctx).unwrap());
    }

    #[test]
    fn exists_tolerates_missing_variable() {
        let cond = json!({"op": "exists", "left": {"var": "missing.path"}});
        assert!(!eval_condition(&cond, &json!({})).unwrap());
        let cond = json!({"op": "not_exists", "left": {"var": "missing.path"}});
        assert!(eval_condition(&cond, &json!({})).unwrap());
    }

    #[test]
    fn strict_mode_rejects_missing_variable_under_exists() {
        let cond = json!({"op": "exists", "left": {"var": "missing.path"}});
        let err = eval_condition_strict(&cond, &json!({})).unwrap_err();
        assert!(err.message.contains("variable not found"));
        assert!(eval_condition_strict(&cond, &json!({"missing": {"path": 1}})).unwrap());
    }

    #[test]
    fn depth_cap_enforced() {
        let mut cond = json!({"op": "eq", "left": {"literal": 1}, "right": {"literal": 1}});
        for _ in 0..MAX_DEPTH + 1 {
            cond = json!({"op": "not", "children": [cond]});
        }
        let err = eval_condition(&cond, &json!({})).unwrap_err();
        assert!(err.message.contains("depth"));
    }

    #[test]
    fn unsupported_op_rejected() {
        let cond = json!({"op": "gte", "left": {"literal": 1}, "right": {"literal": 1}});
        assert!(eval_condition(&cond, &json!({})).is_err());
    }

    #[test]
    fn unresolved_var_under_eq_is_error() {
        let cond = json!({"op": "eq", "left": {"var": "nope"}, "right": {"literal": 1}});
        assert!(eval_condition(&cond, &json!({})).is_err());
    }

    #[test]
    fn namespaced_field_keys_resolve() {
        let ctx = json!({"record": {"job.status": "draft"}});
        assert_eq!(
            resolve_path(&ctx, "record.job.status"),
            Some(&json!("draft"))
        );
        let cond = json!({
            "op": "eq",
            "left": {"var": "record.job.status"},
            "right": {"literal": "draft"},
        });
        assert!(eval_condition(&cond, &ctx).unwrap());
    }

    #[test]
    fn filter_matching() {
        let filters = vec![TriggerFilter {
            path: "to".into(),
            op: "eq".into(),
            value: json!("done"),
        }];
        assert!(match_filters(&filters, &json!({"to": "done"})));
        assert!(!match_filters(&filters, &json!({"to": "draft"})));
        assert!(!match_filters(&filters, &json!({})));
    }

    #[test]
    fn validation_collects_shape_errors() {
        let mut errors = Vec::new();
        validate_condition(
            &json!({"op": "eq", "left": {"bogus": 1}}),
            "permissions.condition",
            &mut errors,
        );
        assert_eq!(errors.len(), 2); // bad left node + missing right
    }
}
