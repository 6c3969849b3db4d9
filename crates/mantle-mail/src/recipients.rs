// SPDX-License-Identifier: MIT OR Apache-2.0
//! Recipient resolution for `system.send_email` steps.
//!
//! Recipients accumulate from four sources, in order: explicit addresses,
//! record field ids, lookup-field targets (following the reference to the
//! target record's email fields), and a rendered `to_expr` template.
//! The merged list is deduplicated case-insensitively and filtered to
//! values containing `@`.

use mantle_manifest::EntityDef;
use mantle_render::render_template;
use serde_json::{Map, Value};

/// Fetches a record's data by `(entity_id, record_id)` during resolution.
pub type RecordFetcher<'a> = &'a dyn Fn(&str, &str) -> Option<Value>;

/// Split a loose recipient value (string with `,`/`;` separators, list of
/// strings, or scalar) into trimmed non-empty parts.
#[must_use]
pub fn split_recipients(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let mut push_text = |text: &str| {
        for part in text.replace(';', ",").split(',') {
            let part = part.trim();
            if !part.is_empty() {
                out.push(part.to_string());
            }
        }
    };
    match value {
        Value::Null => {}
        Value::String(s) => push_text(s),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) => push_text(s),
                    Value::Null => {}
                    other => push_text(&other.to_string()),
                }
            }
        }
        other => push_text(&other.to_string()),
    }
    out
}

/// Case-insensitive order-preserving dedupe.
#[must_use]
pub fn dedupe_recipients(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.to_lowercase()))
        .collect()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Candidate email fields on a lookup target, most specific first.
fn email_field_candidates(entity_id: Option<&str>, explicit: Option<&str>) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(field) = explicit.filter(|f| !f.is_empty()) {
        candidates.push(field.to_string());
    }
    if let Some(slug) = entity_id.and_then(|id| id.rsplit('.').next()) {
        for suffix in ["email", "work_email", "primary_email"] {
            candidates.push(format!("{slug}.{suffix}"));
        }
    }
    for generic in ["email", "work_email", "primary_email"] {
        candidates.push(generic.to_string());
    }
    candidates
}

fn lookup_emails(
    target_entity: Option<&str>,
    target_record_id: &str,
    email_field: Option<&str>,
    fetch: RecordFetcher<'_>,
) -> Vec<String> {
    let Some(entity_id) = target_entity else {
        return Vec::new();
    };
    let Some(record) = fetch(entity_id, target_record_id) else {
        return Vec::new();
    };
    for field in email_field_candidates(Some(entity_id), email_field) {
        if let Some(value) = record.get(&field) {
            let values = split_recipients(value);
            if !values.is_empty() {
                return values;
            }
        }
    }
    Vec::new()
}

/// Resolve the recipient list for a `system.send_email` step.
///
/// `inputs` is the resolved step input map, `context` the template context
/// for `to_expr`, `record` the triggering record's data, and `entity` its
/// definition (used to find lookup targets).
#[must_use]
pub fn resolve_recipients(
    inputs: &Map<String, Value>,
    context: &Value,
    record: &Value,
    entity: Option<&EntityDef>,
    fetch: RecordFetcher<'_>,
) -> Vec<String> {
    let mut recipients = Vec::new();

    // Explicit manual addresses are always additive.
    for key in ["to", "to_internal_emails"] {
        if let Some(value) = inputs.get(key) {
            recipients.extend(split_recipients(value));
        }
    }

    // Record fields can contribute recipients.
    let mut field_ids = string_list(inputs.get("to_field_ids"));
    if let Some(single) = inputs.get("to_field_id").and_then(Value::as_str) {
        if !single.is_empty() {
            field_ids.push(single.to_string());
        }
    }
    field_ids = dedupe_recipients(field_ids);
    for field_id in &field_ids {
        if let Some(value) = record.get(field_id) {
            recipients.extend(split_recipients(value));
        }
    }

    // Lookup fields can contribute recipients.
    let mut lookup_fields = string_list(inputs.get("to_lookup_field_ids"));
    if let Some(single) = inputs.get("to_lookup_field_id").and_then(Value::as_str) {
        if !single.is_empty() {
            lookup_fields.push(single.to_string());
        }
    }
    let explicit_target = inputs.get("to_lookup_entity_id").and_then(Value::as_str);
    let explicit_email_field = inputs.get("to_lookup_email_field").and_then(Value::as_str);
    for lookup_field in dedupe_recipients(lookup_fields) {
        let Some(target_id) = record.get(&lookup_field).and_then(Value::as_str) else {
            continue;
        };
        let target_entity = explicit_target.or_else(|| {
            entity
                .and_then(|e| e.field(&lookup_field))
                .and_then(|f| f.lookup_entity.as_deref())
        });
        recipients.extend(lookup_emails(
            target_entity,
            target_id,
            explicit_email_field,
            fetch,
        ));
    }

    // A template expression can contribute recipients; render failures are
    // advisory here.
    if let Some(to_expr) = inputs.get("to_expr").and_then(Value::as_str) {
        if !to_expr.trim().is_empty() {
            if let Ok(rendered) = render_template(to_expr, context, true) {
                recipients.extend(split_recipients(&Value::String(rendered)));
            }
        }
    }

    let recipients = recipients.into_iter().filter(|r| r.contains('@')).collect();
    dedupe_recipients(recipients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn splits_on_commas_and_semicolons() {
        let parts = split_recipients(&json!("a@x.com; b@x.com, c@x.com"));
        assert_eq!(parts, vec!["a@x.com", "b@x.com", "c@x.com"]);
    }

    #[test]
    fn merges_explicit_and_record_fields() {
        let record = json!({"job.client_email": "client@x.com"});
        let out = resolve_recipients(
            &inputs(json!({"to": "ops@x.com", "to_field_ids": ["job.client_email"]})),
            &json!({}),
            &record,
            None,
            &|_, _| None,
        );
        assert_eq!(out, vec!["ops@x.com", "client@x.com"]);
    }

    #[test]
    fn dedupes_case_insensitively_and_drops_non_addresses() {
        let out = resolve_recipients(
            &inputs(json!({"to": "Ops@X.com, ops@x.com, not-an-address"})),
            &json!({}),
            &json!({}),
            None,
            &|_, _| None,
        );
        assert_eq!(out, vec!["Ops@X.com"]);
    }

    #[test]
    fn lookup_fields_follow_the_reference() {
        let record = json!({"job.contact_id": "c1"});
        let fetch = |entity_id: &str, record_id: &str| -> Option<Value> {
            (entity_id == "entity.contact" && record_id == "c1")
                .then(|| json!({"contact.email": "contact@x.com"}))
        };
        let out = resolve_recipients(
            &inputs(json!({
                "to_lookup_field_id": "job.contact_id",
                "to_lookup_entity_id": "entity.contact",
            })),
            &json!({}),
            &record,
            None,
            &fetch,
        );
        assert_eq!(out, vec!["contact@x.com"]);
    }

    #[test]
    fn to_expr_renders_against_context() {
        let out = resolve_recipients(
            &inputs(json!({"to_expr": "{{ trigger.owner_email }}"})),
            &json!({"trigger": {"owner_email": "owner@x.com"}}),
            &json!({}),
            None,
            &|_, _| None,
        );
        assert_eq!(out, vec!["owner@x.com"]);
    }
}
