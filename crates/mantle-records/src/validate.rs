// SPDX-License-Identifier: MIT OR Apache-2.0
//! Record validation against a compiled entity schema.
//!
//! The store itself never interprets field types; this layer enforces the
//! schema on the executor's behalf: required fields, enum membership,
//! well-formed uuid/date/datetime values, and lookup targets with their
//! domain conditions.

use chrono::{DateTime, NaiveDate};
use mantle_condition::eval_condition;
use mantle_manifest::{EntityDef, FieldDef, FieldType, Issue};
use serde_json::{Value, json};
use uuid::Uuid;

/// Whether the data is a full create payload or a merge patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Required fields must be present.
    Create,
    /// Only the supplied fields are checked.
    Update,
}

/// Resolves lookup targets during validation. Implemented by the
/// workspace-bound record store.
pub trait LookupResolver {
    /// Fetch a record of `entity_id` by id.
    fn resolve(&self, entity_id: &str, record_id: &str) -> Option<Value>;
}

impl<T: Fn(&str, &str) -> Option<Value>> LookupResolver for T {
    fn resolve(&self, entity_id: &str, record_id: &str) -> Option<Value> {
        self(entity_id, record_id)
    }
}

fn present(value: Option<&Value>) -> bool {
    value.is_some_and(|v| !v.is_null())
}

/// Validate `data` against an entity schema.
///
/// `current` is the pre-merge record for updates (used as `$record` context
/// in lookup domains); pass the data itself for creates.
#[must_use]
pub fn validate_record_data(
    entity: &EntityDef,
    data: &Value,
    current: &Value,
    mode: ValidationMode,
    lookups: &dyn LookupResolver,
) -> Vec<Issue> {
    let mut issues = Vec::new();
    let Some(map) = data.as_object() else {
        issues.push(Issue::root("VALIDATION_INVALID", "record data must be an object"));
        return issues;
    };

    if mode == ValidationMode::Create {
        for field in &entity.fields {
            if field.required && !field.readonly && !present(map.get(&field.id)) {
                issues.push(Issue::at(
                    "VALIDATION_REQUIRED_MISSING",
                    format!("required field {} is missing", field.id),
                    field.id.clone(),
                ));
            }
        }
    }

    for (field_id, value) in map {
        if field_id == "id" || value.is_null() {
            continue;
        }
        let Some(field) = entity.field(field_id) else {
            // Unknown keys are tolerated; the manifest may trail the data.
            continue;
        };
        validate_field_value(field, value, current, lookups, &mut issues);
    }

    issues
}

fn validate_field_value(
    field: &FieldDef,
    value: &Value,
    current: &Value,
    lookups: &dyn LookupResolver,
    issues: &mut Vec<Issue>,
) {
    match field.field_type {
        FieldType::String | FieldType::Text => {
            if !value.is_string() {
                issues.push(type_issue(field, "a string"));
            }
        }
        FieldType::Number => {
            if !value.is_number() {
                issues.push(type_issue(field, "a number"));
            }
        }
        FieldType::Boolean => {
            if !value.is_boolean() {
                issues.push(type_issue(field, "a boolean"));
            }
        }
        FieldType::Tags => {
            let ok = value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string));
            if !ok {
                issues.push(type_issue(field, "a list of strings"));
            }
        }
        FieldType::Uuid => match value.as_str() {
            Some(s) if Uuid::parse_str(s).is_ok() => {}
            _ => issues.push(Issue::at(
                "VALIDATION_UUID_INVALID",
                format!("{} must be a well-formed UUID", field.id),
                field.id.clone(),
            )),
        },
        FieldType::Date => match value.as_str() {
            Some(s) if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() => {}
            _ => issues.push(Issue::at(
                "VALIDATION_DATE_INVALID",
                format!("{} must be an ISO date (YYYY-MM-DD)", field.id),
                field.id.clone(),
            )),
        },
        FieldType::DateTime => match value.as_str() {
            Some(s) if parse_datetime(s) => {}
            _ => issues.push(Issue::at(
                "VALIDATION_DATETIME_INVALID",
                format!("{} must be an ISO datetime", field.id),
                field.id.clone(),
            )),
        },
        FieldType::Enum => match value.as_str() {
            Some(s) if field.options.iter().any(|opt| opt.value == s) => {}
            _ => issues.push(
                Issue::at(
                    "VALIDATION_ENUM_INVALID",
                    format!("{} must be one of the declared options", field.id),
                    field.id.clone(),
                )
                .with_detail(json!({
                    "options": field.options.iter().map(|o| o.value.clone()).collect::<Vec<_>>(),
                })),
            ),
        },
        FieldType::Lookup => validate_lookup(field, value, current, lookups, issues),
    }
}

fn parse_datetime(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").is_ok()
}

fn type_issue(field: &FieldDef, expected: &str) -> Issue {
    Issue::at(
        "VALIDATION_TYPE_INVALID",
        format!("{} must be {expected}", field.id),
        field.id.clone(),
    )
}

fn validate_lookup(
    field: &FieldDef,
    value: &Value,
    current: &Value,
    lookups: &dyn LookupResolver,
    issues: &mut Vec<Issue>,
) {
    let Some(target_entity) = field.lookup_entity.as_deref() else {
        issues.push(Issue::at(
            "LOOKUP_TARGET_NOT_FOUND",
            format!("{} has no target entity", field.id),
            field.id.clone(),
        ));
        return;
    };
    let Some(record_id) = value.as_str() else {
        issues.push(type_issue(field, "a record id"));
        return;
    };
    let Some(candidate) = lookups.resolve(target_entity, record_id) else {
        issues.push(
            Issue::at(
                "LOOKUP_TARGET_NOT_FOUND",
                format!("{} does not resolve to a record of {target_entity}", field.id),
                field.id.clone(),
            )
            .with_detail(json!({"record_id": record_id})),
        );
        return;
    };

    if let Some(domain) = &field.lookup_domain {
        let ctx = json!({"candidate": candidate, "record": current});
        match eval_condition(domain, &ctx) {
            Ok(true) => {}
            Ok(false) => issues.push(Issue::at(
                "LOOKUP_DOMAIN_VIOLATION",
                format!("{} candidate violates the lookup domain", field.id),
                field.id.clone(),
            )),
            Err(err) => issues.push(
                Issue::at("CONDITION_INVALID", err.message.clone(), field.id.clone())
                    .with_detail(json!({"path": err.path})),
            ),
        }
    }
}
