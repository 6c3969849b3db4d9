// SPDX-License-Identifier: MIT OR Apache-2.0
//! Raw manifest validation: shape, type, and reference errors.
//!
//! Runs after normalization; everything it reports is a hard `MANIFEST_*`
//! error that blocks install.

use crate::issue::Issue;
use crate::normalize::normalize_manifest;
use crate::util::{get_str, ids_of};
use serde_json::Value;

/// Field types an entity may declare.
pub const FIELD_TYPES: &[&str] = &[
    "uuid", "string", "text", "number", "boolean", "enum", "date", "datetime", "lookup", "tags",
];

/// Action kinds the runtime executes.
pub const ACTION_KINDS: &[&str] = &[
    "navigate",
    "open_form",
    "refresh",
    "create_record",
    "update_record",
    "bulk_update",
];

/// Trigger events a manifest may subscribe to.
pub const TRIGGER_EVENTS: &[&str] = &[
    "record.created",
    "record.updated",
    "workflow.status_changed",
    "action.clicked",
];

/// Normalize and validate a manifest, returning the normalized tree plus
/// hard errors and advisory warnings.
#[must_use]
pub fn validate_manifest_raw(
    manifest: &Value,
    module_id: &str,
) -> (Value, Vec<Issue>, Vec<Issue>) {
    if !manifest.is_object() {
        return (
            Value::Null,
            vec![Issue::root("MANIFEST_INVALID", "manifest must be an object")],
            Vec::new(),
        );
    }

    let (normalized, warnings) = normalize_manifest(manifest, module_id);
    let mut errors = Vec::new();

    check_module(&normalized, &mut errors);
    check_entities(&normalized, &mut errors);
    check_views(&normalized, &mut errors);
    check_pages(&normalized, &mut errors);
    check_actions(&normalized, &mut errors);
    check_workflows(&normalized, &mut errors);
    check_triggers(&normalized, &mut errors);

    (normalized, errors, warnings)
}

fn check_module(root: &Value, errors: &mut Vec<Issue>) {
    let Some(module) = root.get("module").and_then(Value::as_object) else {
        errors.push(Issue::at("MANIFEST_MODULE_INVALID", "module section required", "module"));
        return;
    };
    if !module.get("id").is_some_and(Value::is_string) {
        errors.push(Issue::at("MANIFEST_MODULE_INVALID", "module.id must be a string", "module.id"));
    }
    if !module.get("name").is_some_and(Value::is_string) {
        errors.push(Issue::at(
            "MANIFEST_MODULE_INVALID",
            "module.name must be a string",
            "module.name",
        ));
    }
}

fn check_entities(root: &Value, errors: &mut Vec<Issue>) {
    let Some(entities) = root.get("entities").and_then(Value::as_array) else {
        return;
    };
    for (idx, entity) in entities.iter().enumerate() {
        let path = format!("entities[{idx}]");
        let Some(id) = get_str(entity, "id") else {
            errors.push(Issue::at("MANIFEST_ENTITY_INVALID", "entity.id must be a string", path));
            continue;
        };
        let Some(fields) = entity.get("fields").and_then(Value::as_array) else {
            errors.push(Issue::at(
                "MANIFEST_ENTITY_INVALID",
                "entity.fields must be a list",
                format!("{path}.fields"),
            ));
            continue;
        };
        for (field_idx, field) in fields.iter().enumerate() {
            let field_path = format!("{path}.fields[{field_idx}]");
            if get_str(field, "id").is_none() {
                errors.push(Issue::at(
                    "MANIFEST_FIELD_INVALID",
                    "field.id must be a string",
                    field_path,
                ));
                continue;
            }
            let field_type = get_str(field, "type").unwrap_or_default();
            if !FIELD_TYPES.contains(&field_type) {
                errors.push(
                    Issue::at(
                        "MANIFEST_FIELD_TYPE_INVALID",
                        format!("unknown field type: {field_type}"),
                        format!("{field_path}.type"),
                    )
                    .with_detail(serde_json::json!({"entity": id})),
                );
            }
        }
    }
}

fn entity_ids(root: &Value) -> Vec<&str> {
    root.get("entities")
        .and_then(Value::as_array)
        .map(|entities| ids_of(entities).collect())
        .unwrap_or_default()
}

fn check_views(root: &Value, errors: &mut Vec<Issue>) {
    let known_entities = entity_ids(root);
    let Some(views) = root.get("views").and_then(Value::as_array) else {
        return;
    };
    for (idx, view) in views.iter().enumerate() {
        let path = format!("views[{idx}]");
        if get_str(view, "id").is_none() {
            errors.push(Issue::at("MANIFEST_VIEW_INVALID", "view.id must be a string", path));
            continue;
        }
        let kind = get_str(view, "kind").unwrap_or_default();
        if kind != "list" && kind != "form" {
            errors.push(Issue::at(
                "MANIFEST_VIEW_KIND_INVALID",
                format!("view.kind must be list or form, got {kind:?}"),
                format!("{path}.kind"),
            ));
        }
        match get_str(view, "entity") {
            Some(entity) if known_entities.contains(&entity) => {}
            Some(entity) => errors.push(Issue::at(
                "MANIFEST_VIEW_ENTITY_UNKNOWN",
                format!("view references unknown entity {entity}"),
                format!("{path}.entity"),
            )),
            None => errors.push(Issue::at(
                "MANIFEST_VIEW_INVALID",
                "view.entity must be a string",
                format!("{path}.entity"),
            )),
        }
    }
}

fn check_pages(root: &Value, errors: &mut Vec<Issue>) {
    let Some(pages) = root.get("pages").and_then(Value::as_array) else {
        return;
    };
    for (idx, page) in pages.iter().enumerate() {
        let path = format!("pages[{idx}]");
        if get_str(page, "id").is_none() {
            errors.push(Issue::at("MANIFEST_PAGE_INVALID", "page.id must be a string", path));
            continue;
        }
        if !page.get("content").is_some_and(Value::is_array) {
            errors.push(Issue::at(
                "MANIFEST_PAGE_INVALID",
                "page.content must be a list",
                format!("{path}.content"),
            ));
        }
    }
}

fn check_actions(root: &Value, errors: &mut Vec<Issue>) {
    let Some(actions) = root.get("actions").and_then(Value::as_array) else {
        return;
    };
    for (idx, action) in actions.iter().enumerate() {
        let path = format!("actions[{idx}]");
        if get_str(action, "id").is_none() {
            errors.push(Issue::at("MANIFEST_ACTION_INVALID", "action.id must be a string", path));
            continue;
        }
        let kind = get_str(action, "kind").unwrap_or_default();
        if !ACTION_KINDS.contains(&kind) {
            errors.push(Issue::at(
                "MANIFEST_ACTION_KIND_INVALID",
                format!("unknown action kind: {kind}"),
                format!("{path}.kind"),
            ));
            continue;
        }
        // Write actions may target entities declared by other modules, so
        // only the presence of the binding is checked here; resolution
        // happens at execution time.
        if matches!(kind, "create_record" | "update_record" | "bulk_update")
            && get_str(action, "entity_id").is_none()
        {
            errors.push(Issue::at(
                "MANIFEST_ACTION_INVALID",
                "write actions require entity_id",
                format!("{path}.entity_id"),
            ));
        }
    }
}

fn check_workflows(root: &Value, errors: &mut Vec<Issue>) {
    let Some(workflows) = root.get("workflows").and_then(Value::as_array) else {
        return;
    };
    let entities = root.get("entities").and_then(Value::as_array);
    for (idx, workflow) in workflows.iter().enumerate() {
        let path = format!("workflows[{idx}]");
        let Some(entity_id) = get_str(workflow, "entity") else {
            errors.push(Issue::at(
                "MANIFEST_WORKFLOW_INVALID",
                "workflow.entity must be a string",
                format!("{path}.entity"),
            ));
            continue;
        };
        let Some(status_field) = get_str(workflow, "status_field") else {
            errors.push(Issue::at(
                "MANIFEST_WORKFLOW_INVALID",
                "workflow.status_field must be a string",
                format!("{path}.status_field"),
            ));
            continue;
        };
        let entity = entities.and_then(|list| {
            list.iter().find(|e| get_str(e, "id") == Some(entity_id))
        });
        let Some(entity) = entity else {
            errors.push(Issue::at(
                "MANIFEST_WORKFLOW_INVALID",
                format!("workflow references unknown entity {entity_id}"),
                format!("{path}.entity"),
            ));
            continue;
        };
        let field_exists = entity
            .get("fields")
            .and_then(Value::as_array)
            .is_some_and(|fields| ids_of(fields).any(|id| id == status_field));
        if !field_exists {
            errors.push(Issue::at(
                "MANIFEST_WORKFLOW_INVALID",
                format!("status_field {status_field} not found on {entity_id}"),
                format!("{path}.status_field"),
            ));
        }
    }
}

fn check_triggers(root: &Value, errors: &mut Vec<Issue>) {
    let Some(triggers) = root.get("triggers").and_then(Value::as_array) else {
        return;
    };
    for (idx, trigger) in triggers.iter().enumerate() {
        let path = format!("triggers[{idx}]");
        if get_str(trigger, "id").is_none() {
            errors.push(Issue::at("MANIFEST_TRIGGER_INVALID", "trigger.id must be a string", path));
            continue;
        }
        let event = get_str(trigger, "event").unwrap_or_default();
        if !TRIGGER_EVENTS.contains(&event) {
            errors.push(Issue::at(
                "MANIFEST_TRIGGER_EVENT_INVALID",
                format!("unknown trigger event: {event}"),
                format!("{path}.event"),
            ));
        }
    }
}
