// SPDX-License-Identifier: MIT OR Apache-2.0
//! Strict structural validation.
//!
//! Enforces the namespacing and reference discipline the runtime relies on.
//! Any strict error refuses install even when the raw validator passed.

use crate::issue::Issue;
use crate::util::{entity_slug, get_str, ids_of};
use serde_json::Value;

/// Run the strict validator over a normalized manifest.
#[must_use]
pub fn strict_validate(root: &Value) -> Vec<Issue> {
    let mut errors = Vec::new();
    let Some(map) = root.as_object() else {
        errors.push(Issue::root("STRICT_MANIFEST_INVALID", "manifest must be an object"));
        return errors;
    };

    for key in map.keys() {
        if key.contains('.') {
            errors.push(Issue::at(
                "STRICT_TOP_LEVEL_KEY",
                format!("top-level key {key:?} must not contain dots"),
                key.clone(),
            ));
        }
    }

    check_entities(root, &mut errors);
    check_views(root, &mut errors);
    check_pages(root, &mut errors);
    check_app(root, &mut errors);

    errors
}

fn check_entities(root: &Value, errors: &mut Vec<Issue>) {
    let Some(entities) = root.get("entities").and_then(Value::as_array) else {
        return;
    };
    for (idx, entity) in entities.iter().enumerate() {
        let path = format!("entities[{idx}]");
        let Some(id) = get_str(entity, "id") else {
            continue;
        };
        if !id.starts_with("entity.") {
            errors.push(Issue::at(
                "STRICT_ENTITY_ID",
                format!("entity id {id:?} must start with \"entity.\""),
                format!("{path}.id"),
            ));
            continue;
        }
        let slug = entity_slug(id);
        let prefix = format!("{slug}.");
        let fields = entity.get("fields").and_then(Value::as_array);
        if let Some(fields) = fields {
            for (field_idx, field) in fields.iter().enumerate() {
                let Some(field_id) = get_str(field, "id") else {
                    continue;
                };
                if !field_id.starts_with(&prefix) {
                    errors.push(Issue::at(
                        "STRICT_FIELD_ID",
                        format!("field id {field_id:?} must be namespaced {prefix}*"),
                        format!("{path}.fields[{field_idx}].id"),
                    ));
                }
            }
        }
        if let Some(display_field) = get_str(entity, "display_field") {
            let exists = fields.is_some_and(|f| ids_of(f).any(|id| id == display_field));
            if !exists {
                errors.push(Issue::at(
                    "STRICT_DISPLAY_FIELD",
                    format!("display_field {display_field:?} does not exist"),
                    format!("{path}.display_field"),
                ));
            }
        } else {
            errors.push(Issue::at(
                "STRICT_DISPLAY_FIELD",
                "display_field is required",
                format!("{path}.display_field"),
            ));
        }
    }
}

fn check_views(root: &Value, errors: &mut Vec<Issue>) {
    let entity_ids: Vec<&str> = root
        .get("entities")
        .and_then(Value::as_array)
        .map(|entities| ids_of(entities).collect())
        .unwrap_or_default();
    let Some(views) = root.get("views").and_then(Value::as_array) else {
        return;
    };
    for (idx, view) in views.iter().enumerate() {
        let path = format!("views[{idx}]");
        if get_str(view, "kind").is_none() {
            errors.push(Issue::at(
                "STRICT_VIEW_KIND",
                "view.kind is required",
                format!("{path}.kind"),
            ));
        }
        match get_str(view, "entity") {
            Some(entity) if entity_ids.contains(&entity) => {}
            Some(entity) => errors.push(Issue::at(
                "STRICT_VIEW_ENTITY",
                format!("view entity {entity:?} does not exist"),
                format!("{path}.entity"),
            )),
            None => errors.push(Issue::at(
                "STRICT_VIEW_ENTITY",
                "view.entity is required",
                format!("{path}.entity"),
            )),
        }
    }
}

fn collect_view_targets<'a>(content: &'a Value, out: &mut Vec<(String, &'a str)>, path: String) {
    let Some(blocks) = content.as_array() else {
        return;
    };
    for (idx, block) in blocks.iter().enumerate() {
        let block_path = format!("{path}[{idx}]");
        if get_str(block, "kind") == Some("view") {
            if let Some(target) = get_str(block, "target") {
                out.push((format!("{block_path}.target"), target));
            }
        }
        if let Some(nested) = block.get("content") {
            collect_view_targets(nested, out, format!("{block_path}.content"));
        }
    }
}

fn check_pages(root: &Value, errors: &mut Vec<Issue>) {
    let view_ids: Vec<&str> = root
        .get("views")
        .and_then(Value::as_array)
        .map(|views| ids_of(views).collect())
        .unwrap_or_default();
    let Some(pages) = root.get("pages").and_then(Value::as_array) else {
        return;
    };
    for (idx, page) in pages.iter().enumerate() {
        let path = format!("pages[{idx}]");
        if get_str(page, "layout").is_none() {
            errors.push(Issue::at(
                "STRICT_PAGE_LAYOUT",
                "page.layout is required",
                format!("{path}.layout"),
            ));
        }
        let Some(content) = page.get("content") else {
            errors.push(Issue::at(
                "STRICT_PAGE_CONTENT",
                "page.content must be a list",
                format!("{path}.content"),
            ));
            continue;
        };
        if !content.is_array() {
            errors.push(Issue::at(
                "STRICT_PAGE_CONTENT",
                "page.content must be a list",
                format!("{path}.content"),
            ));
            continue;
        }

        let mut targets = Vec::new();
        collect_view_targets(content, &mut targets, format!("{path}.content"));
        for (target_path, target) in targets {
            let Some(view_id) = target.strip_prefix("view:") else {
                errors.push(Issue::at(
                    "STRICT_VIEW_TARGET",
                    format!("view target {target:?} must use the \"view:\" prefix"),
                    target_path,
                ));
                continue;
            };
            if !view_ids.contains(&view_id) {
                errors.push(Issue::at(
                    "STRICT_VIEW_TARGET",
                    format!("view target {view_id:?} does not exist"),
                    target_path,
                ));
            }
        }
    }
}

fn check_app(root: &Value, errors: &mut Vec<Issue>) {
    let page_ids: Vec<&str> = root
        .get("pages")
        .and_then(Value::as_array)
        .map(|pages| ids_of(pages).collect())
        .unwrap_or_default();
    let Some(app) = root.get("app").and_then(Value::as_object) else {
        return;
    };

    match app.get("home").and_then(Value::as_str) {
        Some(home) => {
            let valid = home
                .strip_prefix("page:")
                .is_some_and(|page_id| page_ids.contains(&page_id));
            if !valid {
                errors.push(Issue::at(
                    "STRICT_APP_HOME",
                    format!("app.home {home:?} does not point at an existing page"),
                    "app.home",
                ));
            }
        }
        None => errors.push(Issue::at("STRICT_APP_HOME", "app.home is required", "app.home")),
    }

    let Some(nav) = app.get("nav").and_then(Value::as_array) else {
        return;
    };
    for (group_idx, group) in nav.iter().enumerate() {
        let Some(items) = group.get("items").and_then(Value::as_array) else {
            continue;
        };
        for (item_idx, item) in items.iter().enumerate() {
            let Some(to) = get_str(item, "to") else {
                continue;
            };
            let valid = to
                .strip_prefix("page:")
                .is_some_and(|page_id| page_ids.contains(&page_id));
            if !valid {
                errors.push(Issue::at(
                    "STRICT_NAV_TARGET",
                    format!("nav target {to:?} does not point at an existing page"),
                    format!("app.nav[{group_idx}].items[{item_idx}].to"),
                ));
            }
        }
    }
}
