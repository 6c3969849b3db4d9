// SPDX-License-Identifier: MIT OR Apache-2.0
//! Design lint: advisory warnings about manifests that validate but read
//! poorly in the product.

use crate::issue::Issue;
use crate::util::{get_str, ids_of};
use serde_json::Value;

/// Run the design lint over a normalized manifest. All results are
/// advisory.
#[must_use]
pub fn design_lint(root: &Value) -> Vec<Issue> {
    let mut warnings = Vec::new();

    lint_views(root, &mut warnings);
    lint_workflow_actions(root, &mut warnings);
    lint_redundant_containers(root, &mut warnings);

    warnings
}

fn lint_views(root: &Value, warnings: &mut Vec<Issue>) {
    let entities = root.get("entities").and_then(Value::as_array);
    let Some(views) = root.get("views").and_then(Value::as_array) else {
        return;
    };

    for (idx, view) in views.iter().enumerate() {
        let path = format!("views[{idx}]");
        match get_str(view, "kind") {
            Some("form") => {
                let section_fields: Vec<&str> = view
                    .get("sections")
                    .and_then(Value::as_array)
                    .map(|sections| {
                        sections
                            .iter()
                            .filter_map(|s| s.get("fields").and_then(Value::as_array))
                            .flatten()
                            .filter_map(Value::as_str)
                            .collect()
                    })
                    .unwrap_or_default();
                if section_fields.is_empty() {
                    warnings.push(Issue::at(
                        "DESIGN_EMPTY_FORM",
                        "form has no fields in any section",
                        path.clone(),
                    ));
                }

                // Required entity fields absent from the form force users
                // into validation dead ends.
                let entity_id = get_str(view, "entity");
                let missing_required: Vec<String> = entities
                    .and_then(|entities| {
                        entities.iter().find(|e| get_str(e, "id") == entity_id)
                    })
                    .and_then(|entity| entity.get("fields").and_then(Value::as_array))
                    .map(|fields| {
                        fields
                            .iter()
                            .filter(|f| {
                                f.get("required").and_then(Value::as_bool).unwrap_or(false)
                                    && !f.get("readonly").and_then(Value::as_bool).unwrap_or(false)
                            })
                            .filter_map(|f| get_str(f, "id"))
                            .filter(|id| !section_fields.contains(id))
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                if !missing_required.is_empty() {
                    warnings.push(
                        Issue::at(
                            "DESIGN_FORM_MISSING_REQUIRED",
                            "form omits required fields",
                            path.clone(),
                        )
                        .with_detail(serde_json::json!({"fields": missing_required})),
                    );
                }
            }
            Some("list") => {
                let column_count = view
                    .get("columns")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                if column_count < 2 {
                    warnings.push(Issue::at(
                        "DESIGN_LIST_FEW_COLUMNS",
                        "list has fewer than two columns",
                        format!("{path}.columns"),
                    ));
                }
            }
            _ => {}
        }
    }
}

fn lint_workflow_actions(root: &Value, warnings: &mut Vec<Issue>) {
    let action_ids: Vec<&str> = root
        .get("actions")
        .and_then(Value::as_array)
        .map(|actions| ids_of(actions).collect())
        .unwrap_or_default();
    let Some(workflows) = root.get("workflows").and_then(Value::as_array) else {
        return;
    };
    for (idx, workflow) in workflows.iter().enumerate() {
        let Some(entity_id) = get_str(workflow, "entity") else {
            continue;
        };
        let slug = crate::util::entity_slug(entity_id);
        let has_status_action = action_ids
            .iter()
            .any(|id| id.starts_with(&format!("action.{slug}_set_")));
        if !has_status_action {
            warnings.push(Issue::at(
                "DESIGN_WORKFLOW_NO_STATUS_ACTIONS",
                format!("workflow on {entity_id} has no status actions"),
                format!("workflows[{idx}]"),
            ));
        }
    }
}

fn lint_redundant_containers(root: &Value, warnings: &mut Vec<Issue>) {
    fn walk(content: &Value, path: &str, warnings: &mut Vec<Issue>) {
        let Some(blocks) = content.as_array() else {
            return;
        };
        for (idx, block) in blocks.iter().enumerate() {
            let block_path = format!("{path}[{idx}]");
            if get_str(block, "kind") == Some("container") {
                let children = block.get("content").and_then(Value::as_array);
                let single_view_child = children.is_some_and(|children| {
                    children.len() == 1 && get_str(&children[0], "kind") == Some("view")
                });
                if single_view_child {
                    warnings.push(Issue::at(
                        "DESIGN_REDUNDANT_CONTAINER",
                        "container wraps a single view",
                        block_path.clone(),
                    ));
                }
            }
            if let Some(nested) = block.get("content") {
                walk(nested, &format!("{block_path}.content"), warnings);
            }
        }
    }

    let Some(pages) = root.get("pages").and_then(Value::as_array) else {
        return;
    };
    for (idx, page) in pages.iter().enumerate() {
        if let Some(content) = page.get("content") {
            walk(content, &format!("pages[{idx}].content"), warnings);
        }
    }
}
