// SPDX-License-Identifier: MIT OR Apache-2.0
//! Completeness checking: every entity must be reachable through a working
//! list page and form page, and nothing should dangle.
//!
//! Runs only when the raw and strict validators produced no errors.

use crate::issue::Issue;
use crate::util::{entity_slug, get_str};
use serde_json::Value;
use std::collections::BTreeSet;

/// Check a normalized manifest for completeness. Hard problems are errors;
/// orphan views and unreachable pages are warnings.
#[must_use]
pub fn completeness_check(root: &Value) -> Vec<Issue> {
    let mut issues = Vec::new();

    let pages = root.get("pages").and_then(Value::as_array);
    let views = root.get("views").and_then(Value::as_array);

    if let Some(entities) = root.get("entities").and_then(Value::as_array) {
        for entity in entities {
            let Some(entity_id) = get_str(entity, "id") else {
                continue;
            };
            let slug = entity_slug(entity_id);
            check_entity_pages(root, entity_id, slug, &mut issues);
        }
    }

    // Orphan views: not targeted by any page block.
    if let (Some(pages), Some(views)) = (pages, views) {
        let mut targeted: BTreeSet<&str> = BTreeSet::new();
        for page in pages {
            if let Some(content) = page.get("content") {
                collect_targets(content, &mut targeted);
            }
        }
        for (idx, view) in views.iter().enumerate() {
            let Some(view_id) = get_str(view, "id") else {
                continue;
            };
            if !targeted.contains(view_id) {
                issues.push(Issue::at(
                    "INCOMPLETE_ORPHAN_VIEW",
                    format!("view {view_id:?} is not referenced by any page"),
                    format!("views[{idx}]"),
                ));
            }
        }
    }

    // Unreachable pages: not reachable from home, nav, defaults, or any
    // reachable list view's open_record target.
    if let Some(pages) = pages {
        let reachable = reachable_pages(root);
        for (idx, page) in pages.iter().enumerate() {
            let Some(page_id) = get_str(page, "id") else {
                continue;
            };
            if !reachable.contains(page_id) {
                issues.push(Issue::at(
                    "INCOMPLETE_ORPHAN_PAGE",
                    format!("page {page_id:?} is unreachable"),
                    format!("pages[{idx}]"),
                ));
            }
        }
    }

    issues
}

fn check_entity_pages(root: &Value, entity_id: &str, slug: &str, issues: &mut Vec<Issue>) {
    let list_page_id = format!("{slug}.list_page");
    let form_page_id = format!("{slug}.form_page");
    let list_view = format!("view:{slug}.list");
    let form_view = format!("view:{slug}.form");

    let pages = root.get("pages").and_then(Value::as_array);
    let find_page = |id: &str| {
        pages.and_then(|pages| pages.iter().find(|page| get_str(page, "id") == Some(id)))
    };

    match find_page(&list_page_id) {
        None => issues.push(
            Issue::at(
                "INCOMPLETE_ENTITY_PAGES",
                format!("entity {entity_id} is missing its list page"),
                "pages",
            )
            .with_detail(serde_json::json!({"expected": list_page_id})),
        ),
        Some(page) => {
            if !page_targets_view(page, &list_view) {
                issues.push(Issue::at(
                    "INCOMPLETE_PAGE_VIEW",
                    format!("page {list_page_id} does not include {list_view}"),
                    "pages",
                ));
            }
        }
    }

    match find_page(&form_page_id) {
        None => issues.push(
            Issue::at(
                "INCOMPLETE_ENTITY_PAGES",
                format!("entity {entity_id} is missing its form page"),
                "pages",
            )
            .with_detail(serde_json::json!({"expected": form_page_id})),
        ),
        Some(page) => {
            if !page_targets_view(page, &form_view) {
                issues.push(Issue::at(
                    "INCOMPLETE_PAGE_VIEW",
                    format!("page {form_page_id} does not include {form_view}"),
                    "pages",
                ));
            }
            if !page_has_record_block(page, entity_id) {
                issues.push(Issue::at(
                    "INCOMPLETE_FORM_RECORD_BLOCK",
                    format!("page {form_page_id} needs a record block bound to {entity_id}"),
                    "pages",
                ));
            }
        }
    }
}

fn collect_targets<'a>(content: &'a Value, out: &mut BTreeSet<&'a str>) {
    let Some(blocks) = content.as_array() else {
        return;
    };
    for block in blocks {
        if get_str(block, "kind") == Some("view") {
            if let Some(view_id) = get_str(block, "target").and_then(|t| t.strip_prefix("view:")) {
                out.insert(view_id);
            }
        }
        if let Some(nested) = block.get("content") {
            collect_targets(nested, out);
        }
    }
}

fn page_targets_view(page: &Value, target: &str) -> bool {
    let mut targets = BTreeSet::new();
    if let Some(content) = page.get("content") {
        collect_targets(content, &mut targets);
    }
    target
        .strip_prefix("view:")
        .is_some_and(|view_id| targets.contains(view_id))
}

fn page_has_record_block(page: &Value, entity_id: &str) -> bool {
    fn walk(content: &Value, entity_id: &str) -> bool {
        let Some(blocks) = content.as_array() else {
            return false;
        };
        blocks.iter().any(|block| {
            (get_str(block, "kind") == Some("record")
                && get_str(block, "entity_id") == Some(entity_id))
                || block
                    .get("content")
                    .is_some_and(|nested| walk(nested, entity_id))
        })
    }
    page.get("content").is_some_and(|c| walk(c, entity_id))
}

/// Pages reachable via nav, home, app defaults, and list `open_record`
/// targets of views embedded in already-reachable pages.
fn reachable_pages(root: &Value) -> BTreeSet<String> {
    let mut reachable: BTreeSet<String> = BTreeSet::new();
    let mut frontier: Vec<String> = Vec::new();

    let mut push_ref = |reference: &str, frontier: &mut Vec<String>| {
        if let Some(page_id) = reference.strip_prefix("page:") {
            frontier.push(page_id.to_string());
        }
    };

    if let Some(app) = root.get("app").and_then(Value::as_object) {
        if let Some(home) = app.get("home").and_then(Value::as_str) {
            push_ref(home, &mut frontier);
        }
        if let Some(nav) = app.get("nav").and_then(Value::as_array) {
            for group in nav {
                if let Some(items) = group.get("items").and_then(Value::as_array) {
                    for item in items {
                        if let Some(to) = get_str(item, "to") {
                            push_ref(to, &mut frontier);
                        }
                    }
                }
            }
        }
        if let Some(entities) = app
            .get("defaults")
            .and_then(|d| d.get("entities"))
            .and_then(Value::as_object)
        {
            for entry in entities.values() {
                for key in ["entity_form_page", "entity_home_page"] {
                    if let Some(reference) = entry.get(key).and_then(Value::as_str) {
                        push_ref(reference, &mut frontier);
                    }
                }
            }
        }
    }

    let pages = root.get("pages").and_then(Value::as_array);
    let views = root.get("views").and_then(Value::as_array);

    while let Some(page_id) = frontier.pop() {
        if !reachable.insert(page_id.clone()) {
            continue;
        }
        let Some(page) = pages.and_then(|pages| {
            pages.iter().find(|p| get_str(p, "id") == Some(page_id.as_str()))
        }) else {
            continue;
        };
        let mut targets = BTreeSet::new();
        if let Some(content) = page.get("content") {
            collect_targets(content, &mut targets);
        }
        for view_id in targets {
            let Some(view) = views.and_then(|views| {
                views.iter().find(|v| get_str(v, "id") == Some(view_id))
            }) else {
                continue;
            };
            if let Some(to) = view
                .get("open_record")
                .and_then(|o| o.get("to"))
                .and_then(Value::as_str)
            {
                if let Some(target) = to.strip_prefix("page:") {
                    frontier.push(target.to_string());
                }
            }
        }
    }

    reachable
}
