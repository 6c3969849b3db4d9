// SPDX-License-Identifier: MIT OR Apache-2.0
//! Manifest normalization.
//!
//! A deterministic transform that fills defaults — baseline views and pages
//! per entity, nav wiring, enum options, workflow status actions, view
//! headers — before the validators run. The transform is a fixed point:
//! applying it to its own output yields a byte-identical manifest.

use crate::issue::Issue;
use crate::util::{
    canonical_entity_id, ensure_array, ensure_object, entity_slug, get_str, ids_of, index_by_id,
    title_case,
};
use serde_json::{Map, Value, json};

/// Field types that participate in column seeding, ordered by priority.
fn type_priority(field_type: &str) -> usize {
    match field_type {
        "string" => 0,
        "text" => 1,
        "enum" => 2,
        "date" => 3,
        "datetime" => 4,
        "lookup" => 5,
        "number" => 6,
        "boolean" => 7,
        _ => 8,
    }
}

/// Lifecycle-like status fields end in `.status`, `.state`, or `.stage`.
fn is_lifecycle_field(field_id: &str) -> bool {
    field_id.ends_with(".status") || field_id.ends_with(".state") || field_id.ends_with(".stage")
}

/// Snapshot of an entity taken between passes.
struct EntityInfo {
    id: String,
    slug: String,
    label: String,
    display_field: String,
    fields: Vec<FieldInfo>,
}

struct FieldInfo {
    id: String,
    field_type: String,
    required: bool,
    readonly: bool,
}

fn snapshot_entities(root: &Map<String, Value>) -> Vec<EntityInfo> {
    let mut out = Vec::new();
    let Some(entities) = root.get("entities").and_then(Value::as_array) else {
        return out;
    };
    for entity in entities {
        let Some(id) = get_str(entity, "id") else {
            continue;
        };
        let slug = entity_slug(id).to_string();
        let label = get_str(entity, "label")
            .map(String::from)
            .unwrap_or_else(|| title_case(&slug));
        let display_field = get_str(entity, "display_field")
            .map(String::from)
            .unwrap_or_else(|| format!("{slug}.name"));
        let fields = entity
            .get("fields")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|field| {
                        Some(FieldInfo {
                            id: get_str(field, "id")?.to_string(),
                            field_type: get_str(field, "type").unwrap_or("string").to_string(),
                            required: field.get("required").and_then(Value::as_bool).unwrap_or(false),
                            readonly: field.get("readonly").and_then(Value::as_bool).unwrap_or(false),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.push(EntityInfo {
            id: id.to_string(),
            slug,
            label,
            display_field,
            fields,
        });
    }
    out
}

impl EntityInfo {
    fn required_writable(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields
            .iter()
            .filter(|f| f.required && !f.readonly && f.field_type != "uuid")
    }

    /// A required field with no default in `defaults` forces form-first
    /// creation.
    fn has_required_without_default(&self, defaults: &Map<String, Value>) -> bool {
        self.required_writable()
            .any(|f| !defaults.contains_key(&f.id))
    }
}

/// Normalize `manifest` for `module_id`, returning the normalized tree and
/// advisory warnings.
#[must_use]
pub fn normalize_manifest(manifest: &Value, module_id: &str) -> (Value, Vec<Issue>) {
    let mut warnings = Vec::new();
    let mut root = match manifest {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    sanitize(&mut root, &mut warnings);
    ensure_module_and_home(&mut root, module_id);
    normalize_lookups(&mut root, &mut warnings);
    normalize_relations(&mut root, &mut warnings);
    force_system_id_fields(&mut root);
    baseline_scaffolds(&mut root);
    normalize_workflows(&mut root, &mut warnings);
    backfill_enum_options(&mut root, &mut warnings);
    normalize_view_headers(&mut root, &mut warnings);
    ensure_status_actions(&mut root);
    enforce_architecture(&mut root);

    (Value::Object(root), warnings)
}

// ---------------------------------------------------------------------------
// Pass 1 — sanitize
// ---------------------------------------------------------------------------

/// Hoist dotted top-level keys into their section objects, rewrite the block
/// `type` synonym to `kind`, and canonicalize view-block targets to the
/// `view:` prefix.
fn sanitize(root: &mut Map<String, Value>, _warnings: &mut Vec<Issue>) {
    let dotted: Vec<String> = root
        .keys()
        .filter(|k| k.contains('.'))
        .cloned()
        .collect();
    for key in dotted {
        let value = root.remove(&key).unwrap_or(Value::Null);
        if let Some((section, rest)) = key.split_once('.') {
            let section = section.to_string();
            let rest = rest.to_string();
            ensure_object(root, &section).insert(rest, value);
        }
    }

    if let Some(pages) = root.get_mut("pages").and_then(Value::as_array_mut) {
        for page in pages {
            if let Some(content) = page.get_mut("content") {
                sanitize_blocks(content);
            }
        }
    }
}

fn sanitize_blocks(content: &mut Value) {
    let Some(blocks) = content.as_array_mut() else {
        return;
    };
    for block in blocks {
        let Some(map) = block.as_object_mut() else {
            continue;
        };
        if !map.contains_key("kind") {
            if let Some(kind) = map.remove("type") {
                map.insert("kind".into(), kind);
            }
        } else {
            map.remove("type");
        }
        if map.get("kind").and_then(Value::as_str) == Some("view") {
            if let Some(target) = map.get("target").and_then(Value::as_str) {
                if !target.starts_with("view:") {
                    let prefixed = format!("view:{target}");
                    map.insert("target".into(), Value::String(prefixed));
                }
            }
        }
        if let Some(nested) = map.get_mut("content") {
            sanitize_blocks(nested);
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 2 — module id & home
// ---------------------------------------------------------------------------

fn page_ref_is_valid(root: &Map<String, Value>, reference: &str) -> bool {
    let Some(page_id) = reference.strip_prefix("page:") else {
        return false;
    };
    root.get("pages")
        .and_then(Value::as_array)
        .is_some_and(|pages| ids_of(pages).any(|id| id == page_id))
}

fn ensure_home(root: &mut Map<String, Value>) {
    let home = root
        .get("app")
        .and_then(|app| app.get("home"))
        .and_then(Value::as_str)
        .map(String::from);
    let valid = home.as_deref().is_some_and(|h| page_ref_is_valid(root, h));
    if !valid {
        let first_page = root
            .get("pages")
            .and_then(Value::as_array)
            .and_then(|pages| ids_of(pages).next().map(String::from));
        if let Some(page_id) = first_page {
            ensure_object(root, "app").insert("home".into(), json!(format!("page:{page_id}")));
        }
    }
}

fn ensure_module_and_home(root: &mut Map<String, Value>, module_id: &str) {
    let module = ensure_object(root, "module");
    module.insert("id".into(), json!(module_id));
    if !module.get("name").is_some_and(Value::is_string) {
        module.insert("name".into(), json!(title_case(module_id)));
    }
    ensure_home(root);
}

// ---------------------------------------------------------------------------
// Pass 3 — lookup fields
// ---------------------------------------------------------------------------

fn normalize_lookups(root: &mut Map<String, Value>, warnings: &mut Vec<Issue>) {
    let mut targets_in_manifest: Vec<(String, String)> = Vec::new(); // (target, display default)

    if let Some(entities) = root.get_mut("entities").and_then(Value::as_array_mut) {
        for (entity_idx, entity) in entities.iter_mut().enumerate() {
            let Some(fields) = entity.get_mut("fields").and_then(Value::as_array_mut) else {
                continue;
            };
            for (field_idx, field) in fields.iter_mut().enumerate() {
                let Some(map) = field.as_object_mut() else {
                    continue;
                };
                if map.get("type").and_then(Value::as_str) != Some("lookup") {
                    continue;
                }
                let raw_target = ["entity", "target", "entity_id"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(Value::as_str).map(String::from));
                let Some(raw_target) = raw_target else {
                    continue;
                };
                let canonical = canonical_entity_id(&raw_target);
                let changed = map.get("entity").and_then(Value::as_str) != Some(canonical.as_str())
                    || map.contains_key("target")
                    || map.contains_key("entity_id");
                map.remove("target");
                map.remove("entity_id");
                map.insert("entity".into(), Value::String(canonical.clone()));
                let target_slug = entity_slug(&canonical).to_string();
                if !map.get("display_field").is_some_and(Value::is_string) {
                    map.insert("display_field".into(), json!(format!("{target_slug}.name")));
                }
                if changed {
                    warnings.push(Issue::at(
                        "NORMALIZED_LOOKUP",
                        "lookup target rewritten to canonical form",
                        format!("entities[{entity_idx}].fields[{field_idx}]"),
                    ));
                }
                targets_in_manifest.push((canonical, target_slug));
            }
        }
    }

    // Referenced in-manifest targets must expose id and name fields.
    if let Some(entities) = root.get_mut("entities").and_then(Value::as_array_mut) {
        for (target, slug) in targets_in_manifest {
            let Some(idx) = index_by_id(entities, &target) else {
                continue;
            };
            let Some(entity) = entities[idx].as_object_mut() else {
                continue;
            };
            let fields = ensure_array(entity, "fields");
            let id_field = format!("{slug}.id");
            if index_by_id(fields, &id_field).is_none() {
                fields.push(json!({
                    "id": id_field,
                    "type": "uuid",
                    "label": "Id",
                    "readonly": true,
                    "required": false,
                }));
            }
            let name_field = format!("{slug}.name");
            if index_by_id(fields, &name_field).is_none() {
                fields.push(json!({
                    "id": name_field,
                    "type": "string",
                    "label": "Name",
                }));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 4 — relations
// ---------------------------------------------------------------------------

fn normalize_relations(root: &mut Map<String, Value>, warnings: &mut Vec<Issue>) {
    let Some(relations) = root.get_mut("relations").and_then(Value::as_array_mut) else {
        return;
    };
    let mut kept = Vec::with_capacity(relations.len());
    for (idx, relation) in relations.drain(..).enumerate() {
        let Some(mut map) = relation.as_object().cloned() else {
            warnings.push(Issue::at(
                "RELATION_DROPPED",
                "relation must be an object",
                format!("relations[{idx}]"),
            ));
            continue;
        };
        for (legacy, canonical) in [("from_field", "from"), ("to_field", "to")] {
            if !map.contains_key(canonical) {
                if let Some(value) = map.remove(legacy) {
                    map.insert(canonical.into(), value);
                }
            } else {
                map.remove(legacy);
            }
        }
        let well_formed =
            map.get("from").is_some_and(Value::is_string) && map.get("to").is_some_and(Value::is_string);
        if well_formed {
            kept.push(Value::Object(map));
        } else {
            warnings.push(Issue::at(
                "RELATION_DROPPED",
                "relation requires from and to field ids",
                format!("relations[{idx}]"),
            ));
        }
    }
    *relations = kept;
}

// ---------------------------------------------------------------------------
// Pass 5 — system id fields
// ---------------------------------------------------------------------------

fn force_system_id_fields(root: &mut Map<String, Value>) {
    let Some(entities) = root.get_mut("entities").and_then(Value::as_array_mut) else {
        return;
    };
    for entity in entities {
        let Some(fields) = entity.get_mut("fields").and_then(Value::as_array_mut) else {
            continue;
        };
        for field in fields {
            let Some(map) = field.as_object_mut() else {
                continue;
            };
            let is_id = map
                .get("id")
                .and_then(Value::as_str)
                .is_some_and(|id| id.ends_with(".id"));
            if is_id && map.get("type").and_then(Value::as_str) == Some("uuid") {
                map.insert("readonly".into(), json!(true));
                map.insert("required".into(), json!(false));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 6 — baseline scaffolds
// ---------------------------------------------------------------------------

fn baseline_scaffolds(root: &mut Map<String, Value>) {
    let infos = snapshot_entities(root);

    for info in &infos {
        let list_view_id = format!("{}.list", info.slug);
        let form_view_id = format!("{}.form", info.slug);
        let list_page_id = format!("{}.list_page", info.slug);
        let form_page_id = format!("{}.form_page", info.slug);

        {
            let views = ensure_array(root, "views");
            if index_by_id(views, &list_view_id).is_none() {
                views.push(json!({
                    "id": list_view_id,
                    "kind": "list",
                    "entity": info.id,
                    "columns": [],
                }));
            }
            if index_by_id(views, &form_view_id).is_none() {
                views.push(json!({
                    "id": form_view_id,
                    "kind": "form",
                    "entity": info.id,
                    "sections": [],
                }));
            }

            // Seed list columns and form sections on every view bound to the
            // entity, not only the baseline ones.
            for view in views.iter_mut() {
                if get_str(view, "entity") != Some(info.id.as_str()) {
                    continue;
                }
                match get_str(view, "kind") {
                    Some("list") => seed_list_columns(view, info),
                    Some("form") => seed_form_sections(view, info),
                    _ => {}
                }
            }
        }

        {
            let pages = ensure_array(root, "pages");
            if index_by_id(pages, &list_page_id).is_none() {
                pages.push(json!({
                    "id": list_page_id,
                    "title": info.label,
                    "layout": "single",
                    "content": [{"kind": "view", "target": format!("view:{list_view_id}")}],
                }));
            }
            if index_by_id(pages, &form_page_id).is_none() {
                pages.push(json!({
                    "id": form_page_id,
                    "title": info.label,
                    "layout": "single",
                    "content": [{
                        "kind": "record",
                        "entity_id": info.id,
                        "param": "record",
                        "content": [{"kind": "view", "target": format!("view:{form_view_id}")}],
                    }],
                }));
            } else if let Some(idx) = index_by_id(pages, &form_page_id) {
                wrap_form_page_in_record_block(&mut pages[idx], info);
            }
        }
    }
}

fn seed_list_columns(view: &mut Value, info: &EntityInfo) {
    let Some(map) = view.as_object_mut() else {
        return;
    };
    let empty = map
        .get("columns")
        .and_then(Value::as_array)
        .is_none_or(|cols| cols.is_empty());
    if !empty {
        return;
    }
    let mut useful: Vec<&FieldInfo> = info
        .fields
        .iter()
        .filter(|f| {
            f.field_type != "uuid" && !f.id.ends_with("_id") && f.id != info.display_field
        })
        .collect();
    useful.sort_by_key(|f| type_priority(&f.field_type));
    let mut columns = vec![json!({"field_id": info.display_field})];
    columns.extend(useful.iter().take(3).map(|f| json!({"field_id": f.id})));
    map.insert("columns".into(), Value::Array(columns));
}

fn seed_form_sections(view: &mut Value, info: &EntityInfo) {
    let Some(map) = view.as_object_mut() else {
        return;
    };
    let sections = ensure_array(map, "sections");
    if sections.is_empty() {
        sections.push(json!({"id": "details", "title": "Details", "fields": []}));
    }
    let Some(first) = sections.first_mut().and_then(Value::as_object_mut) else {
        return;
    };
    let fields = ensure_array(first, "fields");
    if fields.is_empty() {
        let mut seeded = vec![info.display_field.clone()];
        for field in info.required_writable() {
            if field.id != info.display_field {
                seeded.push(field.id.clone());
            }
        }
        *fields = seeded.into_iter().map(Value::String).collect();
    }
    if fields.len() > 4 && !first.contains_key("layout") {
        first.insert("layout".into(), json!("columns"));
        first.insert("columns".into(), json!(2));
    }
}

fn content_has_record_block(content: &Value) -> bool {
    let Some(blocks) = content.as_array() else {
        return false;
    };
    blocks.iter().any(|block| {
        get_str(block, "kind") == Some("record")
            || block.get("content").is_some_and(content_has_record_block)
    })
}

fn wrap_form_page_in_record_block(page: &mut Value, info: &EntityInfo) {
    let Some(map) = page.as_object_mut() else {
        return;
    };
    let existing = map.get("content").cloned().unwrap_or_else(|| json!([]));
    if content_has_record_block(&existing) {
        return;
    }
    map.insert(
        "content".into(),
        json!([{
            "kind": "record",
            "entity_id": info.id,
            "param": "record",
            "content": existing,
        }]),
    );
}

// ---------------------------------------------------------------------------
// Pass 7 — workflows
// ---------------------------------------------------------------------------

fn normalize_workflows(root: &mut Map<String, Value>, warnings: &mut Vec<Issue>) {
    let Some(workflows) = root.get_mut("workflows").and_then(Value::as_array_mut) else {
        return;
    };
    let drained: Vec<Value> = workflows.drain(..).collect();

    let mut kept: Vec<Value> = Vec::with_capacity(drained.len());
    let mut seen_entities: Vec<String> = Vec::new();

    for (idx, workflow) in drained.iter().enumerate() {
        let path = format!("workflows[{idx}]");
        let Some(mut map) = workflow.as_object().cloned() else {
            warnings.push(Issue::at("WORKFLOW_DROPPED", "workflow must be an object", path));
            continue;
        };
        let entity = map.get("entity").and_then(Value::as_str).map(String::from);
        let status_field = map.get("status_field").and_then(Value::as_str).map(String::from);
        let (Some(entity), Some(status_field)) = (entity, status_field) else {
            warnings.push(Issue::at(
                "WORKFLOW_DROPPED",
                "workflow requires entity and status_field",
                path,
            ));
            continue;
        };

        if seen_entities.contains(&entity) {
            warnings.push(
                Issue::at(
                    "WORKFLOW_DROPPED",
                    "only one workflow per entity survives normalization",
                    path,
                )
                .with_detail(json!({"entity": entity})),
            );
            continue;
        }

        // Prefer a lifecycle-like workflow for the entity: if this one is not
        // lifecycle-like but a later one is, the later one wins.
        if !is_lifecycle_field(&status_field) {
            let replacement = drained[idx + 1..].iter().any(|later| {
                get_str(later, "entity") == Some(entity.as_str())
                    && get_str(later, "status_field").is_some_and(is_lifecycle_field)
            });
            if replacement {
                warnings.push(Issue::at(
                    "WORKFLOW_DROPPED",
                    "superseded by a lifecycle workflow for the same entity",
                    path,
                ));
                continue;
            }
        }

        if !map.get("id").is_some_and(Value::is_string) {
            map.insert("id".into(), json!(format!("workflow.{}", entity_slug(&entity))));
        }
        normalize_workflow_states(&mut map);
        seen_entities.push(entity);
        kept.push(Value::Object(map));
    }

    // Duplicate workflow ids pick up numeric suffixes.
    let mut used: Vec<String> = Vec::new();
    for workflow in &mut kept {
        let Some(map) = workflow.as_object_mut() else {
            continue;
        };
        let Some(id) = map.get("id").and_then(Value::as_str).map(String::from) else {
            continue;
        };
        if used.contains(&id) {
            let mut n = 2;
            let mut candidate = format!("{id}_{n}");
            while used.contains(&candidate) {
                n += 1;
                candidate = format!("{id}_{n}");
            }
            map.insert("id".into(), json!(candidate.clone()));
            used.push(candidate);
        } else {
            used.push(id);
        }
    }

    *workflows = kept;
}

fn normalize_workflow_states(map: &mut Map<String, Value>) {
    let states = ensure_array(map, "states");
    let normalized: Vec<Value> = states
        .iter()
        .filter_map(|state| match state {
            Value::String(id) => Some(json!({"id": id, "label": title_case(id)})),
            Value::Object(obj) => {
                let id = obj.get("id").and_then(Value::as_str)?;
                let mut out = obj.clone();
                if !out.get("label").is_some_and(Value::is_string) {
                    out.insert("label".into(), json!(title_case(id)));
                }
                Some(Value::Object(out))
            }
            _ => None,
        })
        .collect();
    *states = normalized;
}

// ---------------------------------------------------------------------------
// Pass 8 — enum options
// ---------------------------------------------------------------------------

fn backfill_enum_options(root: &mut Map<String, Value>, warnings: &mut Vec<Issue>) {
    // Workflow states provide options for their status field.
    let workflow_options: Vec<(String, Vec<Value>)> = root
        .get("workflows")
        .and_then(Value::as_array)
        .map(|workflows| {
            workflows
                .iter()
                .filter_map(|wf| {
                    let status_field = get_str(wf, "status_field")?.to_string();
                    let options: Vec<Value> = wf
                        .get("states")?
                        .as_array()?
                        .iter()
                        .filter_map(|state| {
                            let id = get_str(state, "id")?;
                            let label = get_str(state, "label").unwrap_or(id);
                            Some(json!({"value": id, "label": label}))
                        })
                        .collect();
                    Some((status_field, options))
                })
                .collect()
        })
        .unwrap_or_default();

    let Some(entities) = root.get_mut("entities").and_then(Value::as_array_mut) else {
        return;
    };
    for (entity_idx, entity) in entities.iter_mut().enumerate() {
        let Some(fields) = entity.get_mut("fields").and_then(Value::as_array_mut) else {
            continue;
        };
        for (field_idx, field) in fields.iter_mut().enumerate() {
            let Some(map) = field.as_object_mut() else {
                continue;
            };
            if map.get("type").and_then(Value::as_str) != Some("enum") {
                continue;
            }
            let path = format!("entities[{entity_idx}].fields[{field_idx}].options");
            let options = map.get("options").and_then(Value::as_array).cloned();

            let has_string_options = options
                .as_ref()
                .is_some_and(|opts| opts.iter().any(Value::is_string));
            if has_string_options {
                let converted: Vec<Value> = options
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|opt| match opt {
                        Value::String(s) => Some(json!({"value": s, "label": title_case(s)})),
                        Value::Object(_) => Some(opt.clone()),
                        _ => None,
                    })
                    .collect();
                map.insert("options".into(), Value::Array(converted));
                warnings.push(Issue::at(
                    "NORMALIZED_ENUM_OPTIONS",
                    "string enum options converted to value/label objects",
                    path,
                ));
                continue;
            }

            let empty = options.is_none_or(|opts| opts.is_empty());
            if empty {
                let field_id = map.get("id").and_then(Value::as_str).unwrap_or_default();
                if let Some((_, opts)) = workflow_options
                    .iter()
                    .find(|(status_field, _)| status_field == field_id)
                {
                    map.insert("options".into(), Value::Array(opts.clone()));
                    warnings.push(Issue::at(
                        "NORMALIZED_ENUM_OPTIONS",
                        "enum options materialized from workflow states",
                        path,
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 9 — view headers
// ---------------------------------------------------------------------------

fn normalize_view_headers(root: &mut Map<String, Value>, warnings: &mut Vec<Issue>) {
    let infos = snapshot_entities(root);
    let workflows: Vec<(String, String)> = root
        .get("workflows")
        .and_then(Value::as_array)
        .map(|wfs| {
            wfs.iter()
                .filter_map(|wf| {
                    Some((
                        get_str(wf, "entity")?.to_string(),
                        get_str(wf, "status_field")?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    let mut new_actions: Vec<Value> = Vec::new();
    let mut rewrite_to_open_form: Vec<(String, String)> = Vec::new(); // (action id, form view)

    if let Some(views) = root.get_mut("views").and_then(Value::as_array_mut) {
        for (view_idx, view) in views.iter_mut().enumerate() {
            let Some(entity_id) = get_str(view, "entity").map(String::from) else {
                continue;
            };
            let Some(info) = infos.iter().find(|i| i.id == entity_id) else {
                continue;
            };
            let kind = get_str(view, "kind").unwrap_or_default().to_string();
            let path = format!("views[{view_idx}].header");
            let changed = match kind.as_str() {
                "list" => normalize_list_header(view, info, &mut new_actions),
                "form" => normalize_form_header(view, info, &workflows),
                _ => false,
            };
            if changed {
                warnings.push(Issue::at(
                    "NORMALIZED_VIEW_HEADER",
                    "view header defaults applied",
                    path,
                ));
            }
        }
    }

    let actions = ensure_array(root, "actions");
    for action in new_actions {
        let id = get_str(&action, "id").unwrap_or_default().to_string();
        if index_by_id(actions, &id).is_none() {
            actions.push(action);
        }
    }

    // create_record primary actions flip to open_form when the entity has
    // required fields without defaults.
    for info in &infos {
        let action_id = format!("action.{}_new", info.slug);
        let Some(idx) = index_by_id(actions, &action_id) else {
            continue;
        };
        let Some(map) = actions[idx].as_object_mut() else {
            continue;
        };
        if map.get("kind").and_then(Value::as_str) != Some("create_record") {
            continue;
        }
        let defaults = map
            .get("defaults")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if info.has_required_without_default(&defaults) {
            rewrite_to_open_form.push((action_id, format!("{}.form", info.slug)));
        }
    }
    for (action_id, form_view) in rewrite_to_open_form {
        if let Some(idx) = index_by_id(actions, &action_id) {
            if let Some(map) = actions[idx].as_object_mut() {
                map.insert("kind".into(), json!("open_form"));
                map.insert("target".into(), json!(form_view));
                map.remove("entity_id");
                map.remove("defaults");
            }
        }
    }
}

fn normalize_list_header(view: &mut Value, info: &EntityInfo, new_actions: &mut Vec<Value>) -> bool {
    let Some(map) = view.as_object_mut() else {
        return false;
    };
    let had_header = map.get("header").is_some_and(Value::is_object);
    let header = ensure_object(map, "header");
    let mut changed = !had_header;

    if !header.contains_key("create_behavior") {
        header.insert("create_behavior".into(), json!("open_form"));
        changed = true;
    }

    if !header.get("search").is_some_and(Value::is_object) {
        let search_fields: Vec<Value> = info
            .fields
            .iter()
            .filter(|f| f.field_type == "string" || f.field_type == "text")
            .map(|f| Value::String(f.id.clone()))
            .collect();
        header.insert(
            "search".into(),
            json!({
                "enabled": true,
                "placeholder": format!("Search {}", info.label),
                "fields": search_fields,
            }),
        );
        changed = true;
    } else {
        let search = ensure_object(header, "search");
        if !search.contains_key("enabled") {
            search.insert("enabled".into(), json!(true));
            changed = true;
        }
        if !search.contains_key("placeholder") {
            search.insert("placeholder".into(), json!(format!("Search {}", info.label)));
            changed = true;
        }
        if !search.get("fields").is_some_and(Value::is_array) {
            let search_fields: Vec<Value> = info
                .fields
                .iter()
                .filter(|f| f.field_type == "string" || f.field_type == "text")
                .map(|f| Value::String(f.id.clone()))
                .collect();
            search.insert("fields".into(), Value::Array(search_fields));
            changed = true;
        }
    }

    let action_id = format!("action.{}_new", info.slug);
    let primary_missing = header
        .get("primary_actions")
        .and_then(Value::as_array)
        .is_none_or(|actions| actions.is_empty());
    if primary_missing {
        header.insert("primary_actions".into(), json!([{"action_id": action_id}]));
        changed = true;
    }
    new_actions.push(json!({
        "id": action_id,
        "kind": "create_record",
        "label": format!("New {}", info.label),
        "entity_id": info.id,
        "defaults": {},
    }));

    changed
}

fn normalize_form_header(
    view: &mut Value,
    info: &EntityInfo,
    workflows: &[(String, String)],
) -> bool {
    let section_count = view
        .get("sections")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let section_tabs: Vec<Value> = view
        .get("sections")
        .and_then(Value::as_array)
        .map(|sections| {
            sections
                .iter()
                .filter_map(|section| {
                    let id = get_str(section, "id")?;
                    let label = get_str(section, "title")
                        .map(String::from)
                        .unwrap_or_else(|| title_case(id));
                    Some(json!({"section_id": id, "label": label}))
                })
                .collect()
        })
        .unwrap_or_default();

    let Some(map) = view.as_object_mut() else {
        return false;
    };
    let had_header = map.get("header").is_some_and(Value::is_object);
    let header = ensure_object(map, "header");
    let mut changed = !had_header;

    for (key, value) in [
        ("title_field", json!(info.display_field)),
        ("auto_save", json!(true)),
        ("auto_save_debounce_ms", json!(750)),
        ("save_mode", json!("top")),
    ] {
        if !header.contains_key(key) {
            header.insert(key.into(), value);
            changed = true;
        }
    }

    // Statusbar only when the entity has exactly one workflow whose status
    // field is an enum.
    let entity_workflows: Vec<&(String, String)> =
        workflows.iter().filter(|(entity, _)| *entity == info.id).collect();
    if entity_workflows.len() == 1 && !header.contains_key("statusbar") {
        let status_field = &entity_workflows[0].1;
        let is_enum = info
            .fields
            .iter()
            .any(|f| &f.id == status_field && f.field_type == "enum");
        if is_enum {
            header.insert("statusbar".into(), json!({"field_id": status_field}));
            changed = true;
        }
    }

    if section_count >= 2 && !header.contains_key("tabs") {
        header.insert("tabs".into(), Value::Array(section_tabs));
        changed = true;
    }

    changed
}

// ---------------------------------------------------------------------------
// Pass 10 — workflow status actions
// ---------------------------------------------------------------------------

fn ensure_status_actions(root: &mut Map<String, Value>) {
    struct StatusAction {
        entity_id: String,
        slug: String,
        set_id: String,
        bulk_id: String,
        label: String,
        status_field: String,
        state_id: String,
    }

    let mut wanted: Vec<StatusAction> = Vec::new();
    if let Some(workflows) = root.get("workflows").and_then(Value::as_array) {
        for wf in workflows {
            let (Some(entity_id), Some(status_field)) =
                (get_str(wf, "entity"), get_str(wf, "status_field"))
            else {
                continue;
            };
            let slug = entity_slug(entity_id).to_string();
            let Some(states) = wf.get("states").and_then(Value::as_array) else {
                continue;
            };
            for state in states {
                let Some(state_id) = get_str(state, "id") else {
                    continue;
                };
                let label = get_str(state, "label").unwrap_or(state_id).to_string();
                wanted.push(StatusAction {
                    entity_id: entity_id.to_string(),
                    slug: slug.clone(),
                    set_id: format!("action.{slug}_set_{state_id}"),
                    bulk_id: format!("action.{slug}_bulk_set_{state_id}"),
                    label,
                    status_field: status_field.to_string(),
                    state_id: state_id.to_string(),
                });
            }
        }
    }

    {
        let actions = ensure_array(root, "actions");
        for action in &wanted {
            let mut patch = Map::new();
            patch.insert(action.status_field.clone(), json!(action.state_id));
            if index_by_id(actions, &action.set_id).is_none() {
                actions.push(json!({
                    "id": action.set_id,
                    "kind": "update_record",
                    "label": format!("Set {}", action.label),
                    "entity_id": action.entity_id,
                    "patch": Value::Object(patch.clone()),
                }));
            }
            if index_by_id(actions, &action.bulk_id).is_none() {
                actions.push(json!({
                    "id": action.bulk_id,
                    "kind": "bulk_update",
                    "label": format!("Set {}", action.label),
                    "entity_id": action.entity_id,
                    "patch": Value::Object(patch),
                }));
            }
        }
    }

    // Wire the actions into the form's secondary actions and the list's
    // bulk actions when the views don't already reference them.
    let Some(views) = root.get_mut("views").and_then(Value::as_array_mut) else {
        return;
    };
    for action in &wanted {
        for view in views.iter_mut() {
            if get_str(view, "entity") != Some(action.entity_id.as_str()) {
                continue;
            }
            let kind = get_str(view, "kind").unwrap_or_default().to_string();
            let view_id = get_str(view, "id").unwrap_or_default().to_string();
            let Some(map) = view.as_object_mut() else {
                continue;
            };
            let header = ensure_object(map, "header");
            match kind.as_str() {
                "form" if view_id == format!("{}.form", action.slug) => {
                    append_action_ref(header, "secondary_actions", &action.set_id);
                }
                "list" if view_id == format!("{}.list", action.slug) => {
                    append_action_ref(header, "bulk_actions", &action.bulk_id);
                }
                _ => {}
            }
        }
    }
}

fn append_action_ref(header: &mut Map<String, Value>, key: &str, action_id: &str) {
    let refs = ensure_array(header, key);
    let present = refs
        .iter()
        .any(|r| get_str(r, "action_id") == Some(action_id));
    if !present {
        refs.push(json!({"action_id": action_id}));
    }
}

// ---------------------------------------------------------------------------
// Pass 11 — architecture enforcement
// ---------------------------------------------------------------------------

fn enforce_architecture(root: &mut Map<String, Value>) {
    let infos = snapshot_entities(root);

    {
        let app = ensure_object(root, "app");
        let nav = ensure_array(app, "nav");
        let main_idx = nav
            .iter()
            .position(|group| get_str(group, "group") == Some("Main"));
        let main_idx = match main_idx {
            Some(idx) => idx,
            None => {
                nav.insert(0, json!({"group": "Main", "items": []}));
                0
            }
        };
        if let Some(main) = nav[main_idx].as_object_mut() {
            let items = ensure_array(main, "items");
            for info in &infos {
                let target = format!("page:{}.list_page", info.slug);
                let present = items
                    .iter()
                    .any(|item| get_str(item, "to") == Some(target.as_str()));
                if !present {
                    items.push(json!({"label": info.label, "to": target}));
                }
            }
        }

        let defaults = ensure_object(app, "defaults");
        let entities = ensure_object(defaults, "entities");
        for info in &infos {
            let entry = ensure_object(entities, &info.id);
            if !entry.contains_key("entity_form_page") {
                entry.insert(
                    "entity_form_page".into(),
                    json!(format!("page:{}.form_page", info.slug)),
                );
            }
            if !entry.contains_key("entity_home_page") {
                entry.insert(
                    "entity_home_page".into(),
                    json!(format!("page:{}.list_page", info.slug)),
                );
            }
        }
    }

    // Pages now exist, so a missing or dangling home can be repaired.
    ensure_home(root);
}
