// SPDX-License-Identifier: MIT OR Apache-2.0
//! Compiled manifests: typed projections of a normalized manifest tree.
//!
//! The record store and action executor work against these types instead of
//! re-walking raw JSON. Unknown tags survive normalization as raw values and
//! are converted to structured errors here.

use crate::issue::Issue;
use crate::util::{entity_slug, get_str};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Field types an entity may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Server-assigned UUID.
    Uuid,
    /// Short text.
    String,
    /// Long text.
    Text,
    /// Numeric.
    Number,
    /// Boolean flag.
    Boolean,
    /// One of a declared option set.
    Enum,
    /// ISO date (`YYYY-MM-DD`).
    Date,
    /// ISO datetime.
    DateTime,
    /// Reference to a record of another entity.
    Lookup,
    /// Free-form string tags.
    Tags,
}

impl FieldType {
    /// Parse the manifest type tag.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "uuid" => Self::Uuid,
            "string" => Self::String,
            "text" => Self::Text,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "enum" => Self::Enum,
            "date" => Self::Date,
            "datetime" => Self::DateTime,
            "lookup" => Self::Lookup,
            "tags" => Self::Tags,
            _ => return None,
        })
    }
}

/// One enum option.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumOption {
    /// Stored value.
    pub value: String,
    /// Display label.
    pub label: String,
}

/// A compiled field definition.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Namespaced field id (`job.title`).
    pub id: String,
    /// Field type.
    pub field_type: FieldType,
    /// Display label.
    pub label: String,
    /// Whether a value is required on create.
    pub required: bool,
    /// Whether the runtime rejects writes to this field.
    pub readonly: bool,
    /// Declared options (enum fields).
    pub options: Vec<EnumOption>,
    /// Target entity id (lookup fields).
    pub lookup_entity: Option<String>,
    /// Display field on the target entity (lookup fields).
    pub lookup_display_field: Option<String>,
    /// Domain condition a lookup candidate must satisfy.
    pub lookup_domain: Option<Value>,
}

/// A compiled entity definition.
#[derive(Debug, Clone)]
pub struct EntityDef {
    /// Entity id (`entity.job`).
    pub id: String,
    /// Slug (`job`).
    pub slug: String,
    /// Display label.
    pub label: String,
    /// Field used as the record title.
    pub display_field: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDef>,
}

impl EntityDef {
    /// Look up a field by id.
    #[must_use]
    pub fn field(&self, field_id: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == field_id)
    }
}

/// A workflow state with its entry requirements.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    /// State id (also the stored enum value).
    pub id: String,
    /// Display label.
    pub label: String,
    /// Fields that must be present when a record is in this state.
    pub required_fields: Vec<String>,
}

/// A compiled workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowDef {
    /// Workflow id.
    pub id: String,
    /// Entity the workflow governs.
    pub entity: String,
    /// The enum field carrying the state.
    pub status_field: String,
    /// Declared states.
    pub states: Vec<WorkflowState>,
}

impl WorkflowDef {
    /// Look up a state by id.
    #[must_use]
    pub fn state(&self, state_id: &str) -> Option<&WorkflowState> {
        self.states.iter().find(|s| s.id == state_id)
    }
}

/// Kinds of declarative actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Navigate to a target page.
    Navigate,
    /// Open a form view.
    OpenForm,
    /// Refresh the current view.
    Refresh,
    /// Create a record from defaults.
    CreateRecord,
    /// Patch a single record.
    UpdateRecord,
    /// Patch every selected record.
    BulkUpdate,
}

impl ActionKind {
    /// Parse the manifest kind tag.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "navigate" => Self::Navigate,
            "open_form" => Self::OpenForm,
            "refresh" => Self::Refresh,
            "create_record" => Self::CreateRecord,
            "update_record" => Self::UpdateRecord,
            "bulk_update" => Self::BulkUpdate,
            _ => return None,
        })
    }

    /// Whether this kind writes records.
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::CreateRecord | Self::UpdateRecord | Self::BulkUpdate)
    }

    /// Wire tag for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::OpenForm => "open_form",
            Self::Refresh => "refresh",
            Self::CreateRecord => "create_record",
            Self::UpdateRecord => "update_record",
            Self::BulkUpdate => "bulk_update",
        }
    }
}

/// A compiled action definition.
#[derive(Debug, Clone)]
pub struct ActionDef {
    /// Action id (`action.job_new`).
    pub id: String,
    /// Action kind.
    pub kind: ActionKind,
    /// Display label.
    pub label: String,
    /// Bound entity (write kinds).
    pub entity_id: Option<String>,
    /// Navigation target (navigate / open_form).
    pub target: Option<String>,
    /// Field defaults (create_record).
    pub defaults: Map<String, Value>,
    /// Field patch (update_record / bulk_update).
    pub patch: Map<String, Value>,
    /// Condition gating execution.
    pub enabled_when: Option<Value>,
    /// Condition gating visibility.
    pub visible_when: Option<Value>,
}

/// A compiled view: just the parts the runtime consults.
#[derive(Debug, Clone)]
pub struct ViewDef {
    /// View id.
    pub id: String,
    /// `list` or `form`.
    pub kind: String,
    /// Bound entity.
    pub entity: String,
    /// Whether the activity feed is enabled for this view.
    pub activity_enabled: bool,
    /// Fields tracked in activity change entries (defaults to form fields).
    pub tracked_fields: Vec<String>,
}

/// A compiled manifest trigger.
#[derive(Debug, Clone)]
pub struct TriggerDef {
    /// Trigger id.
    pub id: String,
    /// Subscribed event name.
    pub event: String,
    /// Optional entity filter.
    pub entity_id: Option<String>,
    /// Optional status-field filter.
    pub status_field: Option<String>,
    /// Optional action filter.
    pub action_id: Option<String>,
}

/// Typed projection of a normalized manifest.
#[derive(Debug, Clone)]
pub struct CompiledManifest {
    /// Owning module id.
    pub module_id: String,
    /// Module slug used for namespaced event names.
    pub module_slug: String,
    /// Entities keyed by id.
    pub entities: BTreeMap<String, EntityDef>,
    /// Actions keyed by id.
    pub actions: BTreeMap<String, ActionDef>,
    /// At most one workflow per entity after normalization.
    pub workflows_by_entity: BTreeMap<String, WorkflowDef>,
    /// Views keyed by id.
    pub views: BTreeMap<String, ViewDef>,
    /// Declared triggers.
    pub triggers: Vec<TriggerDef>,
}

impl CompiledManifest {
    /// The workflow governing `entity_id`, if any.
    #[must_use]
    pub fn workflow_for(&self, entity_id: &str) -> Option<&WorkflowDef> {
        self.workflows_by_entity.get(entity_id)
    }

    /// The form view of an entity (`<slug>.form`).
    #[must_use]
    pub fn form_view_for(&self, entity_id: &str) -> Option<&ViewDef> {
        let slug = entity_slug(entity_id);
        self.views.get(&format!("{slug}.form"))
    }
}

/// Compile a normalized manifest into its typed projection.
///
/// # Errors
///
/// Returns a [`Issue`] list when tags survive normalization that the
/// runtime cannot interpret.
pub fn compile_manifest(root: &Value, module_id: &str) -> Result<CompiledManifest, Vec<Issue>> {
    let mut errors = Vec::new();

    let mut entities = BTreeMap::new();
    if let Some(list) = root.get("entities").and_then(Value::as_array) {
        for (idx, raw) in list.iter().enumerate() {
            match compile_entity(raw, idx) {
                Ok(entity) => {
                    entities.insert(entity.id.clone(), entity);
                }
                Err(issue) => errors.push(issue),
            }
        }
    }

    let mut actions = BTreeMap::new();
    if let Some(list) = root.get("actions").and_then(Value::as_array) {
        for (idx, raw) in list.iter().enumerate() {
            match compile_action(raw, idx) {
                Ok(action) => {
                    actions.insert(action.id.clone(), action);
                }
                Err(issue) => errors.push(issue),
            }
        }
    }

    let mut workflows_by_entity = BTreeMap::new();
    if let Some(list) = root.get("workflows").and_then(Value::as_array) {
        for raw in list {
            if let Some(workflow) = compile_workflow(raw) {
                workflows_by_entity.insert(workflow.entity.clone(), workflow);
            }
        }
    }

    let mut views = BTreeMap::new();
    if let Some(list) = root.get("views").and_then(Value::as_array) {
        for raw in list {
            if let Some(view) = compile_view(raw) {
                views.insert(view.id.clone(), view);
            }
        }
    }

    let mut triggers = Vec::new();
    if let Some(list) = root.get("triggers").and_then(Value::as_array) {
        for raw in list {
            let (Some(id), Some(event)) = (get_str(raw, "id"), get_str(raw, "event")) else {
                continue;
            };
            triggers.push(TriggerDef {
                id: id.to_string(),
                event: event.to_string(),
                entity_id: get_str(raw, "entity_id").map(String::from),
                status_field: get_str(raw, "status_field").map(String::from),
                action_id: get_str(raw, "action_id").map(String::from),
            });
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let module_slug = get_str(root.get("module").unwrap_or(&Value::Null), "id")
        .unwrap_or(module_id)
        .to_string();

    Ok(CompiledManifest {
        module_id: module_id.to_string(),
        module_slug,
        entities,
        actions,
        workflows_by_entity,
        views,
        triggers,
    })
}

fn compile_entity(raw: &Value, idx: usize) -> Result<EntityDef, Issue> {
    let Some(id) = get_str(raw, "id") else {
        return Err(Issue::at(
            "MANIFEST_ENTITY_INVALID",
            "entity.id must be a string",
            format!("entities[{idx}]"),
        ));
    };
    let slug = entity_slug(id).to_string();
    let mut fields = Vec::new();
    if let Some(list) = raw.get("fields").and_then(Value::as_array) {
        for (field_idx, field) in list.iter().enumerate() {
            let Some(field_id) = get_str(field, "id") else {
                continue;
            };
            let type_tag = get_str(field, "type").unwrap_or("string");
            let Some(field_type) = FieldType::parse(type_tag) else {
                return Err(Issue::at(
                    "MANIFEST_FIELD_TYPE_INVALID",
                    format!("unknown field type: {type_tag}"),
                    format!("entities[{idx}].fields[{field_idx}].type"),
                ));
            };
            let options = field
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(|opt| {
                            let value = get_str(opt, "value")?;
                            let label = get_str(opt, "label").unwrap_or(value);
                            Some(EnumOption {
                                value: value.to_string(),
                                label: label.to_string(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            fields.push(FieldDef {
                id: field_id.to_string(),
                field_type,
                label: get_str(field, "label").unwrap_or(field_id).to_string(),
                required: field.get("required").and_then(Value::as_bool).unwrap_or(false),
                readonly: field.get("readonly").and_then(Value::as_bool).unwrap_or(false),
                options,
                lookup_entity: get_str(field, "entity").map(String::from),
                lookup_display_field: get_str(field, "display_field").map(String::from),
                lookup_domain: field.get("domain").cloned(),
            });
        }
    }

    Ok(EntityDef {
        id: id.to_string(),
        slug: slug.clone(),
        label: get_str(raw, "label").unwrap_or(&slug).to_string(),
        display_field: get_str(raw, "display_field")
            .map(String::from)
            .unwrap_or_else(|| format!("{slug}.name")),
        fields,
    })
}

fn compile_action(raw: &Value, idx: usize) -> Result<ActionDef, Issue> {
    let Some(id) = get_str(raw, "id") else {
        return Err(Issue::at(
            "MANIFEST_ACTION_INVALID",
            "action.id must be a string",
            format!("actions[{idx}]"),
        ));
    };
    let kind_tag = get_str(raw, "kind").unwrap_or_default();
    let Some(kind) = ActionKind::parse(kind_tag) else {
        return Err(Issue::at(
            "MANIFEST_ACTION_KIND_INVALID",
            format!("unknown action kind: {kind_tag}"),
            format!("actions[{idx}].kind"),
        ));
    };
    Ok(ActionDef {
        id: id.to_string(),
        kind,
        label: get_str(raw, "label").unwrap_or(id).to_string(),
        entity_id: get_str(raw, "entity_id").map(String::from),
        target: get_str(raw, "target").map(String::from),
        defaults: raw
            .get("defaults")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        patch: raw
            .get("patch")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        enabled_when: raw.get("enabled_when").cloned(),
        visible_when: raw.get("visible_when").cloned(),
    })
}

fn compile_workflow(raw: &Value) -> Option<WorkflowDef> {
    let id = get_str(raw, "id")?;
    let entity = get_str(raw, "entity")?;
    let status_field = get_str(raw, "status_field")?;
    let states = raw
        .get("states")
        .and_then(Value::as_array)
        .map(|states| {
            states
                .iter()
                .filter_map(|state| {
                    let state_id = get_str(state, "id")?;
                    Some(WorkflowState {
                        id: state_id.to_string(),
                        label: get_str(state, "label").unwrap_or(state_id).to_string(),
                        required_fields: state
                            .get("required_fields")
                            .and_then(Value::as_array)
                            .map(|fields| {
                                fields
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(String::from)
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Some(WorkflowDef {
        id: id.to_string(),
        entity: entity.to_string(),
        status_field: status_field.to_string(),
        states,
    })
}

fn compile_view(raw: &Value) -> Option<ViewDef> {
    let id = get_str(raw, "id")?;
    let kind = get_str(raw, "kind")?;
    let entity = get_str(raw, "entity")?;
    let activity = raw.get("activity").and_then(Value::as_object);
    let activity_enabled = activity
        .and_then(|a| a.get("enabled"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let tracked_fields = activity
        .and_then(|a| a.get("tracked_fields"))
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_else(|| {
            raw.get("sections")
                .and_then(Value::as_array)
                .map(|sections| {
                    sections
                        .iter()
                        .filter_map(|s| s.get("fields").and_then(Value::as_array))
                        .flatten()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        });
    Some(ViewDef {
        id: id.to_string(),
        kind: kind.to_string(),
        entity: entity.to_string(),
        activity_enabled,
        tracked_fields,
    })
}
