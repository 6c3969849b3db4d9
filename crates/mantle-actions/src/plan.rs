// SPDX-License-Identifier: MIT OR Apache-2.0
//! Declarative action planning: validation and plan compilation without
//! side effects.
//!
//! An action declaration is a dynamic JSON value — `{id, type,
//! params_schema?, permissions?, effect}` — authored in manifests or
//! automation configs. Planning validates the caller's params against the
//! declared schema, gates on role and condition permissions, validates the
//! effect shape, and compiles a typed [`ActionPlan`] of steps for the
//! executor. Nothing is written here; a plan either compiles cleanly or
//! the caller gets a precise issue list.

use mantle_manifest::Issue;
use serde::Serialize;
use serde_json::{Map, Value};

use mantle_condition::{eval_condition_strict, validate_value_node};

/// Action declaration types the planner accepts.
pub const ALLOWED_PLAN_TYPES: &[&str] = &[
    "update_record",
    "create_record",
    "call_action",
    "publish_event",
    "run_query",
];

/// Evaluation context shared by planning and execution.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    /// Acting principal (`{id, roles}` shape).
    pub actor: Option<Value>,
    /// Module the action belongs to.
    pub module_id: String,
    /// Manifest hash in force; required before events can be emitted.
    pub manifest_hash: Option<String>,
    /// Correlation id.
    pub trace_id: Option<String>,
    /// Variables visible to value nodes and permission conditions.
    pub vars: Value,
}

/// A record reference inside a plan step. The id is a value node resolved
/// at execution time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordRef {
    /// Target entity id.
    pub entity: String,
    /// Value node producing the record id.
    pub id: Value,
}

/// Output binding of a step: alias in the result map, optionally projected
/// to specific fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Returns {
    /// Alias the step's output is stored under.
    pub alias: String,
    /// Fields to project from the output, when given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// One compiled plan step. Field maps hold value nodes, resolved at
/// execution time against the context plus earlier step outputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanStep {
    /// Patch one record.
    UpdateRecord {
        /// The record to patch.
        record_ref: RecordRef,
        /// Field changes as value nodes.
        changes: Map<String, Value>,
    },
    /// Create a record.
    CreateRecord {
        /// Target entity.
        entity: String,
        /// Field values as value nodes.
        values: Map<String, Value>,
        /// Output binding.
        #[serde(skip_serializing_if = "Option::is_none")]
        returns: Option<Returns>,
    },
    /// Invoke another action by reference.
    CallAction {
        /// The referenced action.
        action_ref: String,
        /// Call params as value nodes.
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Map<String, Value>>,
        /// Output binding.
        #[serde(skip_serializing_if = "Option::is_none")]
        returns: Option<Returns>,
    },
    /// Run a declared query.
    RunQuery {
        /// The referenced query.
        query_ref: String,
        /// Query params as value nodes.
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Map<String, Value>>,
        /// Output binding.
        #[serde(skip_serializing_if = "Option::is_none")]
        returns: Option<Returns>,
    },
    /// Emit an event post-commit.
    PublishEvent {
        /// Event name.
        name: String,
        /// Payload as value nodes.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Map<String, Value>>,
    },
}

impl PlanStep {
    /// Wire tag of this step kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PlanStep::UpdateRecord { .. } => "update_record",
            PlanStep::CreateRecord { .. } => "create_record",
            PlanStep::CallAction { .. } => "call_action",
            PlanStep::RunQuery { .. } => "run_query",
            PlanStep::PublishEvent { .. } => "publish_event",
        }
    }
}

/// A compiled execution plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionPlan {
    /// Declaring action id.
    pub action_id: String,
    /// Declaration type tag.
    pub plan_type: String,
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

/// Planning result: a plan is present only when there are no errors.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// Hard validation errors.
    pub errors: Vec<Issue>,
    /// Advisory warnings.
    pub warnings: Vec<Issue>,
    /// The compiled plan, when validation passed.
    pub plan: Option<ActionPlan>,
}

impl PlanOutcome {
    /// Whether planning succeeded.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.errors.is_empty() && self.plan.is_some()
    }

    fn failed(errors: Vec<Issue>, warnings: Vec<Issue>) -> Self {
        Self {
            errors,
            warnings,
            plan: None,
        }
    }
}

/// Validate an action declaration plus caller params, and compile the
/// execution plan.
#[must_use]
pub fn plan_action(action_decl: &Value, params: &Value, ctx: &PlanContext) -> PlanOutcome {
    let mut errors: Vec<Issue> = Vec::new();
    let warnings: Vec<Issue> = Vec::new();

    let Some(decl) = action_decl.as_object() else {
        errors.push(Issue::at(
            "ACTION_DECL_INVALID",
            "action_decl must be an object",
            "action_decl",
        ));
        return PlanOutcome::failed(errors, warnings);
    };

    validate_decl(decl, &mut errors);
    if !errors.is_empty() {
        return PlanOutcome::failed(errors, warnings);
    }

    match decl.get("params_schema") {
        None | Some(Value::Null) => {
            if !params.is_object() {
                errors.push(Issue::at(
                    "PARAMS_NOT_OBJECT",
                    "params must be an object",
                    "params",
                ));
            }
        }
        Some(Value::Object(schema)) => validate_params_schema(params, schema, &mut errors),
        Some(_) => {
            errors.push(Issue::at(
                "PARAMS_SCHEMA_INVALID",
                "params_schema must be an object",
                "params_schema",
            ));
            return PlanOutcome::failed(errors, warnings);
        }
    }

    match decl.get("permissions") {
        None | Some(Value::Null) => {}
        Some(Value::Object(permissions)) => validate_permissions(permissions, ctx, &mut errors),
        Some(_) => errors.push(Issue::at(
            "PERMISSIONS_INVALID",
            "permissions must be an object",
            "permissions",
        )),
    }

    if !errors.is_empty() {
        return PlanOutcome::failed(errors, warnings);
    }

    let effect = decl.get("effect").and_then(Value::as_object);
    let action_type = decl.get("type").and_then(Value::as_str).unwrap_or_default();
    let step = effect.and_then(|effect| match action_type {
        "update_record" => compile_update_record(effect, &mut errors),
        "create_record" => compile_create_record(effect, &mut errors),
        "call_action" => compile_call_action(effect, &mut errors),
        "publish_event" => compile_publish_event(effect, &mut errors),
        "run_query" => compile_run_query(effect, &mut errors),
        _ => None,
    });

    let (Some(step), true) = (step, errors.is_empty()) else {
        return PlanOutcome::failed(errors, warnings);
    };

    PlanOutcome {
        errors,
        warnings,
        plan: Some(ActionPlan {
            action_id: decl
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            plan_type: action_type.to_string(),
            steps: vec![step],
        }),
    }
}

// ---------------------------------------------------------------------------
// Declaration / params / permissions
// ---------------------------------------------------------------------------

fn validate_decl(decl: &Map<String, Value>, errors: &mut Vec<Issue>) {
    if !decl.get("id").is_some_and(Value::is_string) {
        errors.push(Issue::at("ACTION_ID_INVALID", "action.id must be a string", "id"));
    }
    let action_type = decl.get("type").and_then(Value::as_str).unwrap_or_default();
    if !ALLOWED_PLAN_TYPES.contains(&action_type) {
        errors.push(Issue::at(
            "ACTION_TYPE_INVALID",
            format!("unsupported action type: {action_type}"),
            "type",
        ));
    }
    if !decl.get("effect").is_some_and(Value::is_object) {
        errors.push(Issue::at(
            "ACTION_EFFECT_INVALID",
            "effect must be an object",
            "effect",
        ));
    }
}

fn validate_params_schema(params: &Value, schema: &Map<String, Value>, errors: &mut Vec<Issue>) {
    let Some(params) = params.as_object() else {
        errors.push(Issue::at("PARAMS_NOT_OBJECT", "params must be an object", "params"));
        return;
    };
    match schema.get("type") {
        None | Some(Value::Null) => {}
        Some(Value::String(tag)) if tag == "object" => {}
        Some(_) => {
            errors.push(Issue::at(
                "PARAMS_SCHEMA_INVALID",
                "params_schema.type must be \"object\"",
                "params_schema.type",
            ));
            return;
        }
    }

    let required = match schema.get("required") {
        None | Some(Value::Null) => &[] as &[Value],
        Some(Value::Array(items)) => items.as_slice(),
        Some(_) => {
            errors.push(Issue::at(
                "PARAMS_SCHEMA_INVALID",
                "required must be a list",
                "params_schema.required",
            ));
            return;
        }
    };
    let properties: Option<&Map<String, Value>> = match schema.get("properties") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            errors.push(Issue::at(
                "PARAMS_SCHEMA_INVALID",
                "properties must be an object",
                "params_schema.properties",
            ));
            return;
        }
    };

    for key in required.iter().filter_map(Value::as_str) {
        if !params.contains_key(key) {
            errors.push(Issue::at(
                "PARAMS_REQUIRED_MISSING",
                format!("missing required param: {key}"),
                format!("params.{key}"),
            ));
        }
    }

    let additional_forbidden = schema.get("additionalProperties") == Some(&Value::Bool(false));
    for (key, value) in params {
        let Some(spec) = properties.and_then(|props| props.get(key)) else {
            if additional_forbidden {
                errors.push(Issue::at(
                    "PARAMS_ADDITIONAL_FORBIDDEN",
                    format!("unknown param: {key}"),
                    format!("params.{key}"),
                ));
            }
            continue;
        };
        let Some(spec) = spec.as_object() else {
            errors.push(Issue::at(
                "PARAMS_SCHEMA_INVALID",
                "property spec must be an object",
                format!("params_schema.properties.{key}"),
            ));
            continue;
        };
        let Some(expected) = spec.get("type").and_then(Value::as_str) else {
            continue;
        };
        let matches = match expected {
            "string" => value.is_string(),
            "boolean" => value.is_boolean(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "object" => value.is_object(),
            "array" => value.is_array(),
            _ => true,
        };
        if !matches {
            errors.push(Issue::at(
                "PARAMS_TYPE_INVALID",
                format!("{key} must be {expected}"),
                format!("params.{key}"),
            ));
        }
    }
}

fn validate_permissions(
    permissions: &Map<String, Value>,
    ctx: &PlanContext,
    errors: &mut Vec<Issue>,
) {
    if let Some(Value::Array(roles)) = permissions.get("roles") {
        let actor_roles: Vec<&str> = ctx
            .actor
            .as_ref()
            .and_then(|actor| actor.get("roles"))
            .and_then(Value::as_array)
            .map(|roles| roles.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let allowed = roles
            .iter()
            .filter_map(Value::as_str)
            .any(|role| actor_roles.contains(&role));
        if !allowed {
            errors.push(Issue::at(
                "ACTION_FORBIDDEN_ROLE",
                "actor lacks required role",
                "permissions.roles",
            ));
            return;
        }
    }

    if let Some(condition) = permissions.get("condition") {
        if condition.is_null() {
            return;
        }
        match eval_condition_strict(condition, &ctx.vars) {
            Ok(true) => {}
            Ok(false) => errors.push(Issue::at(
                "ACTION_FORBIDDEN_CONDITION",
                "permission condition evaluated to false",
                "permissions.condition",
            )),
            Err(err) => errors.push(
                Issue::at("CONDITION_INVALID", err.message.clone(), "permissions.condition")
                    .with_detail(serde_json::json!({"path": err.path})),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

fn check_effect_keys(effect: &Map<String, Value>, allowed: &[&str], errors: &mut Vec<Issue>) {
    for key in effect.keys() {
        if !allowed.contains(&key.as_str()) {
            errors.push(Issue::at(
                "EFFECT_KEY_INVALID",
                format!("unknown key: {key}"),
                format!("effect.{key}"),
            ));
        }
    }
}

fn check_value_nodes(nodes: &Map<String, Value>, path: &str, errors: &mut Vec<Issue>) {
    for (key, node) in nodes {
        let mut node_errors = Vec::new();
        validate_value_node(node, &format!("{path}.{key}"), &mut node_errors);
        errors.extend(node_errors.into_iter().map(|err| {
            Issue::at("VALUE_NODE_INVALID", err.message, err.path)
        }));
    }
}

fn compile_record_ref(raw: Option<&Value>, path: &str, errors: &mut Vec<Issue>) -> Option<RecordRef> {
    let Some(map) = raw.and_then(Value::as_object) else {
        errors.push(Issue::at("RECORD_REF_INVALID", "record_ref must be an object", path));
        return None;
    };
    let entity = match map.get("entity").and_then(Value::as_str) {
        Some(entity) => entity.to_string(),
        None => {
            errors.push(Issue::at(
                "RECORD_REF_INVALID",
                "entity must be a string",
                format!("{path}.entity"),
            ));
            return None;
        }
    };
    let Some(id) = map.get("id") else {
        errors.push(Issue::at(
            "RECORD_REF_INVALID",
            "id required",
            format!("{path}.id"),
        ));
        return None;
    };
    let mut id_errors = Vec::new();
    validate_value_node(id, &format!("{path}.id"), &mut id_errors);
    errors.extend(
        id_errors
            .into_iter()
            .map(|err| Issue::at("VALUE_NODE_INVALID", err.message, err.path)),
    );
    Some(RecordRef {
        entity,
        id: id.clone(),
    })
}

fn compile_returns(raw: Option<&Value>, path: &str, errors: &mut Vec<Issue>) -> Option<Option<Returns>> {
    let raw = match raw {
        None | Some(Value::Null) => return Some(None),
        Some(raw) => raw,
    };
    let Some(alias) = raw.get("as").and_then(Value::as_str) else {
        errors.push(Issue::at("EFFECT_INVALID", "returns must include as", path));
        return None;
    };
    let fields = match raw.get("fields") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
        ),
        Some(_) => {
            errors.push(Issue::at(
                "EFFECT_INVALID",
                "returns.fields must be a list of strings",
                format!("{path}.fields"),
            ));
            return None;
        }
    };
    Some(Some(Returns {
        alias: alias.to_string(),
        fields,
    }))
}

fn compile_update_record(effect: &Map<String, Value>, errors: &mut Vec<Issue>) -> Option<PlanStep> {
    check_effect_keys(effect, &["record_ref", "changes"], errors);
    if !effect.contains_key("record_ref") || !effect.contains_key("changes") {
        errors.push(Issue::at(
            "EFFECT_INVALID",
            "record_ref and changes required",
            "effect",
        ));
        return None;
    }
    let record_ref = compile_record_ref(effect.get("record_ref"), "effect.record_ref", errors)?;
    let Some(changes) = effect.get("changes").and_then(Value::as_object) else {
        errors.push(Issue::at(
            "EFFECT_INVALID",
            "changes must be an object",
            "effect.changes",
        ));
        return None;
    };
    check_value_nodes(changes, "effect.changes", errors);
    Some(PlanStep::UpdateRecord {
        record_ref,
        changes: changes.clone(),
    })
}

fn compile_create_record(effect: &Map<String, Value>, errors: &mut Vec<Issue>) -> Option<PlanStep> {
    check_effect_keys(effect, &["entity", "values", "returns"], errors);
    let Some(entity) = effect.get("entity").and_then(Value::as_str) else {
        errors.push(Issue::at(
            "EFFECT_INVALID",
            "entity must be a string",
            "effect.entity",
        ));
        return None;
    };
    let Some(values) = effect.get("values").and_then(Value::as_object) else {
        errors.push(Issue::at(
            "EFFECT_INVALID",
            "values must be an object",
            "effect.values",
        ));
        return None;
    };
    check_value_nodes(values, "effect.values", errors);
    let returns = compile_returns(effect.get("returns"), "effect.returns", errors)?;
    Some(PlanStep::CreateRecord {
        entity: entity.to_string(),
        values: values.clone(),
        returns,
    })
}

fn compile_params(
    effect: &Map<String, Value>,
    errors: &mut Vec<Issue>,
) -> Option<Option<Map<String, Value>>> {
    match effect.get("params") {
        None | Some(Value::Null) => Some(None),
        Some(Value::Object(params)) => {
            check_value_nodes(params, "effect.params", errors);
            Some(Some(params.clone()))
        }
        Some(_) => {
            errors.push(Issue::at(
                "EFFECT_INVALID",
                "params must be an object",
                "effect.params",
            ));
            None
        }
    }
}

fn compile_call_action(effect: &Map<String, Value>, errors: &mut Vec<Issue>) -> Option<PlanStep> {
    check_effect_keys(effect, &["action_ref", "params", "returns"], errors);
    let Some(action_ref) = effect.get("action_ref").and_then(Value::as_str) else {
        errors.push(Issue::at(
            "EFFECT_INVALID",
            "action_ref must be a string",
            "effect.action_ref",
        ));
        return None;
    };
    let params = compile_params(effect, errors)?;
    let returns = compile_returns(effect.get("returns"), "effect.returns", errors)?;
    Some(PlanStep::CallAction {
        action_ref: action_ref.to_string(),
        params,
        returns,
    })
}

fn compile_run_query(effect: &Map<String, Value>, errors: &mut Vec<Issue>) -> Option<PlanStep> {
    check_effect_keys(effect, &["query_ref", "params", "returns"], errors);
    let Some(query_ref) = effect.get("query_ref").and_then(Value::as_str) else {
        errors.push(Issue::at(
            "EFFECT_INVALID",
            "query_ref must be a string",
            "effect.query_ref",
        ));
        return None;
    };
    let params = compile_params(effect, errors)?;
    let returns = compile_returns(effect.get("returns"), "effect.returns", errors)?;
    Some(PlanStep::RunQuery {
        query_ref: query_ref.to_string(),
        params,
        returns,
    })
}

fn compile_publish_event(effect: &Map<String, Value>, errors: &mut Vec<Issue>) -> Option<PlanStep> {
    check_effect_keys(effect, &["name", "payload"], errors);
    let Some(name) = effect.get("name").and_then(Value::as_str) else {
        errors.push(Issue::at(
            "EFFECT_INVALID",
            "name must be a string",
            "effect.name",
        ));
        return None;
    };
    let payload = match effect.get("payload") {
        None | Some(Value::Null) => None,
        Some(Value::Object(payload)) => {
            check_value_nodes(payload, "effect.payload", errors);
            Some(payload.clone())
        }
        Some(_) => {
            errors.push(Issue::at(
                "EFFECT_INVALID",
                "payload must be an object",
                "effect.payload",
            ));
            return None;
        }
    };
    Some(PlanStep::PublishEvent {
        name: name.to_string(),
        payload,
    })
}
