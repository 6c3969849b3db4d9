// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plan execution: apply a compiled [`ActionPlan`] with transactional
//! semantics.
//!
//! Steps run in order inside one transaction; any failure rolls back and
//! drops pending events. Step outputs bound via `returns` overlay the
//! variable context for later steps, so a created record's id can feed a
//! subsequent update. Events publish to the outbox strictly post-commit.

use crate::plan::{ActionPlan, PlanContext, PlanStep, RecordRef, Returns};
use mantle_events::{Actor, EventMetaInit, Outbox, make_event};
use mantle_manifest::Issue;
use serde_json::{Map, Value, json};

/// Transaction handle from the SQL boundary. The in-memory test double
/// just records commit/rollback; a database adapter wraps a real
/// transaction.
pub trait Transaction {
    /// Commit the transaction.
    fn commit(&mut self);
    /// Roll the transaction back.
    fn rollback(&mut self);
}

/// Produces transactions.
pub trait TxManager {
    /// Open a new transaction.
    fn begin(&self) -> Box<dyn Transaction>;
}

/// Record writes available to plan steps.
pub trait PlanRecordOps {
    /// Create a record; returns the stored row (with its id).
    ///
    /// # Errors
    ///
    /// Adapter failures (constraint violations and the like).
    fn create_record(&self, entity: &str, values: &Map<String, Value>) -> anyhow::Result<Value>;

    /// Patch a record by id.
    ///
    /// # Errors
    ///
    /// Adapter failures, including missing records.
    fn update_record(
        &self,
        entity: &str,
        record_id: &Value,
        changes: &Map<String, Value>,
    ) -> anyhow::Result<()>;
}

/// Dispatches `call_action` steps.
pub trait PlanActionCaller {
    /// Invoke the referenced action with resolved params.
    ///
    /// # Errors
    ///
    /// Failures of the called action.
    fn call(
        &self,
        action_ref: &str,
        params: &Map<String, Value>,
        ctx: &PlanContext,
    ) -> anyhow::Result<Value>;
}

/// Dispatches `run_query` steps.
pub trait PlanQueryRunner {
    /// Run the referenced query with resolved params.
    ///
    /// # Errors
    ///
    /// Failures of the query.
    fn run(
        &self,
        query_ref: &str,
        params: &Map<String, Value>,
        ctx: &PlanContext,
    ) -> anyhow::Result<Value>;
}

/// Collaborators the executor needs. `actions` and `queries` are optional:
/// a plan using those step kinds fails when the dep is absent.
pub struct PlanDeps<'a> {
    /// Transaction boundary.
    pub tx: &'a dyn TxManager,
    /// Record writes.
    pub records: &'a dyn PlanRecordOps,
    /// `call_action` dispatch.
    pub actions: Option<&'a dyn PlanActionCaller>,
    /// `run_query` dispatch.
    pub queries: Option<&'a dyn PlanQueryRunner>,
    /// Post-commit event sink.
    pub outbox: Option<&'a Outbox>,
}

/// Side effects recorded by an execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanEffects {
    /// `(entity, record_id)` of updated records.
    pub updated: Vec<(String, Value)>,
    /// `(entity, record_id)` of created records.
    pub created: Vec<(String, Value)>,
    /// Event ids enqueued post-commit.
    pub events_enqueued: Vec<String>,
}

/// Execution result. `ok()` implies the transaction committed.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// Hard failures; non-empty means the transaction rolled back.
    pub errors: Vec<Issue>,
    /// Advisory warnings (missing return fields).
    pub warnings: Vec<Issue>,
    /// Step outputs keyed by their `returns` alias.
    pub result: Map<String, Value>,
    /// Recorded side effects.
    pub effects: PlanEffects,
}

impl ExecOutcome {
    /// Whether execution committed.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

enum ResolveError {
    Unresolved(String),
    Invalid(String),
}

/// Resolve a value node against the overlay vars. Plan execution accepts
/// exactly `{literal}`, `{var}`, and `{array}` nodes.
fn resolve_node(node: &Value, vars: &Value) -> Result<Value, ResolveError> {
    let Some(map) = node.as_object() else {
        return Err(ResolveError::Invalid("value node must be an object".into()));
    };
    if map.len() != 1 {
        return Err(ResolveError::Invalid("invalid value node".into()));
    }
    if let Some(literal) = map.get("literal") {
        return Ok(literal.clone());
    }
    if let Some(var) = map.get("var") {
        let Some(name) = var.as_str() else {
            return Err(ResolveError::Invalid("var must be a string".into()));
        };
        return mantle_condition::resolve_path(vars, name)
            .cloned()
            .ok_or_else(|| ResolveError::Unresolved(format!("unresolved var: {name}")));
    }
    if let Some(arr) = map.get("array") {
        let Some(items) = arr.as_array() else {
            return Err(ResolveError::Invalid("array must be a list".into()));
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(resolve_node(item, vars)?);
        }
        return Ok(Value::Array(out));
    }
    Err(ResolveError::Invalid("invalid value node".into()))
}

fn resolve_map(
    nodes: &Map<String, Value>,
    vars: &Value,
) -> Result<Map<String, Value>, ResolveError> {
    let mut out = Map::new();
    for (key, node) in nodes {
        out.insert(key.clone(), resolve_node(node, vars)?);
    }
    Ok(out)
}

/// The id of a created row: `id`, or any `<slug>.id`-style key.
fn extract_created_id(created: &Value) -> Option<Value> {
    let map = created.as_object()?;
    if let Some(id) = map.get("id") {
        return Some(id.clone());
    }
    map.iter()
        .find(|(key, _)| key.ends_with(".id"))
        .map(|(_, value)| value.clone())
}

fn bind_returns(
    returns: Option<&Returns>,
    output: Value,
    step_path: &str,
    result: &mut Map<String, Value>,
    warnings: &mut Vec<Issue>,
) {
    let Some(returns) = returns else {
        return;
    };
    match &returns.fields {
        Some(fields) => {
            let mut projected = Map::new();
            for field in fields {
                match output.get(field) {
                    Some(value) => {
                        projected.insert(field.clone(), value.clone());
                    }
                    None => warnings.push(
                        Issue::at(
                            "EXEC_RETURN_FIELD_MISSING",
                            "return field missing",
                            format!("{step_path}.returns.fields"),
                        )
                        .with_detail(json!({"field": field})),
                    ),
                }
            }
            result.insert(returns.alias.clone(), Value::Object(projected));
        }
        None => {
            result.insert(returns.alias.clone(), output);
        }
    }
}

/// Execute a compiled plan.
///
/// Any step failure rolls the transaction back and returns with errors;
/// on success the transaction commits and `publish_event` steps turn into
/// sealed envelopes on the outbox.
#[must_use]
pub fn execute_plan(plan: &ActionPlan, ctx: &PlanContext, deps: &PlanDeps<'_>) -> ExecOutcome {
    let mut outcome = ExecOutcome::default();
    let mut tx = deps.tx.begin();
    let mut to_emit: Vec<(String, Map<String, Value>)> = Vec::new();

    let base_vars = if ctx.vars.is_object() {
        ctx.vars.clone()
    } else {
        json!({})
    };

    for (idx, step) in plan.steps.iter().enumerate() {
        let path = format!("$.steps[{idx}]");

        // Overlay earlier step outputs over the caller vars.
        let mut overlay = base_vars.as_object().cloned().unwrap_or_default();
        for (alias, value) in &outcome.result {
            overlay.insert(alias.clone(), value.clone());
        }
        let overlay = Value::Object(overlay);

        let failed = match step {
            PlanStep::UpdateRecord {
                record_ref,
                changes,
            } => exec_update(record_ref, changes, &overlay, deps, &path, &mut outcome),
            PlanStep::CreateRecord {
                entity,
                values,
                returns,
            } => exec_create(
                entity,
                values,
                returns.as_ref(),
                &overlay,
                deps,
                &path,
                &mut outcome,
            ),
            PlanStep::CallAction {
                action_ref,
                params,
                returns,
            } => exec_call(
                action_ref,
                params.as_ref(),
                returns.as_ref(),
                &overlay,
                ctx,
                deps,
                &path,
                &mut outcome,
            ),
            PlanStep::RunQuery {
                query_ref,
                params,
                returns,
            } => exec_query(
                query_ref,
                params.as_ref(),
                returns.as_ref(),
                &overlay,
                ctx,
                deps,
                &path,
                &mut outcome,
            ),
            PlanStep::PublishEvent { name, payload } => {
                match payload
                    .as_ref()
                    .map(|payload| resolve_map(payload, &overlay))
                    .transpose()
                {
                    Ok(resolved) => {
                        to_emit.push((name.clone(), resolved.unwrap_or_default()));
                        false
                    }
                    Err(err) => {
                        push_resolve_error(err, &path, &mut outcome);
                        true
                    }
                }
            }
        };
        if failed {
            break;
        }
    }

    if !outcome.errors.is_empty() {
        tx.rollback();
        outcome.result.clear();
        return outcome;
    }
    tx.commit();

    let Some(manifest_hash) = ctx.manifest_hash.clone() else {
        outcome.errors.push(Issue::at(
            "EXEC_CTX_INVALID",
            "ctx.manifest_hash required",
            "ctx.manifest_hash",
        ));
        return outcome;
    };

    for (name, payload) in to_emit {
        let envelope = make_event(
            &name,
            Value::Object(payload),
            EventMetaInit {
                module_id: ctx.module_id.clone(),
                manifest_hash: manifest_hash.clone(),
                actor: actor_from_ctx(ctx),
                trace_id: ctx.trace_id.clone(),
                ..EventMetaInit::default()
            },
        );
        match envelope {
            Ok(envelope) => {
                let event_id = envelope.meta.event_id.clone();
                let enqueued = match deps.outbox {
                    Some(outbox) => outbox.enqueue(envelope).is_ok(),
                    None => false,
                };
                if enqueued {
                    outcome.effects.events_enqueued.push(event_id);
                }
            }
            Err(err) => {
                outcome.errors.push(Issue::at("EXEC_ERROR", err.to_string(), "$"));
                return outcome;
            }
        }
    }

    outcome
}

pub(crate) fn actor_from_ctx(ctx: &PlanContext) -> Option<Actor> {
    let actor = ctx.actor.as_ref()?.as_object()?;
    let id = actor.get("id").and_then(Value::as_str)?.to_string();
    let roles = actor
        .get("roles")
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    Some(Actor { id, roles })
}

fn push_resolve_error(err: ResolveError, path: &str, outcome: &mut ExecOutcome) {
    match err {
        ResolveError::Unresolved(message) => outcome
            .errors
            .push(Issue::at("EXEC_VAR_UNRESOLVED", message, path)),
        ResolveError::Invalid(message) => outcome
            .errors
            .push(Issue::at("EXEC_STEP_INVALID", message, path)),
    }
}

fn exec_update(
    record_ref: &RecordRef,
    changes: &Map<String, Value>,
    overlay: &Value,
    deps: &PlanDeps<'_>,
    path: &str,
    outcome: &mut ExecOutcome,
) -> bool {
    let record_id = match resolve_node(&record_ref.id, overlay) {
        Ok(id) => id,
        Err(err) => {
            push_resolve_error(err, path, outcome);
            return true;
        }
    };
    let resolved = match resolve_map(changes, overlay) {
        Ok(resolved) => resolved,
        Err(err) => {
            push_resolve_error(err, path, outcome);
            return true;
        }
    };
    if let Err(err) = deps
        .records
        .update_record(&record_ref.entity, &record_id, &resolved)
    {
        outcome.errors.push(Issue::at("EXEC_ERROR", err.to_string(), path));
        return true;
    }
    outcome
        .effects
        .updated
        .push((record_ref.entity.clone(), record_id));
    false
}

fn exec_create(
    entity: &str,
    values: &Map<String, Value>,
    returns: Option<&Returns>,
    overlay: &Value,
    deps: &PlanDeps<'_>,
    path: &str,
    outcome: &mut ExecOutcome,
) -> bool {
    let resolved = match resolve_map(values, overlay) {
        Ok(resolved) => resolved,
        Err(err) => {
            push_resolve_error(err, path, outcome);
            return true;
        }
    };
    let created = match deps.records.create_record(entity, &resolved) {
        Ok(created) => created,
        Err(err) => {
            outcome.errors.push(Issue::at("EXEC_ERROR", err.to_string(), path));
            return true;
        }
    };
    if !created.is_object() {
        outcome.errors.push(Issue::at(
            "EXEC_STEP_INVALID",
            "create_record must return an object",
            path,
        ));
        return true;
    }
    if let Some(id) = extract_created_id(&created) {
        outcome.effects.created.push((entity.to_string(), id));
    }
    bind_returns(returns, created, path, &mut outcome.result, &mut outcome.warnings);
    false
}

#[allow(clippy::too_many_arguments)]
fn exec_call(
    action_ref: &str,
    params: Option<&Map<String, Value>>,
    returns: Option<&Returns>,
    overlay: &Value,
    ctx: &PlanContext,
    deps: &PlanDeps<'_>,
    path: &str,
    outcome: &mut ExecOutcome,
) -> bool {
    let Some(actions) = deps.actions else {
        outcome.errors.push(Issue::at(
            "EXEC_STEP_INVALID",
            "actions dep missing",
            path,
        ));
        return true;
    };
    let resolved = match params.map(|params| resolve_map(params, overlay)).transpose() {
        Ok(resolved) => resolved.unwrap_or_default(),
        Err(err) => {
            push_resolve_error(err, path, outcome);
            return true;
        }
    };
    match actions.call(action_ref, &resolved, ctx) {
        Ok(output) => {
            bind_returns(returns, output, path, &mut outcome.result, &mut outcome.warnings);
            false
        }
        Err(err) => {
            outcome.errors.push(Issue::at("EXEC_ERROR", err.to_string(), path));
            true
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn exec_query(
    query_ref: &str,
    params: Option<&Map<String, Value>>,
    returns: Option<&Returns>,
    overlay: &Value,
    ctx: &PlanContext,
    deps: &PlanDeps<'_>,
    path: &str,
    outcome: &mut ExecOutcome,
) -> bool {
    let Some(queries) = deps.queries else {
        outcome.errors.push(Issue::at(
            "EXEC_STEP_INVALID",
            "queries dep missing",
            path,
        ));
        return true;
    };
    let resolved = match params.map(|params| resolve_map(params, overlay)).transpose() {
        Ok(resolved) => resolved.unwrap_or_default(),
        Err(err) => {
            push_resolve_error(err, path, outcome);
            return true;
        }
    };
    match queries.run(query_ref, &resolved, ctx) {
        Ok(output) => {
            bind_returns(returns, output, path, &mut outcome.result, &mut outcome.warnings);
            false
        }
        Err(err) => {
            outcome.errors.push(Issue::at("EXEC_ERROR", err.to_string(), path));
            true
        }
    }
}
