// SPDX-License-Identifier: MIT OR Apache-2.0
//! The executor itself.

use crate::error::ActionError;
use mantle_condition::eval_condition;
use mantle_events::{
    ACTION_CLICKED, Actor, EventBus, EventEnvelope, EventMetaInit, RECORD_CREATED, RECORD_UPDATED,
    WORKFLOW_STATUS_CHANGED, make_event,
};
use mantle_manifest::{ActionDef, ActionKind, CompiledManifest, EntityDef, Issue, WorkflowDef};
use mantle_records::{
    ActivityStore, ChatterStore, RecordStore, ValidationMode, validate_record_data,
};
use mantle_registry::{Cache, ModuleRegistry};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Caller-supplied execution context.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    /// Record the action is invoked on (update kinds).
    pub record_id: Option<String>,
    /// Unsaved form values, merged over action defaults/patches.
    pub record_draft: Option<Value>,
    /// Selection for bulk kinds.
    pub selected_ids: Vec<String>,
    /// Loose actor object from the boundary.
    pub actor: Option<Value>,
    /// Correlation id.
    pub trace_id: Option<String>,
}

/// A single tracked-field change.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    /// Field id.
    pub field_id: String,
    /// Previous value.
    pub from: Value,
    /// New value.
    pub to: Value,
}

/// Result of a successful action.
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    /// Action kind tag.
    pub kind: String,
    /// Navigation target, for navigation kinds.
    pub target: Option<String>,
    /// Created or updated record id (single-record kinds).
    pub record_id: Option<String>,
    /// The written record (single-record kinds).
    pub record: Option<Value>,
    /// Updated ids (bulk kinds).
    pub updated_ids: Vec<String>,
    /// Event ids enqueued post-commit.
    pub events_enqueued: Vec<String>,
}

/// Transactional action executor for one workspace.
pub struct ActionExecutor {
    workspace: String,
    registry: Arc<ModuleRegistry>,
    records: Arc<RecordStore>,
    activity: Arc<ActivityStore>,
    chatter: Arc<ChatterStore>,
    bus: Arc<EventBus>,
    cache: Arc<Cache>,
}

impl ActionExecutor {
    /// Wire an executor over its collaborators.
    #[must_use]
    pub fn new(
        workspace: impl Into<String>,
        registry: Arc<ModuleRegistry>,
        records: Arc<RecordStore>,
        activity: Arc<ActivityStore>,
        chatter: Arc<ChatterStore>,
        bus: Arc<EventBus>,
        cache: Arc<Cache>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            registry,
            records,
            activity,
            chatter,
            bus,
            cache,
        }
    }

    /// The workspace this executor is bound to.
    #[must_use]
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// Execute an action.
    ///
    /// # Errors
    ///
    /// Any [`ActionError`]; on failure no record is written, no event is
    /// emitted, and no activity entry is created.
    pub fn run_action(
        &self,
        module_id: &str,
        action_id: &str,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let module = self.registry.get(module_id).ok_or_else(|| {
            ActionError::ModuleNotInstalled {
                module_id: module_id.to_string(),
            }
        })?;
        if !module.enabled || module.archived {
            return Err(ActionError::ModuleDisabled {
                module_id: module_id.to_string(),
            });
        }
        let manifest_hash = module.current_hash.clone().unwrap_or_default();
        let compiled = self.registry.compiled(module_id)?;
        let action = compiled
            .actions
            .get(action_id)
            .ok_or_else(|| ActionError::ActionNotFound {
                module_id: module_id.to_string(),
                action_id: action_id.to_string(),
            })?
            .clone();

        self.check_gates(&action, ctx)?;

        if !action.kind.is_write() {
            return self.run_navigation(&compiled, &action, ctx, &manifest_hash);
        }

        let entity_id = action.entity_id.clone().ok_or_else(|| {
            ActionError::ContextInvalid {
                detail: format!("action {action_id} has no entity binding"),
            }
        })?;
        let (owning, entity) = self.find_entity(&compiled, &entity_id)?;
        let workflow = owning.workflow_for(&entity_id).cloned();

        match action.kind {
            ActionKind::CreateRecord => {
                self.run_create(&compiled, &action, &entity, ctx, &manifest_hash)
            }
            ActionKind::UpdateRecord => self.run_update(
                &compiled,
                &action,
                &entity,
                workflow.as_ref(),
                ctx,
                &manifest_hash,
            ),
            ActionKind::BulkUpdate => self.run_bulk_update(
                &compiled,
                &action,
                &entity,
                workflow.as_ref(),
                ctx,
                &manifest_hash,
            ),
            _ => unreachable!("navigation kinds handled above"),
        }
    }

    // -- gates --------------------------------------------------------------

    fn check_gates(&self, action: &ActionDef, ctx: &ActionContext) -> Result<(), ActionError> {
        let record_ctx = self.condition_record(action, ctx);
        let eval_ctx = json!({"record": record_ctx});
        for gate in [&action.enabled_when, &action.visible_when] {
            let Some(cond) = gate else {
                continue;
            };
            match eval_condition(cond, &eval_ctx) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(ActionError::ActionDisabled {
                        action_id: action.id.clone(),
                    });
                }
                Err(err) => {
                    return Err(ActionError::ConditionInvalid {
                        message: err.message,
                        path: err.path,
                    });
                }
            }
        }
        Ok(())
    }

    fn condition_record(&self, action: &ActionDef, ctx: &ActionContext) -> Value {
        if let Some(draft) = &ctx.record_draft {
            return draft.clone();
        }
        if let (Some(entity_id), Some(record_id)) = (&action.entity_id, &ctx.record_id) {
            if let Some(record) = self.records.get(&self.workspace, entity_id, record_id) {
                return record;
            }
        }
        json!({})
    }

    // -- navigation ---------------------------------------------------------

    fn run_navigation(
        &self,
        compiled: &CompiledManifest,
        action: &ActionDef,
        ctx: &ActionContext,
        manifest_hash: &str,
    ) -> Result<ActionOutcome, ActionError> {
        let events = self.emit_action_clicked(compiled, action, ctx, manifest_hash, None)?;
        Ok(ActionOutcome {
            kind: action.kind.as_str().to_string(),
            target: action.target.clone(),
            events_enqueued: events,
            ..ActionOutcome::default()
        })
    }

    // -- create -------------------------------------------------------------

    fn run_create(
        &self,
        compiled: &CompiledManifest,
        action: &ActionDef,
        entity: &EntityDef,
        ctx: &ActionContext,
        manifest_hash: &str,
    ) -> Result<ActionOutcome, ActionError> {
        let mut data = action.defaults.clone();
        if let Some(draft) = ctx.record_draft.as_ref().and_then(Value::as_object) {
            for (key, value) in draft {
                data.insert(key.clone(), value.clone());
            }
        }
        let data = Value::Object(data);

        let issues = validate_record_data(
            entity,
            &data,
            &data,
            ValidationMode::Create,
            &self.lookup_resolver(),
        );
        if !issues.is_empty() {
            return Err(ActionError::Validation { issues });
        }

        // Write phase: record, then system chatter, inside one logical
        // transaction. Events stay pending until after.
        let (record_id, record) = self.records.create(&self.workspace, &entity.id, &data);
        self.chatter.add(
            &self.workspace,
            &entity.id,
            &record_id,
            "system",
            "Record created",
            ctx.actor.clone(),
        );

        let mut events = Vec::new();
        let payload = json!({
            "entity_id": entity.id,
            "record_id": record_id,
            "record": record,
        });
        self.push_event(&mut events, compiled, RECORD_CREATED, &payload, ctx, manifest_hash)?;
        events.extend(self.emit_action_clicked(
            compiled,
            action,
            ctx,
            manifest_hash,
            Some(&record_id),
        )?);

        self.record_activity(compiled, entity, &record_id, &[], ctx);
        self.invalidate_record_caches(&entity.id, Some(&record_id));

        Ok(ActionOutcome {
            kind: action.kind.as_str().to_string(),
            record_id: Some(record_id),
            record: Some(record),
            events_enqueued: events,
            ..ActionOutcome::default()
        })
    }

    // -- update -------------------------------------------------------------

    fn build_patch(&self, action: &ActionDef, ctx: &ActionContext) -> Map<String, Value> {
        let mut patch = action.patch.clone();
        if let Some(draft) = ctx.record_draft.as_ref().and_then(Value::as_object) {
            for (key, value) in draft {
                patch.insert(key.clone(), value.clone());
            }
        }
        patch.remove("id");
        patch
    }

    /// Validate one update without writing. Returns `(updated, changes)`.
    fn plan_update(
        &self,
        entity: &EntityDef,
        workflow: Option<&WorkflowDef>,
        record_id: &str,
        patch: &Map<String, Value>,
    ) -> Result<(Value, Vec<RecordChange>), ActionError> {
        let existing = self
            .records
            .get(&self.workspace, &entity.id, record_id)
            .ok_or_else(|| ActionError::RecordNotFound {
                entity_id: entity.id.clone(),
                record_id: record_id.to_string(),
            })?;

        let mut updated = existing.as_object().cloned().unwrap_or_default();
        for (key, value) in patch {
            updated.insert(key.clone(), value.clone());
        }
        let updated = Value::Object(updated);

        let mut issues = validate_record_data(
            entity,
            &Value::Object(patch.clone()),
            &existing,
            ValidationMode::Update,
            &self.lookup_resolver(),
        );
        if let Some(workflow) = workflow {
            issues.extend(check_state_requirements(workflow, &updated));
        }
        if !issues.is_empty() {
            return Err(ActionError::Validation { issues });
        }

        let changes = patch
            .iter()
            .filter(|(key, value)| existing.get(key.as_str()) != Some(*value))
            .map(|(key, value)| RecordChange {
                field_id: key.clone(),
                from: existing.get(key.as_str()).cloned().unwrap_or(Value::Null),
                to: value.clone(),
            })
            .collect();

        Ok((updated, changes))
    }

    fn run_update(
        &self,
        compiled: &CompiledManifest,
        action: &ActionDef,
        entity: &EntityDef,
        workflow: Option<&WorkflowDef>,
        ctx: &ActionContext,
        manifest_hash: &str,
    ) -> Result<ActionOutcome, ActionError> {
        let record_id = ctx.record_id.clone().ok_or_else(|| ActionError::ContextInvalid {
            detail: "update_record requires record_id".into(),
        })?;
        let patch = self.build_patch(action, ctx);
        let (_, changes) = self.plan_update(entity, workflow, &record_id, &patch)?;

        let record = self
            .records
            .update(&self.workspace, &entity.id, &record_id, &Value::Object(patch.clone()))
            .map_err(|err| ActionError::RecordWriteFailed {
                detail: err.to_string(),
            })?;
        self.chatter.add(
            &self.workspace,
            &entity.id,
            &record_id,
            "system",
            "Record updated",
            ctx.actor.clone(),
        );

        let events = self.emit_update_events(
            compiled,
            action,
            entity,
            workflow,
            &record_id,
            &record,
            &changes,
            ctx,
            manifest_hash,
        )?;
        self.record_activity(compiled, entity, &record_id, &changes, ctx);
        self.invalidate_record_caches(&entity.id, Some(&record_id));

        Ok(ActionOutcome {
            kind: action.kind.as_str().to_string(),
            record_id: Some(record_id),
            record: Some(record),
            events_enqueued: events,
            ..ActionOutcome::default()
        })
    }

    fn run_bulk_update(
        &self,
        compiled: &CompiledManifest,
        action: &ActionDef,
        entity: &EntityDef,
        workflow: Option<&WorkflowDef>,
        ctx: &ActionContext,
        manifest_hash: &str,
    ) -> Result<ActionOutcome, ActionError> {
        if ctx.selected_ids.is_empty() {
            return Err(ActionError::ContextInvalid {
                detail: "bulk_update requires selected_ids".into(),
            });
        }
        let patch = self.build_patch(action, ctx);

        // Validate every record before writing any: the bulk scope is one
        // transaction.
        let mut planned = Vec::with_capacity(ctx.selected_ids.len());
        for record_id in &ctx.selected_ids {
            let (_, changes) = self.plan_update(entity, workflow, record_id, &patch)?;
            planned.push((record_id.clone(), changes));
        }

        let mut events = Vec::new();
        let mut updated_ids = Vec::with_capacity(planned.len());
        for (record_id, changes) in &planned {
            let record = self
                .records
                .update(&self.workspace, &entity.id, record_id, &Value::Object(patch.clone()))
                .map_err(|err| ActionError::RecordWriteFailed {
                    detail: err.to_string(),
                })?;
            self.chatter.add(
                &self.workspace,
                &entity.id,
                record_id,
                "system",
                "Record updated",
                ctx.actor.clone(),
            );
            events.extend(self.emit_update_events(
                compiled,
                action,
                entity,
                workflow,
                record_id,
                &record,
                changes,
                ctx,
                manifest_hash,
            )?);
            self.record_activity(compiled, entity, record_id, changes, ctx);
            updated_ids.push(record_id.clone());
        }

        events.extend(self.emit_action_clicked(compiled, action, ctx, manifest_hash, None)?);
        self.invalidate_record_caches(&entity.id, None);

        Ok(ActionOutcome {
            kind: action.kind.as_str().to_string(),
            updated_ids,
            events_enqueued: events,
            ..ActionOutcome::default()
        })
    }

    // -- events -------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn emit_update_events(
        &self,
        compiled: &CompiledManifest,
        action: &ActionDef,
        entity: &EntityDef,
        workflow: Option<&WorkflowDef>,
        record_id: &str,
        record: &Value,
        changes: &[RecordChange],
        ctx: &ActionContext,
        manifest_hash: &str,
    ) -> Result<Vec<String>, ActionError> {
        let mut events = Vec::new();

        let payload = json!({
            "entity_id": entity.id,
            "record_id": record_id,
            "changes": changes
                .iter()
                .map(|c| json!({"field_id": c.field_id, "from": c.from, "to": c.to}))
                .collect::<Vec<_>>(),
            "record": record,
        });
        self.push_event(&mut events, compiled, RECORD_UPDATED, &payload, ctx, manifest_hash)?;

        if let Some(workflow) = workflow {
            if let Some(change) = changes.iter().find(|c| c.field_id == workflow.status_field) {
                let payload = json!({
                    "entity_id": entity.id,
                    "record_id": record_id,
                    "field_id": workflow.status_field,
                    "from": change.from,
                    "to": change.to,
                });
                self.push_event(
                    &mut events,
                    compiled,
                    WORKFLOW_STATUS_CHANGED,
                    &payload,
                    ctx,
                    manifest_hash,
                )?;
            }
        }

        if action.kind == ActionKind::UpdateRecord {
            events.extend(self.emit_action_clicked(
                compiled,
                action,
                ctx,
                manifest_hash,
                Some(record_id),
            )?);
        }
        Ok(events)
    }

    fn emit_action_clicked(
        &self,
        compiled: &CompiledManifest,
        action: &ActionDef,
        ctx: &ActionContext,
        manifest_hash: &str,
        record_id: Option<&str>,
    ) -> Result<Vec<String>, ActionError> {
        let payload = json!({
            "action_id": action.id,
            "module_id": compiled.module_id,
            "record_id": record_id,
        });
        let mut events = Vec::new();
        self.push_event(&mut events, compiled, ACTION_CLICKED, &payload, ctx, manifest_hash)?;

        // Per-action namespaced variant for local subscribers.
        let name = format!("{}.action.{}.clicked", compiled.module_slug, action.id);
        let envelope = self.build_event(&compiled.module_id, &name, &payload, ctx, manifest_hash)?;
        self.publish(&envelope, &mut events);
        Ok(events)
    }

    fn push_event(
        &self,
        events: &mut Vec<String>,
        compiled: &CompiledManifest,
        name: &str,
        payload: &Value,
        ctx: &ActionContext,
        manifest_hash: &str,
    ) -> Result<(), ActionError> {
        let envelope = self.build_event(&compiled.module_id, name, payload, ctx, manifest_hash)?;
        self.publish(&envelope, events);

        let namespaced = format!("{}.{name}", compiled.module_slug);
        let envelope =
            self.build_event(&compiled.module_id, &namespaced, payload, ctx, manifest_hash)?;
        self.publish(&envelope, events);
        Ok(())
    }

    fn build_event(
        &self,
        module_id: &str,
        name: &str,
        payload: &Value,
        ctx: &ActionContext,
        manifest_hash: &str,
    ) -> Result<EventEnvelope, ActionError> {
        Ok(make_event(
            name,
            payload.clone(),
            EventMetaInit {
                module_id: module_id.to_string(),
                manifest_hash: manifest_hash.to_string(),
                actor: actor_from_value(ctx.actor.as_ref()),
                trace_id: ctx.trace_id.clone(),
                ..EventMetaInit::default()
            },
        )?)
    }

    fn publish(&self, envelope: &EventEnvelope, events: &mut Vec<String>) {
        if let Err(err) = self.bus.publish(envelope) {
            tracing::warn!(event = %envelope.name, error = %err, "event publish failed");
        } else {
            events.push(envelope.meta.event_id.clone());
        }
    }

    // -- activity & caches --------------------------------------------------

    fn record_activity(
        &self,
        compiled: &CompiledManifest,
        entity: &EntityDef,
        record_id: &str,
        changes: &[RecordChange],
        ctx: &ActionContext,
    ) {
        let Some(view) = compiled.form_view_for(&entity.id) else {
            return;
        };
        if !view.activity_enabled || changes.is_empty() {
            return;
        }
        let tracked: Vec<Value> = changes
            .iter()
            .filter(|c| view.tracked_fields.is_empty() || view.tracked_fields.contains(&c.field_id))
            .map(|c| json!({"field_id": c.field_id, "from": c.from, "to": c.to}))
            .collect();
        if tracked.is_empty() {
            return;
        }
        self.activity.add_change(
            &self.workspace,
            &entity.id,
            record_id,
            Value::Array(tracked),
            ctx.actor.as_ref(),
        );
    }

    fn invalidate_record_caches(&self, entity_id: &str, record_id: Option<&str>) {
        let mut prefixes = vec![
            format!("records:list:{}:{entity_id}", self.workspace),
            format!("lookup:{}:{entity_id}", self.workspace),
            format!("chatter:{}:{entity_id}", self.workspace),
            format!("bootstrap:{}", self.workspace),
        ];
        if let Some(record_id) = record_id {
            prefixes.push(format!("records:get:{}:{entity_id}:{record_id}", self.workspace));
        } else {
            prefixes.push(format!("records:get:{}:{entity_id}", self.workspace));
        }
        let refs: Vec<&str> = prefixes.iter().map(String::as_str).collect();
        self.cache.invalidate_prefixes(&refs);
    }

    // -- entity resolution --------------------------------------------------

    /// Locate an entity definition: the executing module first, then every
    /// other enabled module.
    fn find_entity(
        &self,
        compiled: &CompiledManifest,
        entity_id: &str,
    ) -> Result<(CompiledManifest, EntityDef), ActionError> {
        if let Some(entity) = compiled.entities.get(entity_id) {
            return Ok((compiled.clone(), entity.clone()));
        }
        for module in self.registry.list() {
            if !module.enabled || module.module_id == compiled.module_id {
                continue;
            }
            if let Ok(other) = self.registry.compiled(&module.module_id) {
                if let Some(entity) = other.entities.get(entity_id) {
                    let entity = entity.clone();
                    return Ok((other, entity));
                }
            }
        }
        Err(ActionError::EntityNotFound {
            entity_id: entity_id.to_string(),
        })
    }

    fn lookup_resolver(&self) -> impl mantle_records::LookupResolver + '_ {
        move |entity_id: &str, record_id: &str| {
            self.records.get(&self.workspace, entity_id, record_id)
        }
    }
}

/// Workflow state `required_fields` must be present on the updated record.
fn check_state_requirements(workflow: &WorkflowDef, updated: &Value) -> Vec<Issue> {
    let mut issues = Vec::new();
    let Some(state_id) = updated.get(&workflow.status_field).and_then(Value::as_str) else {
        return issues;
    };
    let Some(state) = workflow.state(state_id) else {
        return issues;
    };
    for field_id in &state.required_fields {
        let present = updated.get(field_id).is_some_and(|v| !v.is_null());
        if !present {
            issues.push(
                Issue::at(
                    "VALIDATION_STATE_REQUIRED_MISSING",
                    format!("state {state_id:?} requires {field_id}"),
                    field_id.clone(),
                )
                .with_detail(json!({"state": state_id})),
            );
        }
    }
    issues
}

/// Derive an event actor from a loose boundary actor object.
fn actor_from_value(actor: Option<&Value>) -> Option<Actor> {
    let map = actor?.as_object()?;
    let id = ["user_id", "id", "sub"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))?
        .to_string();
    let roles = map
        .get("roles")
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .or_else(|| {
            map.get("role")
                .and_then(Value::as_str)
                .map(|role| vec![role.to_string()])
        })
        .unwrap_or_default();
    Some(Actor { id, roles })
}
