// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workflow instances: explicit state-machine executions with history.
//!
//! A workflow definition here is richer than the manifest's status-field
//! workflow: it carries `transitions` with guards (condition ASTs over the
//! caller's vars), declared action refs, and events to emit. One step
//! application plans the eligible transition, applies it with the declared
//! actions inside a transaction, and emits the transition's events
//! post-commit. No transition eligible is a successful no-op that never
//! opens a transaction.

use crate::exec::{PlanDeps, execute_plan};
use crate::plan::{PlanContext, plan_action};
use mantle_condition::eval_condition_strict;
use mantle_events::{EventMetaInit, make_event};
use mantle_manifest::Issue;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// One applied (or attempted) transition in an instance's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HistoryEntry {
    /// Timestamp.
    pub at: String,
    /// Acting principal.
    #[serde(default)]
    pub actor: Option<Value>,
    /// State before.
    pub from_state: String,
    /// State after.
    pub to_state: String,
    /// The transition that fired (`init` for creation).
    pub transition_id: String,
    /// Action refs executed with the transition.
    pub actions: Vec<String>,
    /// Events emitted with the transition.
    pub events: Vec<Value>,
    /// `applied` for committed entries.
    pub status: String,
    /// Free-form detail.
    #[serde(default)]
    pub detail: Option<Value>,
}

/// A live state-machine execution bound to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowInstance {
    /// Instance id.
    pub instance_id: String,
    /// Owning module.
    pub module_id: String,
    /// Workflow definition id.
    pub workflow_id: String,
    /// The record the instance tracks, if any.
    #[serde(default)]
    pub record_ref: Option<Value>,
    /// Current state id.
    pub current_state: String,
    /// Creation timestamp.
    pub created_at: String,
    /// Last transition timestamp.
    pub updated_at: String,
    /// Applied transitions, oldest first.
    pub history: Vec<HistoryEntry>,
}

/// In-memory workflow instance store, workspace-scoped.
#[derive(Debug, Default)]
pub struct WorkflowInstanceStore {
    instances: Mutex<BTreeMap<(String, String), WorkflowInstance>>,
}

impl WorkflowInstanceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an instance in its initial state, with an `init` history
    /// entry.
    pub fn create_instance(
        &self,
        workspace: &str,
        module_id: &str,
        workflow_id: &str,
        initial_state: &str,
        record_ref: Option<Value>,
        actor: Option<Value>,
        reason: &str,
    ) -> WorkflowInstance {
        let ts = now();
        let instance = WorkflowInstance {
            instance_id: Uuid::new_v4().to_string(),
            module_id: module_id.to_string(),
            workflow_id: workflow_id.to_string(),
            record_ref,
            current_state: initial_state.to_string(),
            created_at: ts.clone(),
            updated_at: ts.clone(),
            history: vec![HistoryEntry {
                at: ts,
                actor,
                from_state: initial_state.to_string(),
                to_state: initial_state.to_string(),
                transition_id: "init".into(),
                actions: Vec::new(),
                events: Vec::new(),
                status: "applied".into(),
                detail: Some(json!({"reason": reason})),
            }],
        };
        self.instances
            .lock()
            .expect("instances poisoned")
            .insert(
                (workspace.to_string(), instance.instance_id.clone()),
                instance.clone(),
            );
        instance
    }

    /// Fetch an instance.
    #[must_use]
    pub fn get_instance(&self, workspace: &str, instance_id: &str) -> Option<WorkflowInstance> {
        self.instances
            .lock()
            .expect("instances poisoned")
            .get(&(workspace.to_string(), instance_id.to_string()))
            .cloned()
    }

    /// Replace a stored instance.
    pub fn update_instance(&self, workspace: &str, instance: &WorkflowInstance) {
        self.instances.lock().expect("instances poisoned").insert(
            (workspace.to_string(), instance.instance_id.clone()),
            instance.clone(),
        );
    }

    /// Instances for a module, optionally filtered by workflow id.
    #[must_use]
    pub fn list_instances(
        &self,
        workspace: &str,
        module_id: &str,
        workflow_id: Option<&str>,
    ) -> Vec<WorkflowInstance> {
        self.instances
            .lock()
            .expect("instances poisoned")
            .iter()
            .filter(|((ws, _), instance)| {
                ws == workspace
                    && instance.module_id == module_id
                    && workflow_id.is_none_or(|id| instance.workflow_id == id)
            })
            .map(|(_, instance)| instance.clone())
            .collect()
    }
}

/// The planned outcome of one step: which transition fires, where it
/// lands, and what it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    /// Fired transition id; `None` means nothing is eligible.
    pub chosen_transition_id: Option<String>,
    /// State the plan starts from.
    pub current_state: String,
    /// State the transition lands in.
    pub next_state: Option<String>,
    /// Action refs to execute with the transition.
    pub actions: Vec<String>,
    /// Events (`{name, payload}`) to emit post-commit.
    pub events: Vec<Value>,
}

/// Plan one workflow step: the first transition out of `current_state`
/// whose guard passes (guards evaluate strictly over the caller's vars).
///
/// # Errors
///
/// `CONDITION_INVALID` issues for unevaluable guards,
/// `WORKFLOW_INVALID` for malformed definitions.
pub fn plan_transition(
    workflow: &Value,
    current_state: &str,
    ctx: &PlanContext,
) -> Result<TransitionPlan, Vec<Issue>> {
    let mut errors = Vec::new();
    let Some(transitions) = workflow.get("transitions").and_then(Value::as_array) else {
        return Ok(TransitionPlan {
            chosen_transition_id: None,
            current_state: current_state.to_string(),
            next_state: None,
            actions: Vec::new(),
            events: Vec::new(),
        });
    };

    for (idx, transition) in transitions.iter().enumerate() {
        let path = format!("transitions[{idx}]");
        let Some(map) = transition.as_object() else {
            errors.push(Issue::at("WORKFLOW_INVALID", "transition must be an object", path));
            continue;
        };
        if map.get("from").and_then(Value::as_str) != Some(current_state) {
            continue;
        }
        if let Some(guard) = map.get("guard").filter(|g| !g.is_null()) {
            match eval_condition_strict(guard, &ctx.vars) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    errors.push(
                        Issue::at("CONDITION_INVALID", err.message, format!("{path}.guard"))
                            .with_detail(json!({"path": err.path})),
                    );
                    return Err(errors);
                }
            }
        }
        let Some(to) = map.get("to").and_then(Value::as_str) else {
            errors.push(Issue::at(
                "WORKFLOW_INVALID",
                "transition.to must be a string",
                format!("{path}.to"),
            ));
            return Err(errors);
        };
        return Ok(TransitionPlan {
            chosen_transition_id: map
                .get("id")
                .and_then(Value::as_str)
                .map(String::from)
                .or_else(|| Some(format!("transition_{idx}"))),
            current_state: current_state.to_string(),
            next_state: Some(to.to_string()),
            actions: map
                .get("actions")
                .and_then(Value::as_array)
                .map(|actions| {
                    actions
                        .iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            events: map
                .get("emits")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        });
    }

    if errors.is_empty() {
        Ok(TransitionPlan {
            chosen_transition_id: None,
            current_state: current_state.to_string(),
            next_state: None,
            actions: Vec::new(),
            events: Vec::new(),
        })
    } else {
        Err(errors)
    }
}

/// Dependencies for [`apply_workflow_step`].
pub struct WorkflowDeps<'a> {
    /// Instance storage.
    pub store: &'a WorkflowInstanceStore,
    /// Planning/execution collaborators for transition actions.
    pub plan: PlanDeps<'a>,
    /// Action declarations referenced by transitions, keyed by id.
    pub action_decls: &'a BTreeMap<String, Value>,
}

/// Result of one workflow step application.
#[derive(Debug, Clone, Default)]
pub struct WorkflowStepOutcome {
    /// Hard failures; non-empty means nothing was applied.
    pub errors: Vec<Issue>,
    /// Advisory warnings.
    pub warnings: Vec<Issue>,
    /// The updated instance, when the step was applied (or unchanged when
    /// no transition was eligible).
    pub instance: Option<WorkflowInstance>,
    /// The transition that fired.
    pub transition_id: Option<String>,
    /// Outputs of the transition's actions, keyed by action ref.
    pub action_results: Map<String, Value>,
    /// Event ids enqueued post-commit.
    pub events_enqueued: Vec<String>,
}

impl WorkflowStepOutcome {
    /// Whether the step applied (or was a clean no-op).
    #[must_use]
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn failed(errors: Vec<Issue>, warnings: Vec<Issue>) -> Self {
        Self {
            errors,
            warnings,
            ..Self::default()
        }
    }
}

/// Apply one workflow step to an instance.
///
/// Plans the eligible transition, mutates the instance (state + history),
/// plans and executes every declared action, and commits — any failure
/// rolls the transaction back and leaves the stored instance untouched.
/// The transition's events are emitted to the outbox after commit.
#[must_use]
pub fn apply_workflow_step(
    workspace: &str,
    workflow: &Value,
    instance_id: &str,
    ctx: &PlanContext,
    deps: &WorkflowDeps<'_>,
) -> WorkflowStepOutcome {
    let mut warnings = Vec::new();

    let Some(mut instance) = deps.store.get_instance(workspace, instance_id) else {
        return WorkflowStepOutcome::failed(
            vec![Issue::at(
                "WORKFLOW_INSTANCE_NOT_FOUND",
                "instance not found",
                "instance_id",
            )],
            warnings,
        );
    };

    let plan = match plan_transition(workflow, &instance.current_state, ctx) {
        Ok(plan) => plan,
        Err(errors) => return WorkflowStepOutcome::failed(errors, warnings),
    };
    let Some(transition_id) = plan.chosen_transition_id.clone() else {
        // Nothing eligible: a clean no-op, no transaction opened.
        return WorkflowStepOutcome {
            instance: Some(instance),
            ..WorkflowStepOutcome::default()
        };
    };
    let next_state = plan.next_state.clone().unwrap_or_else(|| plan.current_state.clone());

    let mut tx = deps.plan.tx.begin();
    let mut action_results: Map<String, Value> = Map::new();

    instance.updated_at = now();
    instance.history.push(HistoryEntry {
        at: instance.updated_at.clone(),
        actor: ctx.actor.clone(),
        from_state: plan.current_state.clone(),
        to_state: next_state.clone(),
        transition_id: transition_id.clone(),
        actions: plan.actions.clone(),
        events: plan.events.clone(),
        status: "applied".into(),
        detail: None,
    });
    instance.current_state = next_state;

    for action_ref in &plan.actions {
        let Some(decl) = deps.action_decls.get(action_ref) else {
            tx.rollback();
            return WorkflowStepOutcome::failed(
                vec![
                    Issue::at(
                        "WORKFLOW_ACTION_DECL_MISSING",
                        format!("no declaration for {action_ref}"),
                        "$.actions",
                    ),
                ],
                warnings,
            );
        };
        let planned = plan_action(decl, &json!({}), ctx);
        let Some(action_plan) = planned.plan else {
            tx.rollback();
            let mut errors = vec![Issue::at(
                "WORKFLOW_ACTION_PLAN_FAILED",
                format!("planning {action_ref} failed"),
                "$.actions",
            )];
            errors.extend(planned.errors);
            return WorkflowStepOutcome::failed(errors, warnings);
        };
        warnings.extend(planned.warnings);

        let executed = execute_plan(&action_plan, ctx, &deps.plan);
        if !executed.ok() {
            tx.rollback();
            let mut errors = vec![Issue::at(
                "WORKFLOW_ACTION_EXEC_FAILED",
                format!("executing {action_ref} failed"),
                "$.actions",
            )];
            errors.extend(executed.errors);
            return WorkflowStepOutcome::failed(errors, warnings);
        }
        warnings.extend(executed.warnings);
        action_results.insert(action_ref.clone(), Value::Object(executed.result));
    }

    tx.commit();

    let Some(manifest_hash) = ctx.manifest_hash.clone() else {
        return WorkflowStepOutcome::failed(
            vec![Issue::at(
                "WORKFLOW_CTX_INVALID",
                "ctx.manifest_hash required",
                "ctx.manifest_hash",
            )],
            warnings,
        );
    };

    let mut events_enqueued = Vec::new();
    for event in &plan.events {
        let Some(name) = event.get("name").and_then(Value::as_str) else {
            continue;
        };
        let payload = event.get("payload").cloned().unwrap_or_else(|| json!({}));
        let envelope = make_event(
            name,
            payload,
            EventMetaInit {
                module_id: ctx.module_id.clone(),
                manifest_hash: manifest_hash.clone(),
                actor: crate::exec::actor_from_ctx(ctx),
                trace_id: ctx.trace_id.clone(),
                ..EventMetaInit::default()
            },
        );
        match envelope {
            Ok(envelope) => {
                let event_id = envelope.meta.event_id.clone();
                if let Some(outbox) = deps.plan.outbox {
                    if outbox.enqueue(envelope).is_ok() {
                        events_enqueued.push(event_id);
                    }
                }
            }
            Err(err) => {
                return WorkflowStepOutcome::failed(
                    vec![Issue::at("WORKFLOW_EVENT_INVALID", err.to_string(), "$.emits")],
                    warnings,
                );
            }
        }
    }

    deps.store.update_instance(workspace, &instance);

    WorkflowStepOutcome {
        errors: Vec::new(),
        warnings,
        instance: Some(instance),
        transition_id: Some(transition_id),
        action_results,
        events_enqueued,
    }
}
