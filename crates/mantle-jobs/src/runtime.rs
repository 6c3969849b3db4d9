// SPDX-License-Identifier: MIT OR Apache-2.0
//! Automation run advancement.
//!
//! One invocation advances a run by as many steps as it can within a
//! worker cycle. Delay steps and retries return control to the queue by
//! re-enqueueing `automation.run` with a future `run_at`; attempt-scoped
//! idempotency keys make duplicate cycles harmless.

use crate::store::EnqueueJob;
use crate::worker::Services;
use anyhow::{Context, bail};
use chrono::{DateTime, Duration, Utc};
use mantle_actions::ActionContext;
use mantle_automation::{RunStatus, Step, StepRun, StepRunStatus};
use mantle_condition::eval_condition;
use mantle_mail::{resolve_recipients, split_recipients};
use mantle_manifest::EntityDef;
use mantle_render::render_template;
use serde_json::{Map, Value, json};

/// Upper bound on steps executed in one cycle; bounds backward-goto loops.
pub const MAX_STEPS_PER_CYCLE: usize = 100;

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Re-enqueue a failed (or cancelled) run. The run resumes at the step it
/// stopped on.
///
/// # Errors
///
/// Store failures (unknown run).
pub fn retry_run(
    services: &Services,
    workspace: &str,
    run_id: &str,
) -> anyhow::Result<crate::store::Job> {
    let run = services.automations.reset_run_for_retry(workspace, run_id)?;
    Ok(services.jobs.enqueue(EnqueueJob::new(
        workspace,
        "automation.run",
        json!({"run_id": run.id}),
    )))
}

/// Advance an automation run by one worker cycle.
///
/// # Errors
///
/// Infrastructure failures only; step failures are recorded on the run
/// and its step runs rather than propagated.
pub fn run_automation(services: &Services, workspace: &str, run_id: &str) -> anyhow::Result<()> {
    let store = &services.automations;
    let Some(run) = store.get_run(workspace, run_id) else {
        bail!("automation run not found: {run_id}");
    };
    if run.status.is_terminal() {
        return Ok(());
    }
    let Some(automation) = store.get(workspace, &run.automation_id) else {
        store.update_run(workspace, run_id, |run| {
            run.status = RunStatus::Failed;
            run.last_error = Some("automation not found".into());
            run.ended_at = Some(timestamp());
        })?;
        return Ok(());
    };

    let steps = automation.steps;
    let ctx = json!({"trigger": run.trigger_payload});

    if run.status != RunStatus::Running {
        store.update_run(workspace, run_id, |run| {
            run.status = RunStatus::Running;
            if run.started_at.is_none() {
                run.started_at = Some(timestamp());
            }
        })?;
    }

    let mut index = run.current_step_index;
    let mut executed = 0usize;

    while index < steps.len() {
        // A cancel can land between cycles and also mid-cycle.
        if let Some(current) = store.get_run(workspace, run_id) {
            if current.status.is_terminal() {
                return Ok(());
            }
        }
        executed += 1;
        if executed > MAX_STEPS_PER_CYCLE {
            store.update_run(workspace, run_id, |run| {
                run.status = RunStatus::Failed;
                run.last_error = Some("AUTOMATION_STEP_LIMIT exceeded".into());
                run.ended_at = Some(timestamp());
            })?;
            return Ok(());
        }

        let step = &steps[index];
        let step_id = step.id_or_index(index);
        let attempt = failed_attempts(store.list_step_runs(workspace, run_id), &step_id);
        let idempotency_key = format!("{run_id}:{step_id}:{attempt}");

        // A succeeded execution with this exact key means a duplicate
        // cycle: skip and advance.
        if let Some(existing) = store.step_run_by_idempotency(workspace, &idempotency_key) {
            if existing.status == StepRunStatus::Succeeded {
                index += 1;
                store.update_run(workspace, run_id, |run| run.current_step_index = index)?;
                continue;
            }
        }

        let step_run = store.create_step_run(
            workspace,
            run_id,
            index,
            &step_id,
            attempt,
            &idempotency_key,
            serde_json::to_value(step).unwrap_or(Value::Null),
        );

        match execute_step(services, workspace, step, &ctx, &idempotency_key, steps.len()) {
            Ok(StepOutcome::Completed(output)) => {
                store.finish_step_run(
                    workspace,
                    &step_run.id,
                    StepRunStatus::Succeeded,
                    Some(output),
                    None,
                );
                index += 1;
                store.update_run(workspace, run_id, |run| run.current_step_index = index)?;
            }
            Ok(StepOutcome::Goto(target, output)) => {
                store.finish_step_run(
                    workspace,
                    &step_run.id,
                    StepRunStatus::Succeeded,
                    Some(output),
                    None,
                );
                store.update_run(workspace, run_id, |run| run.current_step_index = target)?;
                return Ok(());
            }
            Ok(StepOutcome::Delayed(delay_seconds)) => {
                store.finish_step_run(
                    workspace,
                    &step_run.id,
                    StepRunStatus::Succeeded,
                    Some(json!({"delay_seconds": delay_seconds})),
                    None,
                );
                let next_index = index + 1;
                store.update_run(workspace, run_id, |run| {
                    run.status = RunStatus::Queued;
                    run.current_step_index = next_index;
                })?;
                services.jobs.enqueue(
                    EnqueueJob::new(workspace, "automation.run", json!({"run_id": run_id}))
                        .idempotent(format!("{run_id}:{next_index}:delay"))
                        .at(now() + Duration::seconds(delay_seconds)),
                );
                return Ok(());
            }
            Err(err) => {
                let message = err.to_string();
                store.finish_step_run(
                    workspace,
                    &step_run.id,
                    StepRunStatus::Failed,
                    None,
                    Some(message.clone()),
                );
                if let Some(policy) = step.retry_policy() {
                    if attempt + 1 < policy.max_attempts {
                        store.update_run(workspace, run_id, |run| {
                            run.status = RunStatus::Queued;
                            run.current_step_index = index;
                        })?;
                        services.jobs.enqueue(
                            EnqueueJob::new(workspace, "automation.run", json!({"run_id": run_id}))
                                .idempotent(format!("{run_id}:{step_id}:{}", attempt + 1))
                                .at(now() + Duration::seconds(i64::from(policy.backoff_seconds))),
                        );
                        return Ok(());
                    }
                }
                store.update_run(workspace, run_id, |run| {
                    run.status = RunStatus::Failed;
                    run.last_error = Some(message.clone());
                    run.ended_at = Some(timestamp());
                })?;
                return Ok(());
            }
        }
    }

    store.update_run(workspace, run_id, |run| {
        run.status = RunStatus::Succeeded;
        run.ended_at = Some(timestamp());
    })?;
    Ok(())
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Attempt number = failed executions so far for this step.
fn failed_attempts(step_runs: Vec<StepRun>, step_id: &str) -> u32 {
    step_runs
        .iter()
        .filter(|sr| sr.step_id == step_id && sr.status == StepRunStatus::Failed)
        .count() as u32
}

enum StepOutcome {
    Completed(Value),
    Goto(usize, Value),
    Delayed(i64),
}

fn execute_step(
    services: &Services,
    workspace: &str,
    step: &Step,
    ctx: &Value,
    idempotency_key: &str,
    step_count: usize,
) -> anyhow::Result<StepOutcome> {
    match step {
        Step::Condition {
            expr,
            if_true_goto,
            if_false_goto,
            ..
        } => {
            let result = eval_condition(expr, ctx).map_err(|err| anyhow::anyhow!("{err}"))?;
            let goto = if result { *if_true_goto } else { *if_false_goto };
            let output = json!({"result": result});
            // Out-of-range targets fall through to the next step.
            match goto.filter(|target| *target < step_count) {
                Some(target) => Ok(StepOutcome::Goto(target, output)),
                None => Ok(StepOutcome::Completed(output)),
            }
        }
        Step::Delay { seconds, until, .. } => {
            let delay_seconds = match (seconds, until) {
                (Some(seconds), _) => (*seconds).max(0),
                (None, Some(until)) => {
                    let target = DateTime::parse_from_rfc3339(&until.replace('Z', "+00:00"))
                        .context("invalid delay 'until' timestamp")?;
                    (target.with_timezone(&Utc) - now()).num_seconds().max(0)
                }
                (None, None) => bail!("invalid delay step: seconds or until required"),
            };
            Ok(StepOutcome::Delayed(delay_seconds))
        }
        Step::Action {
            action_id,
            module_id,
            inputs,
            ..
        } => {
            let mut resolved = resolve_inputs(inputs, ctx)?;
            resolved.insert("idempotency_key".into(), json!(idempotency_key));
            let output = if action_id.starts_with("system.") {
                run_system_action(services, workspace, action_id, &resolved, ctx)?
            } else {
                run_module_action(services, action_id, module_id.as_deref(), &resolved)?
            };
            Ok(StepOutcome::Completed(output))
        }
    }
}

// ---------------------------------------------------------------------------
// Input resolution
// ---------------------------------------------------------------------------

fn resolve_inputs(inputs: &Map<String, Value>, ctx: &Value) -> anyhow::Result<Map<String, Value>> {
    let mut out = Map::new();
    for (key, value) in inputs {
        out.insert(key.clone(), resolve_value(value, ctx)?);
    }
    Ok(out)
}

fn resolve_value(value: &Value, ctx: &Value) -> anyhow::Result<Value> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(path)) = map.get("var") {
                    return Ok(mantle_condition::resolve_path(ctx, path)
                        .cloned()
                        .unwrap_or(Value::Null));
                }
            }
            let mut out = Map::new();
            for (key, nested) in map {
                out.insert(key.clone(), resolve_value(nested, ctx)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::String(text) if text.contains("{{") => {
            let rendered = render_template(text, ctx, true)
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(Value::String(rendered))
        }
        other => Ok(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// System actions
// ---------------------------------------------------------------------------

fn run_system_action(
    services: &Services,
    workspace: &str,
    action_id: &str,
    inputs: &Map<String, Value>,
    ctx: &Value,
) -> anyhow::Result<Value> {
    match action_id {
        "system.noop" => Ok(json!({"ok": true})),
        "system.fail" => bail!("forced failure"),
        "system.notify" => run_notify(services, workspace, inputs, ctx),
        "system.send_email" => run_send_email(services, workspace, inputs, ctx),
        "system.generate_document" => run_generate_document(services, workspace, inputs, ctx),
        other => bail!("unsupported system action: {other}"),
    }
}

fn run_notify(
    services: &Services,
    workspace: &str,
    inputs: &Map<String, Value>,
    ctx: &Value,
) -> anyhow::Result<Value> {
    let mut recipients: Vec<String> = Vec::new();
    if let Some(value) = inputs.get("recipient_user_ids") {
        recipients.extend(split_recipients(value));
    }
    if let Some(single) = inputs.get("recipient_user_id").and_then(Value::as_str) {
        if !single.trim().is_empty() {
            recipients.push(single.trim().to_string());
        }
    }
    recipients = mantle_mail::dedupe_recipients(recipients);
    if recipients.is_empty() {
        bail!("notification recipients not resolved");
    }

    let title = inputs
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Notification");
    let body = inputs.get("body").and_then(Value::as_str).unwrap_or("");
    let severity = inputs
        .get("severity")
        .and_then(Value::as_str)
        .unwrap_or("info");
    let link_to = inputs.get("link_to").and_then(Value::as_str);
    let source_event = ctx.get("trigger").cloned();

    let notifications: Vec<Value> = recipients
        .iter()
        .map(|recipient| {
            let notification = services.notifications.create(
                workspace,
                recipient,
                title,
                body,
                severity,
                link_to,
                source_event.clone(),
            );
            serde_json::to_value(notification).unwrap_or(Value::Null)
        })
        .collect();
    Ok(json!({"notifications": notifications}))
}

fn run_send_email(
    services: &Services,
    workspace: &str,
    inputs: &Map<String, Value>,
    ctx: &Value,
) -> anyhow::Result<Value> {
    // Connection resolution: explicit id, then the template's default,
    // then the workspace default.
    let template = match inputs.get("template_id").and_then(Value::as_str) {
        Some(template_id) => Some(
            services
                .email_templates
                .get(workspace, template_id)
                .with_context(|| format!("email template not found: {template_id}"))?,
        ),
        None => None,
    };
    let connection = inputs
        .get("connection_id")
        .and_then(Value::as_str)
        .and_then(|id| services.connections.get(workspace, id))
        .or_else(|| {
            template
                .as_ref()
                .and_then(|t| t.connection_id.as_deref())
                .and_then(|id| services.connections.get(workspace, id))
        })
        .or_else(|| services.connections.default_email(workspace));
    let Some(connection) = connection else {
        bail!("email connection not configured");
    };

    let entity_id = inputs
        .get("entity_id")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| trigger_str(ctx, "entity_id"));
    let record_id = inputs
        .get("record_id")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| trigger_str(ctx, "record_id"));

    let record_data = fetch_record_payload(services, workspace, entity_id.as_deref(), record_id.as_deref());
    let entity_def = entity_id.as_deref().and_then(|id| find_entity_def(services, id));

    let render_ctx = json!({
        "record": record_data,
        "entity_id": entity_id,
        "trigger": ctx.get("trigger").cloned().unwrap_or(Value::Null),
    });

    let subject = inputs
        .get("subject")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| template.as_ref().and_then(|t| t.subject.clone()));
    let Some(mut subject) = subject.filter(|s| !s.is_empty()) else {
        bail!("email subject required");
    };
    if subject.contains("{{") {
        subject = render_template(&subject, &render_ctx, true)
            .map_err(|err| anyhow::anyhow!("{err}"))?;
    }

    let mut body_html = inputs
        .get("body_html")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| template.as_ref().and_then(|t| t.body_html.clone()));
    if let Some(html) = &body_html {
        body_html = Some(
            render_template(html, &render_ctx, true).map_err(|err| anyhow::anyhow!("{err}"))?,
        );
    }
    let mut body_text = inputs
        .get("body_text")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| template.as_ref().and_then(|t| t.body_text.clone()));
    if let Some(text) = &body_text {
        body_text = Some(
            render_template(text, &render_ctx, true).map_err(|err| anyhow::anyhow!("{err}"))?,
        );
    }

    let fetch = |entity_id: &str, record_id: &str| -> Option<Value> {
        fetch_record_value(services, workspace, entity_id, record_id)
    };
    let recipients = resolve_recipients(
        inputs,
        &render_ctx,
        &record_data,
        entity_def.as_ref(),
        &fetch,
    );
    if recipients.is_empty() {
        bail!("email recipients not resolved");
    }

    let cc = inputs.get("cc").map(split_recipients).unwrap_or_default();
    let bcc = inputs.get("bcc").map(split_recipients).unwrap_or_default();
    let outbox = services.email_outbox.create(
        workspace,
        recipients,
        cc,
        bcc,
        connection.config.from_email.as_deref(),
        inputs.get("reply_to").and_then(Value::as_str),
        &subject,
        body_html.as_deref(),
        body_text.as_deref(),
        inputs.get("template_id").and_then(Value::as_str),
    );

    let mut enqueue = EnqueueJob::new(
        workspace,
        "email.send",
        json!({"outbox_id": outbox.id, "connection_id": connection.id}),
    );
    if let Some(key) = inputs.get("idempotency_key").and_then(Value::as_str) {
        enqueue = enqueue.idempotent(key);
    }
    let job = services.jobs.enqueue(enqueue);

    Ok(json!({"outbox_id": outbox.id, "job_id": job.id}))
}

fn run_generate_document(
    services: &Services,
    workspace: &str,
    inputs: &Map<String, Value>,
    ctx: &Value,
) -> anyhow::Result<Value> {
    let template_id = inputs
        .get("template_id")
        .and_then(Value::as_str)
        .context("template_id required")?;
    let entity_id = inputs
        .get("entity_id")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| trigger_str(ctx, "entity_id"))
        .context("entity_id required")?;
    let record_id = inputs
        .get("record_id")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| trigger_str(ctx, "record_id"))
        .context("record_id required")?;
    let purpose = inputs
        .get("purpose")
        .and_then(Value::as_str)
        .unwrap_or("generated");

    let mut enqueue = EnqueueJob::new(
        workspace,
        "doc.generate",
        json!({
            "template_id": template_id,
            "entity_id": entity_id,
            "record_id": record_id,
            "purpose": purpose,
        }),
    );
    if let Some(key) = inputs.get("idempotency_key").and_then(Value::as_str) {
        enqueue = enqueue.idempotent(key);
    }
    let job = services.jobs.enqueue(enqueue);
    Ok(json!({"job_id": job.id}))
}

fn run_module_action(
    services: &Services,
    action_id: &str,
    module_id: Option<&str>,
    inputs: &Map<String, Value>,
) -> anyhow::Result<Value> {
    let module_id = module_id
        .map(String::from)
        .or_else(|| {
            inputs
                .get("module_id")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .context("module_id required for module action")?;

    let ctx = ActionContext {
        record_id: inputs
            .get("record_id")
            .and_then(Value::as_str)
            .map(String::from),
        record_draft: inputs.get("record_draft").cloned(),
        selected_ids: inputs
            .get("selected_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        actor: Some(json!({"user_id": "system", "role": "system"})),
        trace_id: None,
    };

    let outcome = services
        .executor
        .run_action(&module_id, action_id, &ctx)
        .map_err(|err| anyhow::anyhow!("module action failed: {err}"))?;
    Ok(json!({
        "kind": outcome.kind,
        "record_id": outcome.record_id,
        "updated_ids": outcome.updated_ids,
        "events_enqueued": outcome.events_enqueued,
    }))
}

// ---------------------------------------------------------------------------
// Record / entity helpers
// ---------------------------------------------------------------------------

fn trigger_str(ctx: &Value, key: &str) -> Option<String> {
    ctx.get("trigger")
        .and_then(|t| t.get(key))
        .and_then(Value::as_str)
        .map(String::from)
}

/// Candidate entity ids: as given plus the other prefix form.
fn candidate_entity_ids(entity_id: &str) -> Vec<String> {
    match entity_id.strip_prefix("entity.") {
        Some(slug) => vec![entity_id.to_string(), slug.to_string()],
        None => vec![entity_id.to_string(), format!("entity.{entity_id}")],
    }
}

pub(crate) fn fetch_record_value(
    services: &Services,
    workspace: &str,
    entity_id: &str,
    record_id: &str,
) -> Option<Value> {
    candidate_entity_ids(entity_id)
        .into_iter()
        .find_map(|candidate| services.records.get(workspace, &candidate, record_id))
}

fn fetch_record_payload(
    services: &Services,
    workspace: &str,
    entity_id: Option<&str>,
    record_id: Option<&str>,
) -> Value {
    match (entity_id, record_id) {
        (Some(entity_id), Some(record_id)) => {
            fetch_record_value(services, workspace, entity_id, record_id).unwrap_or_else(|| json!({}))
        }
        _ => json!({}),
    }
}

pub(crate) fn find_entity_def(services: &Services, entity_id: &str) -> Option<EntityDef> {
    let candidates = candidate_entity_ids(entity_id);
    for module in services.registry.list() {
        if !module.enabled {
            continue;
        }
        let Ok(compiled) = services.registry.compiled(&module.module_id) else {
            continue;
        };
        for candidate in &candidates {
            if let Some(entity) = compiled.entities.get(candidate) {
                return Some(entity.clone());
            }
        }
    }
    None
}
