// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::{Duration, Utc};
use mantle_actions::ActionExecutor;
use mantle_automation::{
    AutomationStatus, AutomationStore, AutomationTrigger, NotificationStore, RunStatus, Step,
    StepRunStatus,
};
use mantle_config::RuntimeSettings;
use mantle_events::EventBus;
use mantle_jobs::{EnqueueJob, JobStatus, JobStore, Services, Worker, run_automation};
use mantle_mail::{
    ConnectionConfig, ConnectionStore, EmailOutboxStore, EmailTemplateStore, MockEmailProvider,
    ProviderRegistry,
};
use mantle_records::{ActivityStore, ChatterStore, RecordStore};
use mantle_registry::{Cache, ManifestStore, ModuleRegistry};
use mantle_render::{DocTemplateStore, MockPdfRenderer};
use mantle_storage::{AttachmentStore, LocalStorage, SecretStore, Storage};
use serde_json::{Value, json};
use std::sync::Arc;

const WS: &str = "default";

struct Harness {
    services: Arc<Services>,
    worker: Worker,
    provider: Arc<MockEmailProvider>,
    _storage_dir: tempfile::TempDir,
}

fn harness_with_provider(provider: MockEmailProvider) -> Harness {
    let storage_dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(provider);

    let mut providers = ProviderRegistry::new();
    providers.register("mock", Arc::clone(&provider) as Arc<dyn mantle_mail::EmailProvider>);

    let store = Arc::new(ManifestStore::in_memory());
    let cache = Arc::new(Cache::new());
    let registry = Arc::new(ModuleRegistry::new(store, Arc::clone(&cache)));
    let records = Arc::new(RecordStore::new());
    let bus = Arc::new(EventBus::new());
    let executor = Arc::new(ActionExecutor::new(
        WS,
        Arc::clone(&registry),
        Arc::clone(&records),
        Arc::new(ActivityStore::new()),
        Arc::new(ChatterStore::new()),
        bus,
        cache,
    ));

    let services = Arc::new(Services {
        jobs: Arc::new(JobStore::new()),
        automations: Arc::new(AutomationStore::new()),
        notifications: Arc::new(NotificationStore::new()),
        connections: Arc::new(ConnectionStore::new()),
        email_templates: Arc::new(EmailTemplateStore::new()),
        email_outbox: Arc::new(EmailOutboxStore::new()),
        doc_templates: Arc::new(DocTemplateStore::new()),
        attachments: Arc::new(AttachmentStore::new()),
        secrets: Arc::new(SecretStore::new()),
        storage: Arc::new(LocalStorage::new(storage_dir.path())) as Arc<dyn Storage>,
        pdf: Arc::new(MockPdfRenderer),
        providers: Arc::new(providers),
        records,
        registry,
        executor,
        settings: RuntimeSettings::default(),
    });
    let worker = Worker::new(Arc::clone(&services));
    Harness {
        services,
        worker,
        provider,
        _storage_dir: storage_dir,
    }
}

fn mock_connection(h: &Harness) -> mantle_mail::EmailConnection {
    h.services
        .connections
        .create(WS, "mock", ConnectionConfig::default(), None)
        .unwrap()
}

fn queued_email(h: &Harness, connection_id: &str) -> String {
    let row = h.services.email_outbox.create(
        WS,
        vec!["a@example.com".into()],
        vec![],
        vec![],
        Some("noreply@example.com"),
        None,
        "Hi",
        Some("<p>hi</p>"),
        None,
        None,
    );
    h.services.jobs.enqueue(
        EnqueueJob {
            max_attempts: Some(5),
            ..EnqueueJob::new(
                WS,
                "email.send",
                json!({"outbox_id": row.id, "connection_id": connection_id}),
            )
        }
        .idempotent("email-1"),
    );
    row.id
}

fn force_due(h: &Harness, job_id: &str) {
    h.services
        .jobs
        .requeue(job_id, Utc::now() - Duration::seconds(1), "forced due");
}

fn single_job(h: &Harness, job_type: &str) -> mantle_jobs::Job {
    let jobs = h.services.jobs.list(WS, None, Some(job_type), 10);
    assert_eq!(jobs.len(), 1, "expected one {job_type} job");
    jobs.into_iter().next().unwrap()
}

#[tokio::test]
async fn email_retries_with_backoff_then_succeeds() {
    let h = harness_with_provider(MockEmailProvider::failing(3));
    let connection = mock_connection(&h);
    let outbox_id = queued_email(&h, &connection.id);

    // Attempts 1..=3 fail and re-queue with 60/120/240s backoff.
    for expected_backoff in [60i64, 120, 240] {
        let before = Utc::now();
        assert_eq!(h.worker.run_once().await, 1);
        let job = single_job(&h, "email.send");
        assert_eq!(job.status, JobStatus::Queued);
        let run_at = chrono::DateTime::parse_from_rfc3339(&job.run_at).unwrap();
        let delta = (run_at.with_timezone(&Utc) - before).num_seconds();
        assert!(
            (expected_backoff - 2..=expected_backoff + 2).contains(&delta),
            "expected ~{expected_backoff}s backoff, got {delta}s"
        );
        force_due(&h, &job.id);
    }

    // Attempt 4 succeeds and the outbox row flips to sent.
    assert_eq!(h.worker.run_once().await, 1);
    let job = single_job(&h, "email.send");
    assert_eq!(job.status, JobStatus::Succeeded);
    let outbox = h.services.email_outbox.get(WS, &outbox_id).unwrap();
    assert_eq!(outbox.status, "sent");
    assert_eq!(outbox.provider_message_id.as_deref(), Some("mock-4"));
    assert!(outbox.sent_at.is_some());
    assert_eq!(h.provider.attempts(), 4);
}

#[tokio::test]
async fn exhausted_retry_budget_dead_letters() {
    let h = harness_with_provider(MockEmailProvider::failing(u32::MAX));
    let connection = mock_connection(&h);
    let row = h.services.email_outbox.create(
        WS,
        vec!["a@example.com".into()],
        vec![],
        vec![],
        None,
        None,
        "Hi",
        None,
        Some("hi"),
        None,
    );
    h.services.jobs.enqueue(EnqueueJob::new(
        WS,
        "email.send",
        json!({"outbox_id": row.id, "connection_id": connection.id}),
    ));

    for _ in 0..10 {
        assert_eq!(h.worker.run_once().await, 1);
        let job = single_job(&h, "email.send");
        if job.status == JobStatus::Dead {
            break;
        }
        force_due(&h, &job.id);
    }
    let job = single_job(&h, "email.send");
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempt, 10);
    assert!(job.last_error.is_some());
}

#[tokio::test]
async fn job_events_record_completion() {
    let h = harness_with_provider(MockEmailProvider::new());
    let connection = mock_connection(&h);
    queued_email(&h, &connection.id);

    h.worker.drain().await;
    let job = single_job(&h, "email.send");
    let events = h.services.jobs.list_events(&job.id, 10);
    assert!(events.iter().any(|e| e.message == "job_finished"));
}

// ---------------------------------------------------------------------------
// Automation runtime
// ---------------------------------------------------------------------------

fn trigger(event: &str) -> AutomationTrigger {
    AutomationTrigger {
        kind: "event".into(),
        event_types: vec![event.into()],
        filters: vec![],
    }
}

fn steps(value: Value) -> Vec<Step> {
    serde_json::from_value(value).unwrap()
}

fn published(h: &Harness, name: &str, step_program: Value) -> mantle_automation::Automation {
    let automation = h.services.automations.create(
        WS,
        name,
        None,
        trigger("record.created"),
        steps(step_program),
    );
    h.services
        .automations
        .set_status(WS, &automation.id, AutomationStatus::Published)
        .unwrap()
}

fn start_run(h: &Harness, automation_id: &str) -> String {
    let run = h
        .services
        .automations
        .create_run(WS, automation_id, "record.created", json!({"record_id": "r1"}));
    run.id
}

#[tokio::test]
async fn delay_step_reschedules_instead_of_sleeping() {
    let h = harness_with_provider(MockEmailProvider::new());
    let automation = published(
        &h,
        "Delay",
        json!([{"kind": "delay", "id": "delay1", "seconds": 60}]),
    );
    let run_id = start_run(&h, &automation.id);

    run_automation(&h.services, WS, &run_id).unwrap();

    let run = h.services.automations.get_run(WS, &run_id).unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.current_step_index, 1);

    let job = single_job(&h, "automation.run");
    assert_eq!(job.idempotency_key.as_deref(), Some(format!("{run_id}:1:delay").as_str()));
    let run_at = chrono::DateTime::parse_from_rfc3339(&job.run_at).unwrap();
    assert!(run_at.with_timezone(&Utc) > Utc::now() + Duration::seconds(30));

    let step_runs = h.services.automations.list_step_runs(WS, &run_id);
    assert_eq!(step_runs.len(), 1);
    assert_eq!(step_runs[0].status, StepRunStatus::Succeeded);
}

#[tokio::test]
async fn duplicate_cycles_skip_succeeded_steps() {
    let h = harness_with_provider(MockEmailProvider::new());
    let automation = published(
        &h,
        "Idem",
        json!([{"kind": "action", "id": "noop1", "action_id": "system.noop"}]),
    );
    let run_id = start_run(&h, &automation.id);

    run_automation(&h.services, WS, &run_id).unwrap();
    assert_eq!(h.services.automations.list_step_runs(WS, &run_id).len(), 1);

    // Simulate a crashed worker re-processing the same cycle.
    h.services
        .automations
        .update_run(WS, &run_id, |run| {
            run.status = RunStatus::Running;
            run.current_step_index = 0;
        })
        .unwrap();
    run_automation(&h.services, WS, &run_id).unwrap();

    let step_runs = h.services.automations.list_step_runs(WS, &run_id);
    assert_eq!(step_runs.len(), 1, "succeeded step must not re-execute");
    assert_eq!(
        h.services.automations.get_run(WS, &run_id).unwrap().status,
        RunStatus::Succeeded
    );
}

#[tokio::test]
async fn retry_policy_requeues_then_fails_the_run() {
    let h = harness_with_provider(MockEmailProvider::new());
    let automation = published(
        &h,
        "Retry",
        json!([{
            "kind": "action", "id": "fail1", "action_id": "system.fail",
            "retry_policy": {"max_attempts": 2, "backoff_seconds": 1},
        }]),
    );
    let run_id = start_run(&h, &automation.id);

    run_automation(&h.services, WS, &run_id).unwrap();
    let run = h.services.automations.get_run(WS, &run_id).unwrap();
    assert_eq!(run.status, RunStatus::Queued, "first failure re-queues");
    let job = single_job(&h, "automation.run");
    assert_eq!(
        job.idempotency_key.as_deref(),
        Some(format!("{run_id}:fail1:1").as_str())
    );

    run_automation(&h.services, WS, &run_id).unwrap();
    let run = h.services.automations.get_run(WS, &run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed, "budget exhausted");
    assert!(run.last_error.is_some());

    // Exactly one failed step run per attempt, never a duplicated success.
    let step_runs = h.services.automations.list_step_runs(WS, &run_id);
    assert_eq!(step_runs.len(), 2);
    assert!(step_runs.iter().all(|sr| sr.status == StepRunStatus::Failed));
    assert_ne!(step_runs[0].idempotency_key, step_runs[1].idempotency_key);

    // A manual retry re-queues the run at the failed step.
    mantle_jobs::retry_run(&h.services, WS, &run_id).unwrap();
    let run = h.services.automations.get_run(WS, &run_id).unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.current_step_index, 0);
    assert!(run.last_error.is_none());
}

#[tokio::test]
async fn condition_goto_branches() {
    let h = harness_with_provider(MockEmailProvider::new());
    let automation = published(
        &h,
        "Branch",
        json!([
            {"kind": "condition", "id": "check",
             "expr": {"op": "eq", "left": {"var": "trigger.record_id"}, "right": {"literal": "r1"}},
             "if_false_goto": 2},
            {"kind": "action", "id": "then", "action_id": "system.noop"},
            {"kind": "action", "id": "else", "action_id": "system.noop"},
        ]),
    );
    let run_id = start_run(&h, &automation.id);

    run_automation(&h.services, WS, &run_id).unwrap();
    let run = h.services.automations.get_run(WS, &run_id).unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    let executed: Vec<String> = h
        .services
        .automations
        .list_step_runs(WS, &run_id)
        .iter()
        .map(|sr| sr.step_id.clone())
        .collect();
    assert!(executed.contains(&"then".to_string()));
}

#[tokio::test]
async fn cancelled_runs_stop_advancing() {
    let h = harness_with_provider(MockEmailProvider::new());
    let automation = published(
        &h,
        "Cancel",
        json!([{"kind": "action", "id": "noop1", "action_id": "system.noop"}]),
    );
    let run_id = start_run(&h, &automation.id);
    h.services.automations.cancel_run(WS, &run_id).unwrap();

    run_automation(&h.services, WS, &run_id).unwrap();
    assert!(h.services.automations.list_step_runs(WS, &run_id).is_empty());
    assert_eq!(
        h.services.automations.get_run(WS, &run_id).unwrap().status,
        RunStatus::Cancelled
    );
}

#[tokio::test]
async fn notify_step_creates_notifications_per_recipient() {
    let h = harness_with_provider(MockEmailProvider::new());
    let automation = published(
        &h,
        "Notify",
        json!([{
            "kind": "action", "id": "n1", "action_id": "system.notify",
            "inputs": {"recipient_user_ids": ["u1", "u2"], "title": "Ping", "body": "Done"},
        }]),
    );
    let run_id = start_run(&h, &automation.id);

    run_automation(&h.services, WS, &run_id).unwrap();
    assert_eq!(h.services.notifications.unread_count(WS, "u1"), 1);
    assert_eq!(h.services.notifications.unread_count(WS, "u2"), 1);
    let note = &h.services.notifications.list(WS, "u1", false, 10)[0];
    assert_eq!(note.title, "Ping");
    assert_eq!(note.source_event.as_ref().unwrap()["record_id"], json!("r1"));
}

#[tokio::test]
async fn send_email_step_composes_outbox_and_enqueues_job() {
    let h = harness_with_provider(MockEmailProvider::new());
    mock_connection(&h);
    let automation = published(
        &h,
        "Email",
        json!([{
            "kind": "action", "id": "mail1", "action_id": "system.send_email",
            "inputs": {
                "to": "ops@example.com",
                "subject": "Record {{ trigger.record_id }} created",
                "body_text": "See {{ trigger.record_id }}",
            },
        }]),
    );
    let run_id = start_run(&h, &automation.id);

    run_automation(&h.services, WS, &run_id).unwrap();
    let rows = h.services.email_outbox.list(WS, None, 10);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].subject, "Record r1 created");
    assert_eq!(rows[0].to, vec!["ops@example.com".to_string()]);

    // The worker delivers the queued email.
    h.worker.drain().await;
    assert_eq!(h.provider.delivered().len(), 1);
    assert_eq!(
        h.services.email_outbox.list(WS, None, 10)[0].status,
        "sent"
    );
}

// ---------------------------------------------------------------------------
// Document generation & cleanup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn doc_generate_stores_pdf_and_links_attachment() {
    let h = harness_with_provider(MockEmailProvider::new());
    let template = h.services.doc_templates.create(
        WS,
        "Invoice",
        "<h1>{{ record.title }}</h1>",
        Some("invoice-{{ record.number }}"),
        None,
    );
    let (record_id, _) = h.services.records.create(
        WS,
        "entity.invoice",
        &json!({"title": "March", "number": "42"}),
    );
    h.services.jobs.enqueue(EnqueueJob::new(
        WS,
        "doc.generate",
        json!({
            "template_id": template.id,
            "entity_id": "entity.invoice",
            "record_id": record_id,
            "purpose": "invoice",
        }),
    ));

    h.worker.drain().await;
    let job = single_job(&h, "doc.generate");
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.last_error);

    let links = h.services.attachments.list_links(WS, "entity.invoice", &record_id);
    assert_eq!(links.len(), 2);
    let purposes: Vec<&str> = links.iter().map(|l| l.purpose.as_str()).collect();
    assert!(purposes.contains(&"invoice"));
    assert!(purposes.iter().any(|p| p.starts_with("template:")));

    let attachment = h.services.attachments.get(WS, &links[0].attachment_id).unwrap();
    assert_eq!(attachment.filename, "invoice-42.pdf");
    let bytes = h
        .services
        .storage
        .read_bytes(WS, &attachment.storage_key, None)
        .unwrap();
    assert!(bytes.starts_with(b"%PDF"));
}

#[tokio::test]
async fn attachments_cleanup_deletes_storage_too() {
    let h = harness_with_provider(MockEmailProvider::new());
    let stored = h
        .services
        .storage
        .store_bytes(WS, "preview.pdf", b"stale", None, None)
        .unwrap();
    h.services.attachments.create(
        WS,
        "preview.pdf",
        None,
        stored.size,
        &stored.storage_key,
        &stored.sha256,
        None,
        "preview",
    );
    h.services.jobs.enqueue(EnqueueJob::new(
        WS,
        "attachments.cleanup",
        json!({"source": "preview", "older_than_hours": -1}),
    ));

    h.worker.drain().await;
    assert!(h.services.storage.read_bytes(WS, &stored.storage_key, None).is_err());
}
