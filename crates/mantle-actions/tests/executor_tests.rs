// SPDX-License-Identifier: MIT OR Apache-2.0

use mantle_actions::{ActionContext, ActionError, ActionExecutor};
use mantle_events::{EventBus, Outbox};
use mantle_records::{ActivityStore, ChatterStore, RecordStore};
use mantle_registry::{Cache, ManifestStore, ModuleRegistry};
use serde_json::{Value, json};
use std::sync::Arc;

struct Harness {
    executor: ActionExecutor,
    records: Arc<RecordStore>,
    chatter: Arc<ChatterStore>,
    outbox: Arc<Outbox>,
    registry: Arc<ModuleRegistry>,
}

fn jobs_manifest() -> Value {
    json!({
        "module": {"id": "jobs", "name": "Jobs"},
        "entities": [{
            "id": "entity.job",
            "label": "Job",
            "display_field": "job.title",
            "fields": [
                {"id": "job.title", "type": "string", "label": "Title", "required": true},
                {"id": "job.status", "type": "enum", "label": "Status",
                 "options": ["draft", "done"]},
            ],
        }],
        "views": [], "pages": [], "actions": [
            {"id": "action.go_home", "kind": "navigate", "label": "Home", "target": "page:job.list_page"},
            {"id": "action.job_create", "kind": "create_record", "label": "Create",
             "entity_id": "entity.job", "defaults": {}},
        ],
        "workflows": [
            {"entity": "entity.job", "status_field": "job.status", "states": ["draft", "done"]}
        ],
        "app": {"nav": []},
    })
}

fn harness() -> Harness {
    let store = Arc::new(ManifestStore::in_memory());
    let cache = Arc::new(Cache::new());
    let registry = Arc::new(ModuleRegistry::new(store, Arc::clone(&cache)));
    registry.install("jobs", &jobs_manifest(), None, None).unwrap();

    let records = Arc::new(RecordStore::new());
    let outbox = Arc::new(Outbox::new());
    let bus = Arc::new(EventBus::with_outbox(Some(Arc::clone(&outbox))));
    let chatter = Arc::new(ChatterStore::new());
    let executor = ActionExecutor::new(
        "w1",
        Arc::clone(&registry),
        Arc::clone(&records),
        Arc::new(ActivityStore::new()),
        Arc::clone(&chatter),
        bus,
        cache,
    );
    Harness {
        executor,
        records,
        chatter,
        outbox,
        registry,
    }
}

fn create_job(h: &Harness, title: &str, status: &str) -> String {
    let ctx = ActionContext {
        record_draft: Some(json!({"job.title": title, "job.status": status})),
        ..ActionContext::default()
    };
    h.executor
        .run_action("jobs", "action.job_create", &ctx)
        .unwrap()
        .record_id
        .unwrap()
}

#[test]
fn navigation_returns_target_and_emits_clicked() {
    let h = harness();
    let outcome = h
        .executor
        .run_action("jobs", "action.go_home", &ActionContext::default())
        .unwrap();
    assert_eq!(outcome.kind, "navigate");
    assert_eq!(outcome.target.as_deref(), Some("page:job.list_page"));

    let names: Vec<String> = h.outbox.pending().iter().map(|e| e.name.clone()).collect();
    assert!(names.contains(&"action.clicked".to_string()));
    assert!(names.contains(&"jobs.action.action.go_home.clicked".to_string()));
}

#[test]
fn create_writes_record_chatter_and_events() {
    let h = harness();
    let record_id = create_job(&h, "Fix boiler", "draft");

    let record = h.records.get("w1", "entity.job", &record_id).unwrap();
    assert_eq!(record["job.title"], json!("Fix boiler"));

    let chatter = h.chatter.list("w1", "entity.job", &record_id, 10);
    assert_eq!(chatter[0].body, "Record created");

    let names: Vec<String> = h.outbox.pending().iter().map(|e| e.name.clone()).collect();
    assert!(names.contains(&"record.created".to_string()));
    assert!(names.contains(&"jobs.record.created".to_string()));
}

#[test]
fn create_validation_failure_has_no_side_effects() {
    let h = harness();
    let ctx = ActionContext {
        record_draft: Some(json!({"job.status": "draft"})),
        ..ActionContext::default()
    };
    let err = h.executor.run_action("jobs", "action.job_create", &ctx).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_FAILED");
    assert_eq!(h.records.count("w1", "entity.job"), 0);
    assert!(h.outbox.pending().is_empty());
}

#[test]
fn status_update_emits_workflow_status_changed() {
    let h = harness();
    let record_id = create_job(&h, "A", "draft");
    h.outbox.clear();

    let ctx = ActionContext {
        record_id: Some(record_id.clone()),
        ..ActionContext::default()
    };
    let outcome = h
        .executor
        .run_action("jobs", "action.job_set_done", &ctx)
        .unwrap();
    assert_eq!(outcome.record.unwrap()["job.status"], json!("done"));

    let pending = h.outbox.pending();
    let status_event = pending
        .iter()
        .find(|e| e.name == "workflow.status_changed")
        .expect("status event emitted");
    assert_eq!(status_event.payload["from"], json!("draft"));
    assert_eq!(status_event.payload["to"], json!("done"));
    assert_eq!(status_event.payload["record_id"], json!(record_id));
    assert!(status_event.meta.manifest_hash.starts_with("sha256:"));
}

#[test]
fn unchanged_status_does_not_emit_status_event() {
    let h = harness();
    let record_id = create_job(&h, "A", "done");
    h.outbox.clear();

    let ctx = ActionContext {
        record_id: Some(record_id),
        ..ActionContext::default()
    };
    h.executor.run_action("jobs", "action.job_set_done", &ctx).unwrap();
    assert!(
        h.outbox
            .pending()
            .iter()
            .all(|e| e.name != "workflow.status_changed")
    );
}

#[test]
fn bulk_update_is_all_or_nothing() {
    let h = harness();
    let a = create_job(&h, "A", "draft");
    let b = create_job(&h, "B", "draft");
    h.outbox.clear();

    let ctx = ActionContext {
        selected_ids: vec![a.clone(), "missing".into(), b.clone()],
        ..ActionContext::default()
    };
    let err = h
        .executor
        .run_action("jobs", "action.job_bulk_set_done", &ctx)
        .unwrap_err();
    assert_eq!(err.code(), "RECORD_NOT_FOUND");

    for id in [&a, &b] {
        let record = h.records.get("w1", "entity.job", id).unwrap();
        assert_eq!(record["job.status"], json!("draft"), "no partial write");
    }
    assert!(h.outbox.pending().is_empty(), "no partial events");
}

#[test]
fn bulk_update_applies_to_all_selected() {
    let h = harness();
    let a = create_job(&h, "A", "draft");
    let b = create_job(&h, "B", "draft");

    let ctx = ActionContext {
        selected_ids: vec![a.clone(), b.clone()],
        ..ActionContext::default()
    };
    let outcome = h
        .executor
        .run_action("jobs", "action.job_bulk_set_done", &ctx)
        .unwrap();
    assert_eq!(outcome.updated_ids.len(), 2);
    for id in [&a, &b] {
        assert_eq!(
            h.records.get("w1", "entity.job", id).unwrap()["job.status"],
            json!("done")
        );
    }
}

#[test]
fn disabled_module_refuses_actions() {
    let h = harness();
    h.registry.set_enabled("jobs", false, None, None).unwrap();
    let err = h
        .executor
        .run_action("jobs", "action.go_home", &ActionContext::default())
        .unwrap_err();
    assert_eq!(err.code(), "MODULE_DISABLED");
}

#[test]
fn unknown_action_and_module_codes() {
    let h = harness();
    let err = h
        .executor
        .run_action("jobs", "action.nope", &ActionContext::default())
        .unwrap_err();
    assert_eq!(err.code(), "ACTION_NOT_FOUND");

    let err = h
        .executor
        .run_action("ghost", "action.nope", &ActionContext::default())
        .unwrap_err();
    assert_eq!(err.code(), "MODULE_NOT_INSTALLED");
}

#[test]
fn enabled_when_gate_blocks_execution() {
    let h = harness();
    // Install a module whose action only runs for drafts.
    let mut manifest = jobs_manifest();
    manifest["module"]["id"] = json!("gated");
    manifest["actions"].as_array_mut().unwrap().push(json!({
        "id": "action.finish",
        "kind": "update_record",
        "label": "Finish",
        "entity_id": "entity.job",
        "patch": {"job.status": "done"},
        "enabled_when": {"op": "eq", "left": {"var": "record.job.status"}, "right": {"literal": "draft"}},
    }));
    h.registry.install("gated", &manifest, None, None).unwrap();

    let record_id = create_job(&h, "A", "done");
    let ctx = ActionContext {
        record_id: Some(record_id),
        ..ActionContext::default()
    };
    let err = h.executor.run_action("gated", "action.finish", &ctx).unwrap_err();
    assert_eq!(err.code(), "ACTION_DISABLED");
    assert!(matches!(err, ActionError::ActionDisabled { .. }));
}
