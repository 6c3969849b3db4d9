// SPDX-License-Identifier: MIT OR Apache-2.0

use mantle_actions::{
    PlanActionCaller, PlanContext, PlanDeps, PlanQueryRunner, PlanRecordOps, Transaction,
    TxManager, execute_plan, plan_action,
};
use mantle_events::Outbox;
use serde_json::{Map, Value, json};
use std::sync::{Arc, Mutex};

fn ctx() -> PlanContext {
    PlanContext {
        actor: Some(json!({"id": "u1", "roles": ["manager"]})),
        module_id: "job_management".into(),
        manifest_hash: Some("sha256:abcd".into()),
        trace_id: None,
        vars: json!({"job": {"id": "j1", "status": "open"}, "x": 1}),
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

#[test]
fn role_denial() {
    let action = json!({
        "id": "action.assign",
        "type": "update_record",
        "permissions": {"roles": ["admin"]},
        "effect": {
            "record_ref": {"entity": "entity.job", "id": {"var": "job.id"}},
            "changes": {"job.status": {"literal": "closed"}},
        },
    });
    let result = plan_action(&action, &json!({}), &ctx());
    assert!(!result.ok());
    assert_eq!(result.errors[0].code, "ACTION_FORBIDDEN_ROLE");
}

#[test]
fn condition_denial_and_invalid_var() {
    let mut action = json!({
        "id": "action.assign",
        "type": "update_record",
        "permissions": {
            "condition": {"op": "eq", "left": {"var": "x"}, "right": {"literal": 2}},
        },
        "effect": {
            "record_ref": {"entity": "entity.job", "id": {"var": "job.id"}},
            "changes": {"job.status": {"literal": "closed"}},
        },
    });
    let result = plan_action(&action, &json!({}), &ctx());
    assert!(!result.ok());
    assert_eq!(result.errors[0].code, "ACTION_FORBIDDEN_CONDITION");

    // A guard over a variable that does not exist is an error, not a no.
    action["permissions"] = json!({"condition": {"op": "exists", "left": {"var": "missing"}}});
    let result = plan_action(&action, &json!({}), &ctx());
    assert!(!result.ok());
    assert_eq!(result.errors[0].code, "CONDITION_INVALID");
}

#[test]
fn params_schema_required_types_and_additional() {
    let action = json!({
        "id": "action.create",
        "type": "create_record",
        "params_schema": {
            "type": "object",
            "required": ["title"],
            "properties": {"title": {"type": "string"}},
            "additionalProperties": false,
        },
        "effect": {
            "entity": "entity.job",
            "values": {"job.title": {"var": "title"}},
        },
    });

    let result = plan_action(&action, &json!({}), &ctx());
    assert_eq!(result.errors[0].code, "PARAMS_REQUIRED_MISSING");

    let result = plan_action(&action, &json!({"title": 123}), &ctx());
    assert_eq!(result.errors[0].code, "PARAMS_TYPE_INVALID");

    let result = plan_action(&action, &json!({"extra": 1, "title": "t"}), &ctx());
    assert_eq!(result.errors[0].code, "PARAMS_ADDITIONAL_FORBIDDEN");

    let result = plan_action(&action, &json!({"title": "t"}), &ctx());
    assert!(result.ok(), "{:?}", result.errors);
}

#[test]
fn each_type_compiles_to_its_step_kind() {
    let cases = [
        (
            json!({
                "id": "action.update", "type": "update_record",
                "effect": {
                    "record_ref": {"entity": "entity.job", "id": {"var": "job.id"}},
                    "changes": {"job.status": {"literal": "closed"}},
                },
            }),
            "update_record",
        ),
        (
            json!({
                "id": "action.create", "type": "create_record",
                "effect": {
                    "entity": "entity.job",
                    "values": {"job.title": {"literal": "x"}},
                    "returns": {"as": "created", "fields": ["job.id"]},
                },
            }),
            "create_record",
        ),
        (
            json!({
                "id": "action.call", "type": "call_action",
                "effect": {
                    "action_ref": "docs.action.generate",
                    "params": {"id": {"var": "job.id"}},
                    "returns": {"as": "result"},
                },
            }),
            "call_action",
        ),
        (
            json!({
                "id": "action.publish", "type": "publish_event",
                "effect": {"name": "job.created", "payload": {"job_id": {"var": "job.id"}}},
            }),
            "publish_event",
        ),
        (
            json!({
                "id": "action.query", "type": "run_query",
                "effect": {
                    "query_ref": "job.query.tasks",
                    "params": {"job_id": {"var": "job.id"}},
                    "returns": {"as": "tasks"},
                },
            }),
            "run_query",
        ),
    ];
    for (action, expected_kind) in cases {
        let result = plan_action(&action, &json!({}), &ctx());
        assert!(result.ok(), "{expected_kind}: {:?}", result.errors);
        let plan = result.plan.unwrap();
        assert_eq!(plan.steps[0].kind(), expected_kind);
    }
}

#[test]
fn unknown_action_type_rejected() {
    let action = json!({"id": "action.bad", "type": "destroy_world", "effect": {}});
    let result = plan_action(&action, &json!({}), &ctx());
    assert!(!result.ok());
    assert_eq!(result.errors[0].code, "ACTION_TYPE_INVALID");
}

#[test]
fn unknown_effect_keys_rejected() {
    let action = json!({
        "id": "action.update", "type": "update_record",
        "effect": {
            "record_ref": {"entity": "entity.job", "id": {"var": "job.id"}},
            "changes": {"job.status": {"literal": "closed"}},
            "bogus": 1,
        },
    });
    let result = plan_action(&action, &json!({}), &ctx());
    assert!(result.errors.iter().any(|e| e.code == "EFFECT_KEY_INVALID"));
}

// ---------------------------------------------------------------------------
// Execution fakes
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct TxFlags {
    committed: bool,
    rolled_back: bool,
}

struct FakeTx {
    flags: Arc<Mutex<TxFlags>>,
}

impl Transaction for FakeTx {
    fn commit(&mut self) {
        self.flags.lock().unwrap().committed = true;
    }

    fn rollback(&mut self) {
        self.flags.lock().unwrap().rolled_back = true;
    }
}

#[derive(Default)]
struct FakeTxMgr {
    last: Mutex<Option<Arc<Mutex<TxFlags>>>>,
}

impl FakeTxMgr {
    fn last_tx(&self) -> Option<TxFlags> {
        self.last
            .lock()
            .unwrap()
            .as_ref()
            .map(|flags| flags.lock().unwrap().clone())
    }
}

impl TxManager for FakeTxMgr {
    fn begin(&self) -> Box<dyn Transaction> {
        let flags = Arc::new(Mutex::new(TxFlags::default()));
        *self.last.lock().unwrap() = Some(Arc::clone(&flags));
        Box::new(FakeTx { flags })
    }
}

#[derive(Default)]
struct FakeRecords {
    updated: Mutex<Vec<(String, Value, Map<String, Value>)>>,
    created: Mutex<Vec<(String, Map<String, Value>)>>,
    fail_update: bool,
}

impl PlanRecordOps for FakeRecords {
    fn create_record(&self, entity: &str, values: &Map<String, Value>) -> anyhow::Result<Value> {
        self.created
            .lock()
            .unwrap()
            .push((entity.to_string(), values.clone()));
        let mut created = Map::new();
        created.insert("id".into(), json!("new1"));
        for (key, value) in values {
            created.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(created))
    }

    fn update_record(
        &self,
        entity: &str,
        record_id: &Value,
        changes: &Map<String, Value>,
    ) -> anyhow::Result<()> {
        if self.fail_update {
            anyhow::bail!("not found");
        }
        self.updated
            .lock()
            .unwrap()
            .push((entity.to_string(), record_id.clone(), changes.clone()));
        Ok(())
    }
}

struct FakeActions;

impl PlanActionCaller for FakeActions {
    fn call(
        &self,
        _action_ref: &str,
        _params: &Map<String, Value>,
        _ctx: &PlanContext,
    ) -> anyhow::Result<Value> {
        Ok(json!({"ok": true}))
    }
}

struct FakeQueries;

impl PlanQueryRunner for FakeQueries {
    fn run(
        &self,
        _query_ref: &str,
        _params: &Map<String, Value>,
        _ctx: &PlanContext,
    ) -> anyhow::Result<Value> {
        Ok(json!([1, 2]))
    }
}

fn deps<'a>(
    tx: &'a FakeTxMgr,
    records: &'a FakeRecords,
    outbox: &'a Outbox,
) -> PlanDeps<'a> {
    PlanDeps {
        tx,
        records,
        actions: Some(&FakeActions),
        queries: Some(&FakeQueries),
        outbox: Some(outbox),
    }
}

fn compile(decl: Value) -> mantle_actions::ActionPlan {
    plan_action(&decl, &json!({}), &ctx()).plan.expect("plan compiles")
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[test]
fn update_then_create_commits() {
    let tx = FakeTxMgr::default();
    let records = FakeRecords::default();
    let outbox = Outbox::new();

    // Two-step plan: hand-built, the planner compiles one step per decl.
    let mut plan = compile(json!({
        "id": "a", "type": "update_record",
        "effect": {
            "record_ref": {"entity": "entity.job", "id": {"var": "job.id"}},
            "changes": {"job.status": {"literal": "closed"}},
        },
    }));
    plan.steps.extend(
        compile(json!({
            "id": "a2", "type": "create_record",
            "effect": {
                "entity": "entity.note",
                "values": {"note.text": {"literal": "hi"}},
                "returns": {"as": "created", "fields": ["id", "note.text"]},
            },
        }))
        .steps,
    );

    let result = execute_plan(&plan, &ctx(), &deps(&tx, &records, &outbox));
    assert!(result.ok(), "{:?}", result.errors);
    let flags = tx.last_tx().unwrap();
    assert!(flags.committed);
    assert!(!flags.rolled_back);
    assert_eq!(records.updated.lock().unwrap().len(), 1);
    assert_eq!(records.created.lock().unwrap().len(), 1);
    assert_eq!(result.effects.updated[0].1, json!("j1"));
}

#[test]
fn failure_rolls_back_and_drops_events() {
    let tx = FakeTxMgr::default();
    let records = FakeRecords {
        fail_update: true,
        ..FakeRecords::default()
    };
    let outbox = Outbox::new();

    let mut plan = compile(json!({
        "id": "a", "type": "publish_event",
        "effect": {"name": "job.closed", "payload": {"job_id": {"var": "job.id"}}},
    }));
    plan.steps.extend(
        compile(json!({
            "id": "a2", "type": "update_record",
            "effect": {
                "record_ref": {"entity": "entity.job", "id": {"var": "job.id"}},
                "changes": {"job.status": {"literal": "closed"}},
            },
        }))
        .steps,
    );

    let result = execute_plan(&plan, &ctx(), &deps(&tx, &records, &outbox));
    assert!(!result.ok());
    let flags = tx.last_tx().unwrap();
    assert!(flags.rolled_back);
    assert!(!flags.committed);
    assert!(outbox.pending().is_empty(), "pending events must be dropped");
}

#[test]
fn publish_event_lands_in_outbox_after_commit() {
    let tx = FakeTxMgr::default();
    let records = FakeRecords::default();
    let outbox = Outbox::new();

    let plan = compile(json!({
        "id": "a", "type": "publish_event",
        "effect": {"name": "job.created", "payload": {"job_id": {"literal": "j1"}}},
    }));
    let result = execute_plan(&plan, &ctx(), &deps(&tx, &records, &outbox));
    assert!(result.ok(), "{:?}", result.errors);
    assert!(tx.last_tx().unwrap().committed);

    let pending = outbox.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "job.created");
    assert_eq!(pending[0].payload["job_id"], json!("j1"));
    assert_eq!(result.effects.events_enqueued, vec![pending[0].meta.event_id.clone()]);
}

#[test]
fn created_aliases_feed_later_steps() {
    let tx = FakeTxMgr::default();
    let records = FakeRecords::default();
    let outbox = Outbox::new();

    let mut plan = compile(json!({
        "id": "a", "type": "create_record",
        "effect": {
            "entity": "entity.note",
            "values": {"note.text": {"literal": "hi"}},
            "returns": {"as": "created", "fields": ["id"]},
        },
    }));
    plan.steps.extend(
        compile(json!({
            "id": "a2", "type": "update_record",
            "effect": {
                "record_ref": {"entity": "entity.note", "id": {"var": "created.id"}},
                "changes": {"note.text": {"literal": "bye"}},
            },
        }))
        .steps,
    );

    let result = execute_plan(&plan, &ctx(), &deps(&tx, &records, &outbox));
    assert!(result.ok(), "{:?}", result.errors);
    assert_eq!(records.updated.lock().unwrap()[0].1, json!("new1"));
}

#[test]
fn unresolved_var_rolls_back() {
    let tx = FakeTxMgr::default();
    let records = FakeRecords::default();
    let outbox = Outbox::new();

    let plan = compile(json!({
        "id": "a", "type": "update_record",
        "effect": {
            "record_ref": {"entity": "entity.job", "id": {"var": "missing.id"}},
            "changes": {"job.status": {"literal": "closed"}},
        },
    }));
    let result = execute_plan(&plan, &ctx(), &deps(&tx, &records, &outbox));
    assert!(!result.ok());
    assert_eq!(result.errors[0].code, "EXEC_VAR_UNRESOLVED");
    assert!(tx.last_tx().unwrap().rolled_back);
    assert!(records.updated.lock().unwrap().is_empty());
}

#[test]
fn missing_return_fields_warn() {
    let tx = FakeTxMgr::default();
    let records = FakeRecords::default();
    let outbox = Outbox::new();

    let plan = compile(json!({
        "id": "a", "type": "create_record",
        "effect": {
            "entity": "entity.note",
            "values": {"note.text": {"literal": "hi"}},
            "returns": {"as": "created", "fields": ["id", "missing"]},
        },
    }));
    let result = execute_plan(&plan, &ctx(), &deps(&tx, &records, &outbox));
    assert!(result.ok(), "{:?}", result.errors);
    assert_eq!(result.warnings[0].code, "EXEC_RETURN_FIELD_MISSING");
    assert_eq!(result.result["created"]["id"], json!("new1"));
}

#[test]
fn missing_manifest_hash_blocks_event_emission() {
    let tx = FakeTxMgr::default();
    let records = FakeRecords::default();
    let outbox = Outbox::new();

    let plan = compile(json!({
        "id": "a", "type": "publish_event",
        "effect": {"name": "job.created", "payload": {}},
    }));
    let mut bare = ctx();
    bare.manifest_hash = None;
    let result = execute_plan(&plan, &bare, &deps(&tx, &records, &outbox));
    assert!(!result.ok());
    assert_eq!(result.errors[0].code, "EXEC_CTX_INVALID");
    assert!(outbox.pending().is_empty());
}
