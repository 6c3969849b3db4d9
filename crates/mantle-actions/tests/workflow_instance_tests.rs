// SPDX-License-Identifier: MIT OR Apache-2.0

use mantle_actions::{
    PlanContext, PlanDeps, PlanRecordOps, Transaction, TxManager, WorkflowDeps,
    WorkflowInstanceStore, apply_workflow_step,
};
use mantle_events::Outbox;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

const WS: &str = "default";

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
    begun: Mutex<usize>,
}

impl FakeTxMgr {
    fn last_tx(&self) -> Option<TxFlags> {
        self.last
            .lock()
            .unwrap()
            .as_ref()
            .map(|flags| flags.lock().unwrap().clone())
    }

    fn begun(&self) -> usize {
        *self.begun.lock().unwrap()
    }
}

impl TxManager for FakeTxMgr {
    fn begin(&self) -> Box<dyn Transaction> {
        *self.begun.lock().unwrap() += 1;
        let flags = Arc::new(Mutex::new(TxFlags::default()));
        *self.last.lock().unwrap() = Some(Arc::clone(&flags));
        Box::new(FakeTx { flags })
    }
}

#[derive(Default)]
struct FakeRecords {
    fail: bool,
}

impl PlanRecordOps for FakeRecords {
    fn create_record(&self, _entity: &str, _values: &Map<String, Value>) -> anyhow::Result<Value> {
        Ok(json!({"id": "new1"}))
    }

    fn update_record(
        &self,
        _entity: &str,
        _record_id: &Value,
        _changes: &Map<String, Value>,
    ) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("missing");
        }
        Ok(())
    }
}

struct Harness {
    store: WorkflowInstanceStore,
    tx: FakeTxMgr,
    records: FakeRecords,
    outbox: Outbox,
    decls: BTreeMap<String, Value>,
    instance_id: String,
}

fn harness(fail_records: bool) -> Harness {
    let store = WorkflowInstanceStore::new();
    let instance = store.create_instance(WS, "m1", "wf", "s1", None, None, "init");
    let mut decls = BTreeMap::new();
    decls.insert(
        "action.close".to_string(),
        json!({
            "id": "action.close",
            "type": "update_record",
            "effect": {
                "record_ref": {"entity": "entity.job", "id": {"literal": "j1"}},
                "changes": {"job.status": {"literal": "closed"}},
            },
        }),
    );
    Harness {
        store,
        tx: FakeTxMgr::default(),
        records: FakeRecords { fail: fail_records },
        outbox: Outbox::new(),
        decls,
        instance_id: instance.instance_id,
    }
}

fn workflow() -> Value {
    json!({
        "id": "wf",
        "initial_state": "s1",
        "states": [{"id": "s1"}, {"id": "s2"}],
        "transitions": [{
            "id": "t1",
            "from": "s1",
            "to": "s2",
            "guard": {"op": "eq", "left": {"var": "ok"}, "right": {"literal": true}},
            "actions": ["action.close"],
            "emits": [{"name": "wf.done", "payload": {"ok": true}}],
        }],
    })
}

fn ctx(ok: bool) -> PlanContext {
    PlanContext {
        actor: Some(json!({"id": "u1", "roles": ["admin"]})),
        module_id: "m1".into(),
        manifest_hash: Some("sha256:abcd".into()),
        trace_id: None,
        vars: json!({"ok": ok}),
    }
}

fn run(h: &Harness, ctx: &PlanContext) -> mantle_actions::WorkflowStepOutcome {
    let deps = WorkflowDeps {
        store: &h.store,
        plan: PlanDeps {
            tx: &h.tx,
            records: &h.records,
            actions: None,
            queries: None,
            outbox: Some(&h.outbox),
        },
        action_decls: &h.decls,
    };
    apply_workflow_step(WS, &workflow(), &h.instance_id, ctx, &deps)
}

#[test]
fn no_eligible_transition_is_a_no_op_without_a_transaction() {
    let h = harness(false);
    let result = run(&h, &ctx(false));
    assert!(result.ok());
    assert!(result.transition_id.is_none());
    assert_eq!(h.tx.begun(), 0, "no transaction may be opened");
    assert_eq!(result.instance.unwrap().current_state, "s1");
}

#[test]
fn success_updates_state_history_and_commits() {
    let h = harness(false);
    let result = run(&h, &ctx(true));
    assert!(result.ok(), "{:?}", result.errors);
    assert_eq!(result.transition_id.as_deref(), Some("t1"));

    let instance = result.instance.unwrap();
    assert_eq!(instance.current_state, "s2");
    let last = instance.history.last().unwrap();
    assert_eq!(last.transition_id, "t1");
    assert_eq!(last.from_state, "s1");
    assert_eq!(last.to_state, "s2");

    assert!(result.action_results.contains_key("action.close"));

    // The stored instance advanced too.
    let stored = h.store.get_instance(WS, &h.instance_id).unwrap();
    assert_eq!(stored.current_state, "s2");
}

#[test]
fn missing_action_decl_rolls_back() {
    let mut h = harness(false);
    h.decls.clear();
    let result = run(&h, &ctx(true));
    assert!(!result.ok());
    assert_eq!(result.errors[0].code, "WORKFLOW_ACTION_DECL_MISSING");
    assert!(h.tx.last_tx().unwrap().rolled_back);

    let stored = h.store.get_instance(WS, &h.instance_id).unwrap();
    assert_eq!(stored.current_state, "s1", "stored state untouched");
}

#[test]
fn action_exec_failure_rolls_back() {
    let h = harness(true);
    let result = run(&h, &ctx(true));
    assert!(!result.ok());
    assert_eq!(result.errors[0].code, "WORKFLOW_ACTION_EXEC_FAILED");
    assert!(h.tx.last_tx().unwrap().rolled_back);

    let stored = h.store.get_instance(WS, &h.instance_id).unwrap();
    assert_eq!(stored.current_state, "s1");
    assert!(h.outbox.pending().is_empty());
}

#[test]
fn transition_events_enqueue_after_commit() {
    let h = harness(false);
    let result = run(&h, &ctx(true));
    assert!(result.ok(), "{:?}", result.errors);

    let pending = h.outbox.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "wf.done");
    assert_eq!(pending[0].meta.module_id, "m1");
    assert_eq!(result.events_enqueued, vec![pending[0].meta.event_id.clone()]);
}

#[test]
fn unknown_instance_is_reported() {
    let h = harness(false);
    let deps = WorkflowDeps {
        store: &h.store,
        plan: PlanDeps {
            tx: &h.tx,
            records: &h.records,
            actions: None,
            queries: None,
            outbox: Some(&h.outbox),
        },
        action_decls: &h.decls,
    };
    let result = apply_workflow_step(WS, &workflow(), "ghost", &ctx(true), &deps);
    assert!(!result.ok());
    assert_eq!(result.errors[0].code, "WORKFLOW_INSTANCE_NOT_FOUND");
}
