// SPDX-License-Identifier: MIT OR Apache-2.0
//! Automations: event-driven step programs.
//!
//! This crate holds the contract types, the workspace-scoped store, the
//! trigger matcher, and notifications. The step runtime itself lives in the
//! worker crate, which owns the job queue the runtime re-enqueues into.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod matcher;
mod model;
mod notify;
mod store;

pub use matcher::match_event;
pub use model::{
    Automation, AutomationExport, AutomationRun, AutomationStatus, AutomationTrigger, RetryPolicy,
    RunStatus, Step, StepRun, StepRunStatus,
};
pub use notify::{Notification, NotificationStore};
pub use store::{AutomationError, AutomationStore};

#[cfg(test)]
mod export_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn export_import_round_trips_semantically() {
        let store = AutomationStore::new();
        let trigger: AutomationTrigger = serde_json::from_value(json!({
            "kind": "event",
            "event_types": ["workflow.status_changed"],
            "filters": [{"path": "to", "op": "eq", "value": "done"}],
        }))
        .unwrap();
        let steps: Vec<Step> = serde_json::from_value(json!([
            {"kind": "condition", "expr": {"op": "exists", "left": {"var": "record_id"}}},
            {"kind": "action", "action_id": "system.noop"},
        ]))
        .unwrap();
        let original = store.create("w", "Close out", Some("desc"), trigger, steps);

        let export = AutomationExport::from(&original);
        let text = serde_json::to_string(&export).unwrap();
        let imported: AutomationExport = serde_json::from_str(&text).unwrap();

        let reimported = store.create(
            "w",
            &imported.name,
            imported.description.as_deref(),
            imported.trigger,
            imported.steps,
        );
        assert_eq!(reimported.name, original.name);
        assert_eq!(reimported.description, original.description);
        assert_eq!(reimported.trigger, original.trigger);
        assert_eq!(reimported.steps, original.steps);
    }
}
