// SPDX-License-Identifier: MIT OR Apache-2.0
//! Trigger matching.

use crate::model::AutomationTrigger;
use mantle_condition::match_filters;
use serde_json::Value;

/// Whether a trigger fires for an event: the event type must be subscribed
/// and every payload filter must pass.
#[must_use]
pub fn match_event(trigger: &AutomationTrigger, event_type: &str, payload: &Value) -> bool {
    if trigger.kind != "event" {
        return false;
    }
    if !trigger.event_types.iter().any(|t| t == event_type) {
        return false;
    }
    match_filters(&trigger.filters, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantle_condition::TriggerFilter;
    use serde_json::json;

    fn trigger(filters: Vec<TriggerFilter>) -> AutomationTrigger {
        AutomationTrigger {
            kind: "event".into(),
            event_types: vec!["workflow.status_changed".into()],
            filters,
        }
    }

    #[test]
    fn event_type_must_be_subscribed() {
        let t = trigger(vec![]);
        assert!(match_event(&t, "workflow.status_changed", &json!({})));
        assert!(!match_event(&t, "record.created", &json!({})));
    }

    #[test]
    fn filters_gate_the_match() {
        let t = trigger(vec![TriggerFilter {
            path: "to".into(),
            op: "eq".into(),
            value: json!("done"),
        }]);
        assert!(match_event(&t, "workflow.status_changed", &json!({"to": "done"})));
        assert!(!match_event(&t, "workflow.status_changed", &json!({"to": "draft"})));
    }

    #[test]
    fn non_event_triggers_never_match() {
        let mut t = trigger(vec![]);
        t.kind = "schedule".into();
        assert!(!match_event(&t, "workflow.status_changed", &json!({})));
    }
}
