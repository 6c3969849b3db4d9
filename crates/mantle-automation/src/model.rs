// SPDX-License-Identifier: MIT OR Apache-2.0
//! Automation contract types.

use mantle_condition::TriggerFilter;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of an automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    /// Editable; never triggered.
    Draft,
    /// Live; matched against events.
    Published,
    /// Retained but never triggered.
    Disabled,
}

/// What an automation listens for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AutomationTrigger {
    /// Trigger kind; only `event` is defined.
    pub kind: String,
    /// Event names that fire this automation.
    pub event_types: Vec<String>,
    /// Filters over the event payload; all must pass.
    #[serde(default)]
    pub filters: Vec<TriggerFilter>,
}

/// Per-step retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    /// Total attempts allowed (the first run counts as attempt 0).
    pub max_attempts: u32,
    /// Seconds between attempts.
    pub backoff_seconds: u32,
}

/// One program step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Invoke a system action or a module action.
    Action {
        /// Step id; defaults to `step_<index>` when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// `system.*` action id or a module action id.
        action_id: String,
        /// Module owning the action (module actions only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        module_id: Option<String>,
        /// Step inputs; `{var}` nodes and `{{ … }}` templates resolve
        /// against the run context.
        #[serde(default)]
        inputs: Map<String, Value>,
        /// Retry policy for failures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_policy: Option<RetryPolicy>,
    },
    /// Branch on a condition over `{trigger}`.
    Condition {
        /// Step id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Condition AST.
        expr: Value,
        /// Next step index when true.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        if_true_goto: Option<usize>,
        /// Next step index when false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        if_false_goto: Option<usize>,
    },
    /// Pause the run; the worker re-enqueues with a future `run_at`.
    Delay {
        /// Step id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Relative delay in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<i64>,
        /// Absolute resume time (ISO 8601).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<String>,
    },
}

impl Step {
    /// The declared step id, or `step_<index>` as fallback.
    #[must_use]
    pub fn id_or_index(&self, index: usize) -> String {
        let id = match self {
            Step::Action { id, .. } | Step::Condition { id, .. } | Step::Delay { id, .. } => id,
        };
        id.clone().unwrap_or_else(|| format!("step_{index}"))
    }

    /// Retry policy, when declared.
    #[must_use]
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        match self {
            Step::Action { retry_policy, .. } => *retry_policy,
            _ => None,
        }
    }
}

/// An automation: trigger plus step program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Automation {
    /// Automation id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Lifecycle status.
    pub status: AutomationStatus,
    /// Trigger definition.
    pub trigger: AutomationTrigger,
    /// Step program.
    pub steps: Vec<Step>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Materialized, waiting for a worker cycle.
    Queued,
    /// Being advanced by a worker.
    Running,
    /// All steps succeeded.
    Succeeded,
    /// A step exhausted its retries or the program was invalid.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl RunStatus {
    /// Whether the run will never advance again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Materialized execution state of one automation firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AutomationRun {
    /// Run id.
    pub id: String,
    /// The automation that fired.
    pub automation_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Index of the next step to execute.
    pub current_step_index: usize,
    /// Event type that fired the trigger.
    pub trigger_type: String,
    /// Event payload at firing time.
    pub trigger_payload: Value,
    /// When the first worker cycle started.
    #[serde(default)]
    pub started_at: Option<String>,
    /// When the run reached a terminal status.
    #[serde(default)]
    pub ended_at: Option<String>,
    /// Last error message, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    /// Created but not finished.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
}

/// One attempt at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepRun {
    /// Step-run id.
    pub id: String,
    /// Owning run.
    pub run_id: String,
    /// Step position in the program.
    pub step_index: usize,
    /// Declared or derived step id.
    pub step_id: String,
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Status.
    pub status: StepRunStatus,
    /// `<run_id>:<step_id>:<attempt>` — dedupes retries of the same
    /// logical execution.
    pub idempotency_key: String,
    /// Step definition at execution time.
    pub input: Value,
    /// Step output, when finished.
    #[serde(default)]
    pub output: Option<Value>,
    /// Start timestamp.
    pub started_at: String,
    /// End timestamp.
    #[serde(default)]
    pub ended_at: Option<String>,
    /// Last error message, if any.
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Portable automation definition for export/import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AutomationExport {
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Trigger definition.
    pub trigger: AutomationTrigger,
    /// Step program.
    pub steps: Vec<Step>,
}

impl From<&Automation> for AutomationExport {
    fn from(automation: &Automation) -> Self {
        Self {
            name: automation.name.clone(),
            description: automation.description.clone(),
            trigger: automation.trigger.clone(),
            steps: automation.steps.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_ids_fall_back_to_index() {
        let step: Step = serde_json::from_value(json!({
            "kind": "action", "action_id": "system.noop",
        }))
        .unwrap();
        assert_eq!(step.id_or_index(3), "step_3");

        let step: Step = serde_json::from_value(json!({
            "kind": "delay", "id": "wait", "seconds": 60,
        }))
        .unwrap();
        assert_eq!(step.id_or_index(0), "wait");
    }

    #[test]
    fn steps_round_trip_through_serde() {
        let steps = json!([
            {"kind": "condition", "expr": {"op": "exists", "left": {"var": "to"}},
             "if_false_goto": 2},
            {"kind": "action", "action_id": "system.notify",
             "inputs": {"recipient_user_ids": ["u1"]},
             "retry_policy": {"max_attempts": 3, "backoff_seconds": 30}},
            {"kind": "delay", "seconds": 10},
        ]);
        let parsed: Vec<Step> = serde_json::from_value(steps.clone()).unwrap();
        assert_eq!(serde_json::to_value(&parsed).unwrap(), steps);
    }
}
