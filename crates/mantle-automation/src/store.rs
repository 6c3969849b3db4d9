// SPDX-License-Identifier: MIT OR Apache-2.0
//! Automation, run, and step-run storage.

use crate::model::{
    Automation, AutomationRun, AutomationStatus, AutomationTrigger, RunStatus, Step, StepRun,
    StepRunStatus,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Typed store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AutomationError {
    /// No automation with that id.
    #[error("[AUTOMATION_NOT_FOUND] automation {id:?} not found")]
    NotFound {
        /// Automation id.
        id: String,
    },
    /// No run with that id.
    #[error("[AUTOMATION_RUN_NOT_FOUND] run {run_id:?} not found")]
    RunNotFound {
        /// Run id.
        run_id: String,
    },
}

/// In-memory, workspace-scoped automation store.
#[derive(Debug, Default)]
pub struct AutomationStore {
    automations: Mutex<BTreeMap<(String, String), Automation>>,
    runs: Mutex<BTreeMap<(String, String), AutomationRun>>,
    step_runs: Mutex<BTreeMap<(String, String), StepRun>>,
}

impl AutomationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- automations --------------------------------------------------------

    /// Create an automation in `Draft` status.
    pub fn create(
        &self,
        workspace: &str,
        name: &str,
        description: Option<&str>,
        trigger: AutomationTrigger,
        steps: Vec<Step>,
    ) -> Automation {
        let ts = now();
        let automation = Automation {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(String::from),
            status: AutomationStatus::Draft,
            trigger,
            steps,
            created_at: ts.clone(),
            updated_at: ts,
        };
        self.automations
            .lock()
            .expect("automations poisoned")
            .insert((workspace.to_string(), automation.id.clone()), automation.clone());
        automation
    }

    /// Fetch one automation.
    #[must_use]
    pub fn get(&self, workspace: &str, id: &str) -> Option<Automation> {
        self.automations
            .lock()
            .expect("automations poisoned")
            .get(&(workspace.to_string(), id.to_string()))
            .cloned()
    }

    /// List automations, optionally filtered by status, newest-updated
    /// first.
    #[must_use]
    pub fn list(&self, workspace: &str, status: Option<AutomationStatus>) -> Vec<Automation> {
        let mut out: Vec<Automation> = self
            .automations
            .lock()
            .expect("automations poisoned")
            .iter()
            .filter(|((ws, _), automation)| {
                ws == workspace && status.is_none_or(|s| automation.status == s)
            })
            .map(|(_, automation)| automation.clone())
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Replace name/description/trigger/steps of an automation.
    ///
    /// # Errors
    ///
    /// [`AutomationError::NotFound`] when absent.
    pub fn update_definition(
        &self,
        workspace: &str,
        id: &str,
        name: Option<&str>,
        description: Option<&str>,
        trigger: Option<AutomationTrigger>,
        steps: Option<Vec<Step>>,
    ) -> Result<Automation, AutomationError> {
        let mut automations = self.automations.lock().expect("automations poisoned");
        let Some(automation) = automations.get_mut(&(workspace.to_string(), id.to_string())) else {
            return Err(AutomationError::NotFound { id: id.to_string() });
        };
        if let Some(name) = name {
            automation.name = name.to_string();
        }
        if let Some(description) = description {
            automation.description = Some(description.to_string());
        }
        if let Some(trigger) = trigger {
            automation.trigger = trigger;
        }
        if let Some(steps) = steps {
            automation.steps = steps;
        }
        automation.updated_at = now();
        Ok(automation.clone())
    }

    /// Move an automation to a new status (publish/disable).
    ///
    /// # Errors
    ///
    /// [`AutomationError::NotFound`] when absent.
    pub fn set_status(
        &self,
        workspace: &str,
        id: &str,
        status: AutomationStatus,
    ) -> Result<Automation, AutomationError> {
        let mut automations = self.automations.lock().expect("automations poisoned");
        let Some(automation) = automations.get_mut(&(workspace.to_string(), id.to_string())) else {
            return Err(AutomationError::NotFound { id: id.to_string() });
        };
        automation.status = status;
        automation.updated_at = now();
        Ok(automation.clone())
    }

    /// Delete an automation. Returns `false` when absent.
    pub fn delete(&self, workspace: &str, id: &str) -> bool {
        self.automations
            .lock()
            .expect("automations poisoned")
            .remove(&(workspace.to_string(), id.to_string()))
            .is_some()
    }

    // -- runs ---------------------------------------------------------------

    /// Materialize a run for a fired trigger.
    pub fn create_run(
        &self,
        workspace: &str,
        automation_id: &str,
        trigger_type: &str,
        trigger_payload: Value,
    ) -> AutomationRun {
        let ts = now();
        let run = AutomationRun {
            id: Uuid::new_v4().to_string(),
            automation_id: automation_id.to_string(),
            status: RunStatus::Queued,
            current_step_index: 0,
            trigger_type: trigger_type.to_string(),
            trigger_payload,
            started_at: None,
            ended_at: None,
            last_error: None,
            created_at: ts.clone(),
            updated_at: ts,
        };
        self.runs
            .lock()
            .expect("runs poisoned")
            .insert((workspace.to_string(), run.id.clone()), run.clone());
        run
    }

    /// Fetch one run.
    #[must_use]
    pub fn get_run(&self, workspace: &str, run_id: &str) -> Option<AutomationRun> {
        self.runs
            .lock()
            .expect("runs poisoned")
            .get(&(workspace.to_string(), run_id.to_string()))
            .cloned()
    }

    /// List runs, optionally for one automation, newest first.
    #[must_use]
    pub fn list_runs(&self, workspace: &str, automation_id: Option<&str>) -> Vec<AutomationRun> {
        let mut out: Vec<AutomationRun> = self
            .runs
            .lock()
            .expect("runs poisoned")
            .iter()
            .filter(|((ws, _), run)| {
                ws == workspace && automation_id.is_none_or(|id| run.automation_id == id)
            })
            .map(|(_, run)| run.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Apply a closure to a run and return the updated value.
    ///
    /// # Errors
    ///
    /// [`AutomationError::RunNotFound`] when absent.
    pub fn update_run(
        &self,
        workspace: &str,
        run_id: &str,
        f: impl FnOnce(&mut AutomationRun),
    ) -> Result<AutomationRun, AutomationError> {
        let mut runs = self.runs.lock().expect("runs poisoned");
        let Some(run) = runs.get_mut(&(workspace.to_string(), run_id.to_string())) else {
            return Err(AutomationError::RunNotFound {
                run_id: run_id.to_string(),
            });
        };
        f(run);
        run.updated_at = now();
        Ok(run.clone())
    }

    /// Cancel a run: terminal, with `ended_at` set. A no-op for runs that
    /// are already terminal.
    ///
    /// # Errors
    ///
    /// [`AutomationError::RunNotFound`] when absent.
    pub fn cancel_run(&self, workspace: &str, run_id: &str) -> Result<AutomationRun, AutomationError> {
        self.update_run(workspace, run_id, |run| {
            if !run.status.is_terminal() {
                run.status = RunStatus::Cancelled;
                run.ended_at = Some(now());
            }
        })
    }

    /// Reset a failed or cancelled run so it can be re-enqueued. The step
    /// index is kept, so retrying resumes at the failed step.
    ///
    /// # Errors
    ///
    /// [`AutomationError::RunNotFound`] when absent.
    pub fn reset_run_for_retry(
        &self,
        workspace: &str,
        run_id: &str,
    ) -> Result<AutomationRun, AutomationError> {
        self.update_run(workspace, run_id, |run| {
            if matches!(run.status, RunStatus::Failed | RunStatus::Cancelled) {
                run.status = RunStatus::Queued;
                run.ended_at = None;
                run.last_error = None;
            }
        })
    }

    // -- step runs ----------------------------------------------------------

    /// Create a step run in `Running` status.
    #[allow(clippy::too_many_arguments)]
    pub fn create_step_run(
        &self,
        workspace: &str,
        run_id: &str,
        step_index: usize,
        step_id: &str,
        attempt: u32,
        idempotency_key: &str,
        input: Value,
    ) -> StepRun {
        let step_run = StepRun {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            step_index,
            step_id: step_id.to_string(),
            attempt,
            status: StepRunStatus::Running,
            idempotency_key: idempotency_key.to_string(),
            input,
            output: None,
            started_at: now(),
            ended_at: None,
            last_error: None,
        };
        self.step_runs
            .lock()
            .expect("step runs poisoned")
            .insert((workspace.to_string(), step_run.id.clone()), step_run.clone());
        step_run
    }

    /// Finish a step run.
    pub fn finish_step_run(
        &self,
        workspace: &str,
        step_run_id: &str,
        status: StepRunStatus,
        output: Option<Value>,
        last_error: Option<String>,
    ) {
        let mut step_runs = self.step_runs.lock().expect("step runs poisoned");
        if let Some(step_run) = step_runs.get_mut(&(workspace.to_string(), step_run_id.to_string()))
        {
            step_run.status = status;
            step_run.output = output;
            step_run.last_error = last_error;
            step_run.ended_at = Some(now());
        }
    }

    /// Step runs of a run, ordered by step index then attempt.
    #[must_use]
    pub fn list_step_runs(&self, workspace: &str, run_id: &str) -> Vec<StepRun> {
        let mut out: Vec<StepRun> = self
            .step_runs
            .lock()
            .expect("step runs poisoned")
            .iter()
            .filter(|((ws, _), step_run)| ws == workspace && step_run.run_id == run_id)
            .map(|(_, step_run)| step_run.clone())
            .collect();
        out.sort_by(|a, b| {
            a.step_index
                .cmp(&b.step_index)
                .then_with(|| a.attempt.cmp(&b.attempt))
        });
        out
    }

    /// Find a step run by its idempotency key.
    #[must_use]
    pub fn step_run_by_idempotency(&self, workspace: &str, key: &str) -> Option<StepRun> {
        self.step_runs
            .lock()
            .expect("step runs poisoned")
            .iter()
            .find(|((ws, _), step_run)| ws == workspace && step_run.idempotency_key == key)
            .map(|(_, step_run)| step_run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trigger() -> AutomationTrigger {
        AutomationTrigger {
            kind: "event".into(),
            event_types: vec!["record.created".into()],
            filters: vec![],
        }
    }

    #[test]
    fn publish_and_list_by_status() {
        let store = AutomationStore::new();
        let a = store.create("w", "A", None, trigger(), vec![]);
        store.create("w", "B", None, trigger(), vec![]);
        store.set_status("w", &a.id, AutomationStatus::Published).unwrap();

        let published = store.list("w", Some(AutomationStatus::Published));
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name, "A");
        assert_eq!(store.list("w", None).len(), 2);
    }

    #[test]
    fn cancel_is_idempotent_and_terminal() {
        let store = AutomationStore::new();
        let automation = store.create("w", "A", None, trigger(), vec![]);
        let run = store.create_run("w", &automation.id, "record.created", json!({}));

        let cancelled = store.cancel_run("w", &run.id).unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.ended_at.is_some());

        let again = store.cancel_run("w", &run.id).unwrap();
        assert_eq!(again.ended_at, cancelled.ended_at);
    }

    #[test]
    fn step_runs_found_by_idempotency_key() {
        let store = AutomationStore::new();
        let automation = store.create("w", "A", None, trigger(), vec![]);
        let run = store.create_run("w", &automation.id, "record.created", json!({}));
        let key = format!("{}:step_0:0", run.id);
        store.create_step_run("w", &run.id, 0, "step_0", 0, &key, json!({}));

        let found = store.step_run_by_idempotency("w", &key).unwrap();
        assert_eq!(found.step_index, 0);
        assert!(store.step_run_by_idempotency("other", &key).is_none());
    }
}
