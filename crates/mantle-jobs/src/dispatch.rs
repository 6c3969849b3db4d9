// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event → automation dispatch.
//!
//! Subscribed to the bus, the dispatcher scans published automations in
//! the event's workspace, materializes a run per match, and enqueues the
//! first `automation.run` job with an enqueue-scoped idempotency key so a
//! double-published event cannot double-start a run.

use crate::store::{EnqueueJob, JobStore};
use mantle_automation::{AutomationRun, AutomationStatus, AutomationStore, match_event};
use mantle_events::{
    ACTION_CLICKED, EventBus, EventEnvelope, RECORD_CREATED, RECORD_UPDATED,
    WORKFLOW_STATUS_CHANGED,
};
use serde_json::json;
use std::sync::Arc;

/// Matches events against published automations for one workspace.
pub struct AutomationDispatcher {
    workspace: String,
    automations: Arc<AutomationStore>,
    jobs: Arc<JobStore>,
}

impl AutomationDispatcher {
    /// Build a dispatcher for a workspace.
    #[must_use]
    pub fn new(
        workspace: impl Into<String>,
        automations: Arc<AutomationStore>,
        jobs: Arc<JobStore>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            automations,
            jobs,
        }
    }

    /// Handle one event: one run (plus one queued job) per matching
    /// published automation.
    pub fn on_event(&self, event: &EventEnvelope) -> Vec<AutomationRun> {
        let mut runs = Vec::new();
        for automation in self
            .automations
            .list(&self.workspace, Some(AutomationStatus::Published))
        {
            if !match_event(&automation.trigger, &event.name, &event.payload) {
                continue;
            }
            let run = self.automations.create_run(
                &self.workspace,
                &automation.id,
                &event.name,
                event.payload.clone(),
            );
            self.jobs.enqueue(
                EnqueueJob::new(
                    &self.workspace,
                    "automation.run",
                    json!({"run_id": run.id}),
                )
                .idempotent(format!("{}:0:enqueue", run.id)),
            );
            tracing::debug!(
                automation = %automation.id,
                run = %run.id,
                event = %event.name,
                "automation matched"
            );
            runs.push(run);
        }
        runs
    }

    /// Subscribe a dispatcher to every generic runtime event on `bus`.
    pub fn attach(dispatcher: &Arc<Self>, bus: &EventBus) {
        for name in [
            RECORD_CREATED,
            RECORD_UPDATED,
            WORKFLOW_STATUS_CHANGED,
            ACTION_CLICKED,
        ] {
            let dispatcher = Arc::clone(dispatcher);
            bus.subscribe(
                name,
                Box::new(move |event| {
                    dispatcher.on_event(event);
                    Ok(())
                }),
            );
        }
    }
}
