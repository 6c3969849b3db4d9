// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable jobs and the background worker.
//!
//! The job store provides idempotent enqueue and single-owner claiming;
//! the worker polls, binds the job's workspace for the duration of the
//! handler, and dispatches `email.send`, `doc.generate`, `automation.run`,
//! and `attachments.cleanup`. The automation runtime lives here too — it
//! re-enqueues into the same queue for delays and retries.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod context;
mod dispatch;
mod runtime;
mod store;
mod worker;

pub use context::{current_workspace, with_workspace};
pub use dispatch::AutomationDispatcher;
pub use runtime::{MAX_STEPS_PER_CYCLE, retry_run, run_automation};
pub use store::{
    DEFAULT_MAX_ATTEMPTS, EnqueueJob, Job, JobEvent, JobStatus, JobStore, backoff_seconds,
};
pub use worker::{Services, Worker};

/// Install the worker's structured-log subscriber: compact fmt output with
/// an `RUST_LOG`-style env filter, defaulting to `info`. A no-op when a
/// global subscriber is already set (tests, embedding hosts).
pub fn init_worker_telemetry() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
