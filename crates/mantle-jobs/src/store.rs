// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable job store.
//!
//! Enqueue is idempotent over `(workspace, type, idempotency_key)`;
//! claiming flips `queued → running` under a single lock so a job is only
//! ever owned by one worker.

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (possibly until `run_at`).
    Queued,
    /// Claimed by a worker.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Failed without retry (fatal errors, cancellation keeps `Dead`).
    Failed,
    /// Retry budget exhausted.
    Dead,
}

/// One durable unit of async work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Job id.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Handler selector (`email.send`, `doc.generate`, `automation.run`,
    /// `attachments.cleanup`).
    #[serde(rename = "type")]
    pub job_type: String,
    /// Handler payload.
    pub payload: Value,
    /// Higher runs first.
    pub priority: i64,
    /// Status.
    pub status: JobStatus,
    /// Claim count; incremented on claim.
    pub attempt: u32,
    /// Retry budget.
    pub max_attempts: u32,
    /// Earliest execution time.
    pub run_at: String,
    /// Claiming worker id.
    #[serde(default)]
    pub locked_by: Option<String>,
    /// Claim timestamp.
    #[serde(default)]
    pub locked_at: Option<String>,
    /// Deduplication key.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Last failure message.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

/// Parameters for [`JobStore::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueJob {
    /// Owning workspace.
    pub workspace_id: String,
    /// Handler selector.
    pub job_type: String,
    /// Handler payload.
    pub payload: Value,
    /// Scheduling priority (default 0).
    pub priority: i64,
    /// Earliest execution time; `None` means now.
    pub run_at: Option<DateTime<Utc>>,
    /// Deduplication key.
    pub idempotency_key: Option<String>,
    /// Retry budget (default 10).
    pub max_attempts: Option<u32>,
}

impl EnqueueJob {
    /// A job runnable immediately with default priority and budget.
    #[must_use]
    pub fn new(workspace_id: &str, job_type: &str, payload: Value) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            job_type: job_type.to_string(),
            payload,
            priority: 0,
            run_at: None,
            idempotency_key: None,
            max_attempts: None,
        }
    }

    /// Attach a deduplication key.
    #[must_use]
    pub fn idempotent(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Delay execution until `run_at`.
    #[must_use]
    pub fn at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// A diagnostic event attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobEvent {
    /// Event id.
    pub id: String,
    /// Owning job.
    pub job_id: String,
    /// Timestamp.
    pub ts: String,
    /// Severity (`info`, `warn`, `error`).
    pub level: String,
    /// Message.
    pub message: String,
    /// Structured detail.
    #[serde(default)]
    pub data: Option<Value>,
}

/// Default retry budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn now_ts() -> String {
    fmt_ts(Utc::now())
}

/// Retry backoff: `min(60 * 2^(attempt-1), 3600)` seconds.
#[must_use]
pub fn backoff_seconds(attempt: u32) -> i64 {
    let exp = attempt.saturating_sub(1).min(10);
    (60i64 << exp).min(3600)
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Mutex<BTreeMap<String, Job>>,
    events: Mutex<BTreeMap<String, Vec<JobEvent>>>,
}

impl JobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job. With an idempotency key, a matching existing job
    /// (same workspace, type, key) is returned unchanged instead.
    pub fn enqueue(&self, request: EnqueueJob) -> Job {
        let mut jobs = self.jobs.lock().expect("job store poisoned");
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = jobs.values().find(|job| {
                job.idempotency_key.as_deref() == Some(key.as_str())
                    && job.workspace_id == request.workspace_id
                    && job.job_type == request.job_type
            }) {
                return existing.clone();
            }
        }
        let ts = now_ts();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            workspace_id: request.workspace_id,
            job_type: request.job_type,
            payload: request.payload,
            priority: request.priority,
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts: request.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            run_at: request.run_at.map_or_else(now_ts, fmt_ts),
            locked_by: None,
            locked_at: None,
            idempotency_key: request.idempotency_key,
            last_error: None,
            created_at: ts.clone(),
            updated_at: ts,
        };
        jobs.insert(job.id.clone(), job.clone());
        job
    }

    /// Fetch one job.
    #[must_use]
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().expect("job store poisoned").get(job_id).cloned()
    }

    /// List a workspace's jobs, newest first, optionally filtered.
    #[must_use]
    pub fn list(
        &self,
        workspace_id: &str,
        status: Option<JobStatus>,
        job_type: Option<&str>,
        limit: usize,
    ) -> Vec<Job> {
        let mut out: Vec<Job> = self
            .jobs
            .lock()
            .expect("job store poisoned")
            .values()
            .filter(|job| {
                job.workspace_id == workspace_id
                    && status.is_none_or(|s| job.status == s)
                    && job_type.is_none_or(|t| job.job_type == t)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        out.truncate(limit.max(1));
        out
    }

    /// Claim up to `limit` runnable jobs for `worker_id`: queued, due,
    /// highest priority first and earliest `run_at` within a priority.
    /// The flip to `running` (with `attempt + 1`) happens under the store
    /// lock, so no job is double-assigned.
    pub fn claim_batch(&self, limit: usize, worker_id: &str) -> Vec<Job> {
        let now = now_ts();
        let mut jobs = self.jobs.lock().expect("job store poisoned");

        let mut ready: Vec<String> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued && job.run_at <= now)
            .map(|job| job.id.clone())
            .collect();
        ready.sort_by(|a, b| {
            let ja = &jobs[a];
            let jb = &jobs[b];
            jb.priority
                .cmp(&ja.priority)
                .then_with(|| ja.run_at.cmp(&jb.run_at))
                .then_with(|| ja.created_at.cmp(&jb.created_at))
        });

        let mut claimed = Vec::new();
        for id in ready.into_iter().take(limit) {
            let job = jobs.get_mut(&id).expect("job disappeared under lock");
            job.status = JobStatus::Running;
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now_ts());
            job.attempt += 1;
            job.updated_at = now_ts();
            claimed.push(job.clone());
        }
        claimed
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut Job)) -> Option<Job> {
        let mut jobs = self.jobs.lock().expect("job store poisoned");
        let job = jobs.get_mut(job_id)?;
        f(job);
        job.updated_at = now_ts();
        Some(job.clone())
    }

    /// Mark a job succeeded and clear its lock.
    pub fn mark_succeeded(&self, job_id: &str) -> Option<Job> {
        self.update(job_id, |job| {
            job.status = JobStatus::Succeeded;
            job.locked_by = None;
            job.locked_at = None;
        })
    }

    /// Mark a job failed (not retriable).
    pub fn mark_failed(&self, job_id: &str, error: &str) -> Option<Job> {
        self.update(job_id, |job| {
            job.status = JobStatus::Failed;
            job.last_error = Some(error.to_string());
            job.locked_by = None;
            job.locked_at = None;
        })
    }

    /// Mark a job dead (retry budget exhausted).
    pub fn mark_dead(&self, job_id: &str, error: &str) -> Option<Job> {
        self.update(job_id, |job| {
            job.status = JobStatus::Dead;
            job.last_error = Some(error.to_string());
            job.locked_by = None;
            job.locked_at = None;
        })
    }

    /// Re-queue a failed attempt with a future `run_at`.
    pub fn requeue(&self, job_id: &str, run_at: DateTime<Utc>, error: &str) -> Option<Job> {
        self.update(job_id, |job| {
            job.status = JobStatus::Queued;
            job.run_at = fmt_ts(run_at);
            job.last_error = Some(error.to_string());
            job.locked_by = None;
            job.locked_at = None;
        })
    }

    /// Reset a dead or failed job for another try.
    pub fn retry(&self, job_id: &str) -> Option<Job> {
        self.update(job_id, |job| {
            if matches!(job.status, JobStatus::Dead | JobStatus::Failed) {
                job.status = JobStatus::Queued;
                job.run_at = now_ts();
                job.attempt = 0;
                job.last_error = None;
            }
        })
    }

    /// Cancel a queued job: `dead` with `Cancelled` as the last error. No
    /// in-flight cancellation is attempted.
    pub fn cancel(&self, job_id: &str) -> Option<Job> {
        self.update(job_id, |job| {
            if job.status == JobStatus::Queued {
                job.status = JobStatus::Dead;
                job.last_error = Some("Cancelled".into());
            }
        })
    }

    /// Append a diagnostic event to a job.
    pub fn add_event(&self, job_id: &str, level: &str, message: &str, data: Option<Value>) -> JobEvent {
        let event = JobEvent {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            ts: now_ts(),
            level: level.to_string(),
            message: message.to_string(),
            data,
        };
        self.events
            .lock()
            .expect("job events poisoned")
            .entry(job_id.to_string())
            .or_default()
            .push(event.clone());
        event
    }

    /// Diagnostic events for a job, in append order.
    #[must_use]
    pub fn list_events(&self, job_id: &str, limit: usize) -> Vec<JobEvent> {
        self.events
            .lock()
            .expect("job events poisoned")
            .get(job_id)
            .map(|events| events.iter().take(limit.max(1)).cloned().collect())
            .unwrap_or_default()
    }

    /// Compute the next retry time for an attempt.
    #[must_use]
    pub fn next_run_at(attempt: u32) -> DateTime<Utc> {
        Utc::now() + Duration::seconds(backoff_seconds(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn idempotent_enqueue_collapses() {
        let store = JobStore::new();
        let a = store.enqueue(EnqueueJob::new("w1", "email.send", json!({})).idempotent("k1"));
        let b = store.enqueue(EnqueueJob::new("w1", "email.send", json!({})).idempotent("k1"));
        assert_eq!(a.id, b.id);

        // Different type or workspace is a different job.
        let c = store.enqueue(EnqueueJob::new("w1", "doc.generate", json!({})).idempotent("k1"));
        let d = store.enqueue(EnqueueJob::new("w2", "email.send", json!({})).idempotent("k1"));
        assert_ne!(a.id, c.id);
        assert_ne!(a.id, d.id);
    }

    #[test]
    fn claim_order_priority_then_run_at() {
        let store = JobStore::new();
        let _low = store.enqueue(EnqueueJob::new("w1", "email.send", json!({"n": 1})));
        let high = store.enqueue(EnqueueJob {
            priority: 5,
            ..EnqueueJob::new("w1", "email.send", json!({"n": 2}))
        });
        let mid = store.enqueue(EnqueueJob {
            priority: 1,
            ..EnqueueJob::new("w1", "doc.generate", json!({"n": 3}))
        });

        let claimed = store.claim_batch(2, "worker-a");
        assert_eq!(claimed[0].id, high.id);
        assert_eq!(claimed[1].id, mid.id);
        assert_eq!(claimed[0].attempt, 1);
        assert_eq!(claimed[0].status, JobStatus::Running);
    }

    #[test]
    fn claims_are_single_owner() {
        let store = JobStore::new();
        store.enqueue(EnqueueJob::new("w1", "email.send", json!({})));
        let first = store.claim_batch(5, "worker-a");
        let second = store.claim_batch(5, "worker-b");
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn future_run_at_is_not_claimable() {
        let store = JobStore::new();
        store.enqueue(
            EnqueueJob::new("w1", "automation.run", json!({}))
                .at(Utc::now() + Duration::seconds(3600)),
        );
        assert!(store.claim_batch(5, "w").is_empty());
    }

    #[test]
    fn backoff_sequence_caps_at_an_hour() {
        assert_eq!(backoff_seconds(1), 60);
        assert_eq!(backoff_seconds(2), 120);
        assert_eq!(backoff_seconds(3), 240);
        assert_eq!(backoff_seconds(7), 3600);
        assert_eq!(backoff_seconds(10), 3600);
    }

    #[test]
    fn cancel_only_affects_queued_jobs() {
        let store = JobStore::new();
        let job = store.enqueue(EnqueueJob::new("w1", "email.send", json!({})));
        let cancelled = store.cancel(&job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Dead);
        assert_eq!(cancelled.last_error.as_deref(), Some("Cancelled"));

        let job = store.enqueue(EnqueueJob::new("w1", "email.send", json!({"x": 1})));
        store.claim_batch(5, "w");
        let untouched = store.cancel(&job.id).unwrap();
        assert_eq!(untouched.status, JobStatus::Running);
    }

    #[test]
    fn retry_resets_dead_jobs() {
        let store = JobStore::new();
        let job = store.enqueue(EnqueueJob::new("w1", "email.send", json!({})));
        store.claim_batch(5, "w");
        store.mark_dead(&job.id, "boom");
        let retried = store.retry(&job.id).unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.attempt, 0);
    }
}
