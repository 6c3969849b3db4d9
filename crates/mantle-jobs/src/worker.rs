// SPDX-License-Identifier: MIT OR Apache-2.0
//! The background worker: poll, claim, execute.
//!
//! Single-instance, cooperative per job; multiple workers may share the
//! queue because claiming is single-owner. Retriable failures re-queue
//! with exponential backoff; secret failures are fatal; exhausted retry
//! budgets dead-letter the job.

use crate::context::with_workspace;
use crate::runtime;
use crate::store::{Job, JobStore};
use anyhow::{Context, bail};
use chrono::{Duration, Utc};
use mantle_actions::ActionExecutor;
use mantle_automation::{AutomationStore, NotificationStore};
use mantle_config::RuntimeSettings;
use mantle_mail::{
    ConnectionStore, EmailMessage, EmailOutboxStore, EmailTemplateStore, ProviderRegistry,
};
use mantle_records::RecordStore;
use mantle_registry::ModuleRegistry;
use mantle_render::{
    DocTemplateStore, PdfRenderer, normalize_margins, render_template, wrap_band_html,
};
use mantle_storage::{AttachmentStore, SecretStore, SecretStoreError, Storage};
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

/// Everything a worker (and the automation runtime) reaches for.
pub struct Services {
    /// Job queue.
    pub jobs: Arc<JobStore>,
    /// Automations, runs, step runs.
    pub automations: Arc<AutomationStore>,
    /// In-app notifications.
    pub notifications: Arc<NotificationStore>,
    /// Email connections.
    pub connections: Arc<ConnectionStore>,
    /// Email templates.
    pub email_templates: Arc<EmailTemplateStore>,
    /// Email outbox rows.
    pub email_outbox: Arc<EmailOutboxStore>,
    /// Document templates.
    pub doc_templates: Arc<DocTemplateStore>,
    /// Attachment rows and links.
    pub attachments: Arc<AttachmentStore>,
    /// Encrypted secrets.
    pub secrets: Arc<SecretStore>,
    /// Byte storage.
    pub storage: Arc<dyn Storage>,
    /// PDF rendering boundary.
    pub pdf: Arc<dyn PdfRenderer>,
    /// Email transports by connection type.
    pub providers: Arc<ProviderRegistry>,
    /// Generic records.
    pub records: Arc<RecordStore>,
    /// Module registry.
    pub registry: Arc<ModuleRegistry>,
    /// Action executor for module actions inside automations.
    pub executor: Arc<ActionExecutor>,
    /// Runtime settings.
    pub settings: RuntimeSettings,
}

/// The poll-claim-execute worker.
pub struct Worker {
    worker_id: String,
    services: Arc<Services>,
}

impl Worker {
    /// Create a worker with a fresh id.
    #[must_use]
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            worker_id: Uuid::new_v4().to_string(),
            services,
        }
    }

    /// This worker's claim id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll forever. Sleeps `WORKER_POLL_MS` between empty claims.
    pub async fn run(&self) {
        let poll = std::time::Duration::from_millis(self.services.settings.worker_poll_ms);
        loop {
            let processed = self.run_once().await;
            if processed == 0 {
                tokio::time::sleep(poll).await;
            }
        }
    }

    /// Claim and process one batch; returns how many jobs were handled.
    pub async fn run_once(&self) -> usize {
        let batch = self
            .services
            .jobs
            .claim_batch(self.services.settings.worker_batch, &self.worker_id);
        let count = batch.len();
        for job in batch {
            with_workspace(&job.workspace_id, self.process(&job)).await;
        }
        count
    }

    /// Drain the queue: keep claiming until a cycle handles nothing.
    /// Delayed jobs (future `run_at`) are left queued.
    pub async fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            let processed = self.run_once().await;
            if processed == 0 {
                return total;
            }
            total += processed;
        }
    }

    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type))]
    async fn process(&self, job: &Job) {
        let result = self.dispatch(job).await;
        let jobs = &self.services.jobs;
        match result {
            Ok(()) => {
                jobs.mark_succeeded(&job.id);
            }
            Err(err) if err.downcast_ref::<SecretStoreError>().is_some() => {
                // Secret resolution failures are configuration problems;
                // retrying cannot fix them.
                tracing::error!(error = %err, "job failed on secret resolution");
                jobs.mark_failed(&job.id, &err.to_string());
            }
            Err(err) => {
                if job.attempt >= job.max_attempts {
                    tracing::error!(error = %err, attempt = job.attempt, "job dead-lettered");
                    jobs.mark_dead(&job.id, &err.to_string());
                } else {
                    let run_at = JobStore::next_run_at(job.attempt);
                    tracing::warn!(error = %err, attempt = job.attempt, "job re-queued");
                    jobs.requeue(&job.id, run_at, &err.to_string());
                }
            }
        }
        let status = jobs
            .get(&job.id)
            .map(|j| serde_json::to_value(j.status).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        jobs.add_event(&job.id, "info", "job_finished", Some(json!({"status": status})));
    }

    async fn dispatch(&self, job: &Job) -> anyhow::Result<()> {
        match job.job_type.as_str() {
            "email.send" => self.handle_email_send(job).await,
            "doc.generate" => self.handle_doc_generate(job),
            "automation.run" => {
                let run_id = job
                    .payload
                    .get("run_id")
                    .and_then(Value::as_str)
                    .context("automation.run missing run_id")?;
                runtime::run_automation(&self.services, &job.workspace_id, run_id)
            }
            "attachments.cleanup" => self.handle_attachments_cleanup(job),
            other => bail!("unknown job type: {other}"),
        }
    }

    async fn handle_email_send(&self, job: &Job) -> anyhow::Result<()> {
        let services = &self.services;
        let workspace = &job.workspace_id;
        let outbox_id = job
            .payload
            .get("outbox_id")
            .and_then(Value::as_str)
            .context("missing outbox_id")?;
        let outbox = services
            .email_outbox
            .get(workspace, outbox_id)
            .context("outbox row not found")?;

        let connection = job
            .payload
            .get("connection_id")
            .and_then(Value::as_str)
            .and_then(|id| services.connections.get(workspace, id))
            .or_else(|| services.connections.default_email(workspace))
            .context("email connection not found")?;

        let provider = services
            .providers
            .get(&connection.connection_type)
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        let secret = match &connection.secret_ref {
            Some(secret_ref) => services.secrets.resolve(
                workspace,
                Some(secret_ref),
                services.settings.app_secret_key.as_deref().unwrap_or(""),
                &services.settings.app_env,
                None,
            )?,
            None => String::new(),
        };

        let message = EmailMessage {
            to: outbox.to.clone(),
            cc: outbox.cc.clone(),
            bcc: outbox.bcc.clone(),
            from_email: outbox.from_email.clone(),
            reply_to: outbox.reply_to.clone(),
            subject: outbox.subject.clone(),
            body_html: outbox.body_html.clone(),
            body_text: outbox.body_text.clone(),
        };
        let receipt = provider
            .send(&message, &connection, &secret, workspace)
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        services
            .email_outbox
            .mark_sent(workspace, outbox_id, Some(&receipt.message_id))
            .context("outbox row vanished")?;
        Ok(())
    }

    fn handle_doc_generate(&self, job: &Job) -> anyhow::Result<()> {
        let services = &self.services;
        let workspace = &job.workspace_id;
        let payload = &job.payload;
        let template_id = payload
            .get("template_id")
            .and_then(Value::as_str)
            .context("missing template_id")?;
        let entity_id = payload
            .get("entity_id")
            .and_then(Value::as_str)
            .context("missing entity_id")?;
        let record_id = payload
            .get("record_id")
            .and_then(Value::as_str)
            .context("missing record_id")?;
        let purpose = payload
            .get("purpose")
            .and_then(Value::as_str)
            .unwrap_or("default");

        let template = services
            .doc_templates
            .get(workspace, template_id)
            .context("doc template not found")?;
        let record = runtime::fetch_record_value(services, workspace, entity_id, record_id)
            .context("record not found")?;

        let render_ctx = json!({"record": record, "entity_id": entity_id});
        let html = render_template(&template.html, &render_ctx, true)
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        let filename_pattern = template
            .filename_pattern
            .clone()
            .unwrap_or_else(|| template.name.clone());
        let filename = render_template(&filename_pattern, &render_ctx, true)
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        let margins = normalize_margins(&template.margins)?;
        let header = match &template.header_html {
            Some(header) if !header.is_empty() => {
                let rendered = render_template(header, &render_ctx, true)
                    .map_err(|err| anyhow::anyhow!("{err}"))?;
                Some(wrap_band_html(&rendered, &margins))
            }
            _ => None,
        };
        let footer = match &template.footer_html {
            Some(footer) if !footer.is_empty() => {
                let rendered = render_template(footer, &render_ctx, true)
                    .map_err(|err| anyhow::anyhow!("{err}"))?;
                Some(wrap_band_html(&rendered, &margins))
            }
            _ => None,
        };

        let pdf_bytes = services.pdf.render_pdf(
            &html,
            &template.paper_size,
            &margins,
            header.as_deref(),
            footer.as_deref(),
        )?;

        let stored = services.storage.store_bytes(
            workspace,
            &format!("{filename}.pdf"),
            &pdf_bytes,
            Some("application/pdf"),
            None,
        )?;
        let attachment = services.attachments.create(
            workspace,
            &format!("{filename}.pdf"),
            Some("application/pdf"),
            stored.size,
            &stored.storage_key,
            &stored.sha256,
            Some("worker"),
            "generated",
        );
        services.attachments.link(
            workspace,
            &attachment.id,
            entity_id,
            record_id,
            &format!("template:{template_id}"),
        );
        if purpose != "default" && !purpose.is_empty() {
            services
                .attachments
                .link(workspace, &attachment.id, entity_id, record_id, purpose);
        }
        Ok(())
    }

    fn handle_attachments_cleanup(&self, job: &Job) -> anyhow::Result<()> {
        let services = &self.services;
        let workspace = &job.workspace_id;
        let payload = &job.payload;
        let source = payload
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("preview");
        let hours = payload
            .get("older_than_hours")
            .and_then(Value::as_i64)
            .or_else(|| {
                payload
                    .get("older_than_hours")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
            })
            .unwrap_or(24);
        let limit = payload
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(200) as usize;

        let cutoff = (Utc::now() - Duration::hours(hours))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        let deleted = services
            .attachments
            .delete_by_source_before(workspace, source, &cutoff, limit);
        for attachment in &deleted {
            services
                .storage
                .delete_storage(workspace, &attachment.storage_key, None);
        }
        tracing::info!(count = deleted.len(), source, "attachments cleaned up");
        Ok(())
    }
}
