// SPDX-License-Identifier: MIT OR Apache-2.0
//! Email connections, templates, and the email outbox.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// SMTP transport security modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// Plain connection.
    None,
    /// Upgrade via STARTTLS.
    Starttls,
    /// Implicit TLS.
    Ssl,
}

impl SmtpSecurity {
    /// Parse the config tag.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "none" => Some(Self::None),
            "starttls" => Some(Self::Starttls),
            "ssl" => Some(Self::Ssl),
            _ => None,
        }
    }
}

/// Provider-facing connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionConfig {
    /// SMTP host.
    #[serde(default)]
    pub host: Option<String>,
    /// SMTP port.
    #[serde(default)]
    pub port: Option<u16>,
    /// SMTP security mode tag (`none|starttls|ssl`).
    #[serde(default)]
    pub security: Option<String>,
    /// SMTP username.
    #[serde(default)]
    pub username: Option<String>,
    /// Sender address.
    #[serde(default)]
    pub from_email: Option<String>,
    /// Sender display name.
    #[serde(default)]
    pub from_name: Option<String>,
    /// Hosted API base URL.
    #[serde(default)]
    pub api_base_url: Option<String>,
}

/// An email connection (`smtp` or `api`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EmailConnection {
    /// Connection id.
    pub id: String,
    /// `smtp` or `api`.
    #[serde(rename = "type")]
    pub connection_type: String,
    /// `active` or `disabled`.
    pub status: String,
    /// Transport configuration.
    pub config: ConnectionConfig,
    /// Reference into the secret store for the credential.
    #[serde(default)]
    pub secret_ref: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

/// Email-side failures.
#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    /// No usable connection was found.
    #[error("[EMAIL_CONNECTION_NOT_FOUND] no email connection configured")]
    ConnectionNotFound,
    /// The connection configuration is invalid.
    #[error("[EMAIL_CONNECTION_INVALID] {detail}")]
    ConnectionInvalid {
        /// What is wrong.
        detail: String,
    },
    /// The referenced template does not exist.
    #[error("[EMAIL_TEMPLATE_NOT_FOUND] template {template_id:?} not found")]
    TemplateNotFound {
        /// Template id.
        template_id: String,
    },
    /// No recipients could be resolved.
    #[error("[EMAIL_RECIPIENTS_UNRESOLVED] no recipients resolved")]
    RecipientsUnresolved,
    /// The message has no subject.
    #[error("[EMAIL_SUBJECT_REQUIRED] email subject required")]
    SubjectRequired,
    /// The outbox row does not exist.
    #[error("[EMAIL_OUTBOX_NOT_FOUND] outbox {outbox_id:?} not found")]
    OutboxNotFound {
        /// Outbox id.
        outbox_id: String,
    },
    /// The provider rejected or failed the send.
    #[error("[EMAIL_PROVIDER_FAILED] {detail}")]
    ProviderFailed {
        /// Provider-reported detail.
        detail: String,
    },
    /// No transport is registered for the connection type.
    #[error("[EMAIL_PROVIDER_UNAVAILABLE] no provider for connection type {connection_type:?}")]
    ProviderUnavailable {
        /// The connection type.
        connection_type: String,
    },
}

/// Validate a connection definition; SMTP connections must carry a host
/// and a recognized security mode.
///
/// # Errors
///
/// [`EmailError::ConnectionInvalid`].
pub fn validate_connection(connection: &EmailConnection) -> Result<(), EmailError> {
    match connection.connection_type.as_str() {
        "smtp" => {
            if connection.config.host.as_deref().unwrap_or("").trim().is_empty() {
                return Err(EmailError::ConnectionInvalid {
                    detail: "missing SMTP host".into(),
                });
            }
            let security = connection.config.security.as_deref().unwrap_or("starttls");
            if SmtpSecurity::parse(security).is_none() {
                return Err(EmailError::ConnectionInvalid {
                    detail: format!("invalid SMTP security mode: {security}"),
                });
            }
            Ok(())
        }
        "api" | "mock" => Ok(()),
        other => Err(EmailError::ConnectionInvalid {
            detail: format!("unknown connection type: {other}"),
        }),
    }
}

/// In-memory connection store, workspace-scoped.
#[derive(Debug, Default)]
pub struct ConnectionStore {
    items: Mutex<BTreeMap<(String, String), EmailConnection>>,
}

impl ConnectionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connection after validating it.
    ///
    /// # Errors
    ///
    /// [`EmailError::ConnectionInvalid`].
    pub fn create(
        &self,
        workspace: &str,
        connection_type: &str,
        config: ConnectionConfig,
        secret_ref: Option<&str>,
    ) -> Result<EmailConnection, EmailError> {
        let ts = now();
        let connection = EmailConnection {
            id: Uuid::new_v4().to_string(),
            connection_type: connection_type.to_string(),
            status: "active".into(),
            config,
            secret_ref: secret_ref.map(String::from),
            created_at: ts.clone(),
            updated_at: ts,
        };
        validate_connection(&connection)?;
        self.items
            .lock()
            .expect("connections poisoned")
            .insert((workspace.to_string(), connection.id.clone()), connection.clone());
        Ok(connection)
    }

    /// Fetch one connection.
    #[must_use]
    pub fn get(&self, workspace: &str, connection_id: &str) -> Option<EmailConnection> {
        self.items
            .lock()
            .expect("connections poisoned")
            .get(&(workspace.to_string(), connection_id.to_string()))
            .cloned()
    }

    /// List connections, newest first, optionally by type/status.
    #[must_use]
    pub fn list(
        &self,
        workspace: &str,
        connection_type: Option<&str>,
        status: Option<&str>,
    ) -> Vec<EmailConnection> {
        let mut out: Vec<EmailConnection> = self
            .items
            .lock()
            .expect("connections poisoned")
            .iter()
            .filter(|((ws, _), c)| {
                ws == workspace
                    && connection_type.is_none_or(|t| c.connection_type == t)
                    && status.is_none_or(|s| c.status == s)
            })
            .map(|(_, c)| c.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// The workspace default: the first active hosted-API connection, or
    /// any active connection otherwise.
    #[must_use]
    pub fn default_email(&self, workspace: &str) -> Option<EmailConnection> {
        let active = self.list(workspace, None, Some("active"));
        active
            .iter()
            .find(|c| c.connection_type == "api")
            .or_else(|| active.first())
            .cloned()
    }
}

/// An email template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EmailTemplate {
    /// Template id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Subject template.
    #[serde(default)]
    pub subject: Option<String>,
    /// HTML body template.
    #[serde(default)]
    pub body_html: Option<String>,
    /// Text body template.
    #[serde(default)]
    pub body_text: Option<String>,
    /// Default connection for sends from this template.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Whether the template is selectable.
    pub is_active: bool,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

/// In-memory template store, workspace-scoped.
#[derive(Debug, Default)]
pub struct EmailTemplateStore {
    items: Mutex<BTreeMap<(String, String), EmailTemplate>>,
}

impl EmailTemplateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a template.
    pub fn create(
        &self,
        workspace: &str,
        name: &str,
        subject: Option<&str>,
        body_html: Option<&str>,
        body_text: Option<&str>,
        connection_id: Option<&str>,
    ) -> EmailTemplate {
        let ts = now();
        let template = EmailTemplate {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            subject: subject.map(String::from),
            body_html: body_html.map(String::from),
            body_text: body_text.map(String::from),
            connection_id: connection_id.map(String::from),
            is_active: true,
            created_at: ts.clone(),
            updated_at: ts,
        };
        self.items
            .lock()
            .expect("templates poisoned")
            .insert((workspace.to_string(), template.id.clone()), template.clone());
        template
    }

    /// Fetch one template.
    #[must_use]
    pub fn get(&self, workspace: &str, template_id: &str) -> Option<EmailTemplate> {
        self.items
            .lock()
            .expect("templates poisoned")
            .get(&(workspace.to_string(), template_id.to_string()))
            .cloned()
    }

    /// List templates, newest first.
    #[must_use]
    pub fn list(&self, workspace: &str) -> Vec<EmailTemplate> {
        let mut out: Vec<EmailTemplate> = self
            .items
            .lock()
            .expect("templates poisoned")
            .iter()
            .filter(|((ws, _), _)| ws == workspace)
            .map(|(_, t)| t.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Merge updates into a template.
    #[must_use]
    pub fn update(&self, workspace: &str, template_id: &str, updates: &Value) -> Option<EmailTemplate> {
        let mut items = self.items.lock().expect("templates poisoned");
        let template = items.get_mut(&(workspace.to_string(), template_id.to_string()))?;
        if let Some(name) = updates.get("name").and_then(Value::as_str) {
            template.name = name.to_string();
        }
        for (key, slot) in [
            ("subject", &mut template.subject),
            ("body_html", &mut template.body_html),
            ("body_text", &mut template.body_text),
            ("connection_id", &mut template.connection_id),
        ] {
            if let Some(value) = updates.get(key) {
                *slot = value.as_str().map(String::from);
            }
        }
        if let Some(active) = updates.get("is_active").and_then(Value::as_bool) {
            template.is_active = active;
        }
        template.updated_at = now();
        Some(template.clone())
    }
}

/// An email awaiting (or after) provider dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EmailOutboxRow {
    /// Row id.
    pub id: String,
    /// Recipients.
    pub to: Vec<String>,
    /// CC recipients.
    #[serde(default)]
    pub cc: Vec<String>,
    /// BCC recipients.
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Sender address.
    #[serde(default)]
    pub from_email: Option<String>,
    /// Reply-to address.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Rendered subject.
    pub subject: String,
    /// Rendered HTML body.
    #[serde(default)]
    pub body_html: Option<String>,
    /// Rendered text body.
    #[serde(default)]
    pub body_text: Option<String>,
    /// `queued`, `sent`, or `failed`.
    pub status: String,
    /// Provider message id after a successful send.
    #[serde(default)]
    pub provider_message_id: Option<String>,
    /// When the provider accepted the message.
    #[serde(default)]
    pub sent_at: Option<String>,
    /// Template the message was rendered from.
    #[serde(default)]
    pub template_id: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
}

/// In-memory email outbox, workspace-scoped.
#[derive(Debug, Default)]
pub struct EmailOutboxStore {
    items: Mutex<BTreeMap<(String, String), EmailOutboxRow>>,
}

impl EmailOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queued row.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        workspace: &str,
        to: Vec<String>,
        cc: Vec<String>,
        bcc: Vec<String>,
        from_email: Option<&str>,
        reply_to: Option<&str>,
        subject: &str,
        body_html: Option<&str>,
        body_text: Option<&str>,
        template_id: Option<&str>,
    ) -> EmailOutboxRow {
        let row = EmailOutboxRow {
            id: Uuid::new_v4().to_string(),
            to,
            cc,
            bcc,
            from_email: from_email.map(String::from),
            reply_to: reply_to.map(String::from),
            subject: subject.to_string(),
            body_html: body_html.map(String::from),
            body_text: body_text.map(String::from),
            status: "queued".into(),
            provider_message_id: None,
            sent_at: None,
            template_id: template_id.map(String::from),
            created_at: now(),
        };
        self.items
            .lock()
            .expect("email outbox poisoned")
            .insert((workspace.to_string(), row.id.clone()), row.clone());
        row
    }

    /// Fetch one row.
    #[must_use]
    pub fn get(&self, workspace: &str, outbox_id: &str) -> Option<EmailOutboxRow> {
        self.items
            .lock()
            .expect("email outbox poisoned")
            .get(&(workspace.to_string(), outbox_id.to_string()))
            .cloned()
    }

    /// Mark a row sent.
    #[must_use]
    pub fn mark_sent(
        &self,
        workspace: &str,
        outbox_id: &str,
        provider_message_id: Option<&str>,
    ) -> Option<EmailOutboxRow> {
        let mut items = self.items.lock().expect("email outbox poisoned");
        let row = items.get_mut(&(workspace.to_string(), outbox_id.to_string()))?;
        row.status = "sent".into();
        row.provider_message_id = provider_message_id.map(String::from);
        row.sent_at = Some(now());
        Some(row.clone())
    }

    /// List rows, newest first, optionally by template.
    #[must_use]
    pub fn list(&self, workspace: &str, template_id: Option<&str>, limit: usize) -> Vec<EmailOutboxRow> {
        let mut out: Vec<EmailOutboxRow> = self
            .items
            .lock()
            .expect("email outbox poisoned")
            .iter()
            .filter(|((ws, _), row)| {
                ws == workspace && template_id.is_none_or(|t| row.template_id.as_deref() == Some(t))
            })
            .map(|(_, row)| row.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(1));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smtp_security_modes_validated() {
        let store = ConnectionStore::new();
        let bad = store.create(
            "w",
            "smtp",
            ConnectionConfig {
                host: Some("mail.example.com".into()),
                security: Some("tls13".into()),
                ..ConnectionConfig::default()
            },
            None,
        );
        assert!(bad.is_err());

        for mode in ["none", "starttls", "ssl"] {
            let ok = store.create(
                "w",
                "smtp",
                ConnectionConfig {
                    host: Some("mail.example.com".into()),
                    security: Some(mode.into()),
                    ..ConnectionConfig::default()
                },
                None,
            );
            assert!(ok.is_ok(), "{mode} should be accepted");
        }
    }

    #[test]
    fn default_prefers_api_connections() {
        let store = ConnectionStore::new();
        store
            .create(
                "w",
                "smtp",
                ConnectionConfig {
                    host: Some("mail.example.com".into()),
                    ..ConnectionConfig::default()
                },
                None,
            )
            .unwrap();
        let api = store.create("w", "api", ConnectionConfig::default(), None).unwrap();
        assert_eq!(store.default_email("w").unwrap().id, api.id);
    }

    #[test]
    fn outbox_send_flow() {
        let store = EmailOutboxStore::new();
        let row = store.create(
            "w",
            vec!["a@example.com".into()],
            vec![],
            vec![],
            Some("noreply@example.com"),
            None,
            "Hi",
            Some("<p>hi</p>"),
            None,
            None,
        );
        assert_eq!(row.status, "queued");
        let sent = store.mark_sent("w", &row.id, Some("pm-1")).unwrap();
        assert_eq!(sent.status, "sent");
        assert_eq!(sent.provider_message_id.as_deref(), Some("pm-1"));
        assert!(sent.sent_at.is_some());
    }
}
