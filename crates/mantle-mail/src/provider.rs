// SPDX-License-Identifier: MIT OR Apache-2.0
//! Email provider boundary.
//!
//! The shipped transport is the hosted HTTP API provider; SMTP transports
//! live behind the same trait at the deployment boundary. A mock provider
//! with programmable failures backs the worker retry tests.

use crate::stores::{EmailConnection, EmailError};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A fully rendered message handed to a provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmailMessage {
    /// Recipients.
    pub to: Vec<String>,
    /// CC recipients.
    pub cc: Vec<String>,
    /// BCC recipients.
    pub bcc: Vec<String>,
    /// Sender address.
    pub from_email: Option<String>,
    /// Reply-to address.
    pub reply_to: Option<String>,
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub body_html: Option<String>,
    /// Text body.
    pub body_text: Option<String>,
}

/// Provider acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    /// Provider-assigned message id.
    pub message_id: String,
}

/// Email transport contract.
#[async_trait]
pub trait EmailProvider: Send + Sync + std::fmt::Debug {
    /// Send a message over a connection.
    ///
    /// # Errors
    ///
    /// [`EmailError::ProviderFailed`] on rejection or transport failure.
    async fn send(
        &self,
        message: &EmailMessage,
        connection: &EmailConnection,
        secret: &str,
        workspace: &str,
    ) -> Result<ProviderReceipt, EmailError>;
}

/// Wall-clock budget for one provider call.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Hosted HTTP API transport.
#[derive(Debug)]
pub struct HttpApiProvider {
    client: reqwest::Client,
}

impl HttpApiProvider {
    /// Build the provider with its 30-second send timeout.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialized.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client }
    }
}

impl Default for HttpApiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailProvider for HttpApiProvider {
    async fn send(
        &self,
        message: &EmailMessage,
        connection: &EmailConnection,
        secret: &str,
        _workspace: &str,
    ) -> Result<ProviderReceipt, EmailError> {
        let from_email = message
            .from_email
            .clone()
            .or_else(|| connection.config.from_email.clone())
            .ok_or(EmailError::ConnectionInvalid {
                detail: "missing from_email".into(),
            })?;
        let sender = match &connection.config.from_name {
            Some(name) => format!("{name} <{from_email}>"),
            None => from_email,
        };
        let base_url = connection
            .config
            .api_base_url
            .clone()
            .ok_or(EmailError::ConnectionInvalid {
                detail: "missing api_base_url".into(),
            })?;

        let payload = json!({
            "From": sender,
            "To": message.to.join(","),
            "Cc": message.cc.join(","),
            "Bcc": message.bcc.join(","),
            "Subject": message.subject,
            "HtmlBody": message.body_html,
            "TextBody": message.body_text,
            "ReplyTo": message.reply_to,
        });

        let response = self
            .client
            .post(format!("{}/email", base_url.trim_end_matches('/')))
            .header("X-Server-Token", secret)
            .json(&payload)
            .send()
            .await
            .map_err(|err| EmailError::ProviderFailed {
                detail: err.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::ProviderFailed {
                detail: format!("api error: {status} {body}"),
            });
        }
        let body: serde_json::Value =
            response.json().await.map_err(|err| EmailError::ProviderFailed {
                detail: err.to_string(),
            })?;
        let message_id = body
            .get("MessageID")
            .or_else(|| body.get("id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ProviderReceipt { message_id })
    }
}

/// Deterministic in-memory provider: fails the first `fail_first` sends,
/// then succeeds, recording every delivered message.
#[derive(Debug, Default)]
pub struct MockEmailProvider {
    fail_first: u32,
    attempts: AtomicU32,
    delivered: Mutex<Vec<EmailMessage>>,
}

impl MockEmailProvider {
    /// A provider that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that fails the first `fail_first` sends.
    #[must_use]
    pub fn failing(fail_first: u32) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    /// Sends attempted so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Messages that were delivered.
    #[must_use]
    pub fn delivered(&self) -> Vec<EmailMessage> {
        self.delivered.lock().expect("mock provider poisoned").clone()
    }
}

#[async_trait]
impl EmailProvider for MockEmailProvider {
    async fn send(
        &self,
        message: &EmailMessage,
        _connection: &EmailConnection,
        _secret: &str,
        _workspace: &str,
    ) -> Result<ProviderReceipt, EmailError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt <= self.fail_first {
            return Err(EmailError::ProviderFailed {
                detail: format!("mock failure on attempt {attempt}"),
            });
        }
        self.delivered
            .lock()
            .expect("mock provider poisoned")
            .push(message.clone());
        Ok(ProviderReceipt {
            message_id: format!("mock-{attempt}"),
        })
    }
}

/// Provider registry keyed by connection type.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, std::sync::Arc<dyn EmailProvider>>,
}

impl ProviderRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the hosted API transport registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("api", std::sync::Arc::new(HttpApiProvider::new()));
        registry
    }

    /// Register a transport for a connection type.
    pub fn register(&mut self, connection_type: &str, provider: std::sync::Arc<dyn EmailProvider>) {
        self.providers.insert(connection_type.to_string(), provider);
    }

    /// Resolve the transport for a connection type.
    ///
    /// # Errors
    ///
    /// [`EmailError::ProviderUnavailable`] when no transport is registered.
    pub fn get(&self, connection_type: &str) -> Result<std::sync::Arc<dyn EmailProvider>, EmailError> {
        self.providers
            .get(connection_type)
            .cloned()
            .ok_or_else(|| EmailError::ProviderUnavailable {
                connection_type: connection_type.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::ConnectionConfig;

    fn connection() -> EmailConnection {
        EmailConnection {
            id: "c1".into(),
            connection_type: "mock".into(),
            status: "active".into(),
            config: ConnectionConfig::default(),
            secret_ref: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[tokio::test]
    async fn mock_provider_fails_then_succeeds() {
        let provider = MockEmailProvider::failing(2);
        let message = EmailMessage {
            to: vec!["a@example.com".into()],
            subject: "Hi".into(),
            ..EmailMessage::default()
        };
        assert!(provider.send(&message, &connection(), "", "w").await.is_err());
        assert!(provider.send(&message, &connection(), "", "w").await.is_err());
        let receipt = provider.send(&message, &connection(), "", "w").await.unwrap();
        assert_eq!(receipt.message_id, "mock-3");
        assert_eq!(provider.delivered().len(), 1);
    }

    #[test]
    fn registry_resolves_by_type() {
        let mut registry = ProviderRegistry::new();
        registry.register("mock", std::sync::Arc::new(MockEmailProvider::new()));
        assert!(registry.get("mock").is_ok());
        assert!(matches!(
            registry.get("smtp").unwrap_err(),
            EmailError::ProviderUnavailable { .. }
        ));
    }
}
