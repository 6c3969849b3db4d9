// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-record activity feed.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Kinds of activity entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEventType {
    /// A user comment.
    Comment,
    /// A tracked-field change.
    Change,
    /// A file attached to the record.
    Attachment,
    /// A runtime-generated entry.
    System,
}

/// Who authored an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActivityAuthor {
    /// Principal id, when known.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name (falls back to "System").
    pub name: String,
    /// Email, when known.
    #[serde(default)]
    pub email: Option<String>,
}

impl ActivityAuthor {
    /// Build an author from a loose actor object (`user_id`/`id`/`sub`,
    /// `name`/`email` keys), the way boundary actors arrive.
    #[must_use]
    pub fn from_actor(actor: Option<&Value>) -> Option<Self> {
        let actor = actor?.as_object()?;
        let id = ["user_id", "id", "sub"]
            .iter()
            .find_map(|key| actor.get(*key).and_then(Value::as_str))
            .map(String::from);
        let email = actor.get("email").and_then(Value::as_str).map(String::from);
        let name = ["name", "full_name", "display_name", "email"]
            .iter()
            .find_map(|key| actor.get(*key).and_then(Value::as_str))
            .unwrap_or("System")
            .to_string();
        Some(Self { id, name, email })
    }
}

/// One activity entry, newest entries listed first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActivityEntry {
    /// Entry id.
    pub id: String,
    /// Entity the record belongs to.
    pub entity_id: String,
    /// Record id.
    pub record_id: String,
    /// Entry kind.
    pub event_type: ActivityEventType,
    /// Author, when known.
    #[serde(default)]
    pub author: Option<ActivityAuthor>,
    /// Kind-specific payload.
    pub payload: Value,
    /// Creation timestamp.
    pub created_at: String,
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, 200)
}

/// In-memory activity store keyed by `(workspace, entity, record)`.
#[derive(Debug, Default)]
pub struct ActivityStore {
    entries: Mutex<BTreeMap<(String, String, String), Vec<ActivityEntry>>>,
}

impl ActivityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry (newest first) and return it.
    pub fn add_event(
        &self,
        workspace: &str,
        entity_id: &str,
        record_id: &str,
        event_type: ActivityEventType,
        payload: Value,
        actor: Option<&Value>,
    ) -> ActivityEntry {
        let entry = ActivityEntry {
            id: Uuid::new_v4().to_string(),
            entity_id: entity_id.to_string(),
            record_id: record_id.to_string(),
            event_type,
            author: ActivityAuthor::from_actor(actor),
            payload,
            created_at: now(),
        };
        self.entries
            .lock()
            .expect("activity poisoned")
            .entry((
                workspace.to_string(),
                entity_id.to_string(),
                record_id.to_string(),
            ))
            .or_default()
            .insert(0, entry.clone());
        entry
    }

    /// Append a comment.
    pub fn add_comment(
        &self,
        workspace: &str,
        entity_id: &str,
        record_id: &str,
        body: &str,
        actor: Option<&Value>,
    ) -> ActivityEntry {
        self.add_event(
            workspace,
            entity_id,
            record_id,
            ActivityEventType::Comment,
            json!({"body": body}),
            actor,
        )
    }

    /// Append a tracked-field change entry.
    pub fn add_change(
        &self,
        workspace: &str,
        entity_id: &str,
        record_id: &str,
        changes: Value,
        actor: Option<&Value>,
    ) -> ActivityEntry {
        self.add_event(
            workspace,
            entity_id,
            record_id,
            ActivityEventType::Change,
            json!({"changes": changes}),
            actor,
        )
    }

    /// Append an attachment entry.
    pub fn add_attachment(
        &self,
        workspace: &str,
        entity_id: &str,
        record_id: &str,
        attachment: &Value,
        actor: Option<&Value>,
    ) -> ActivityEntry {
        let payload = json!({
            "attachment_id": attachment.get("id").cloned().unwrap_or(Value::Null),
            "filename": attachment.get("filename").cloned().unwrap_or(Value::Null),
            "mime_type": attachment.get("mime_type").cloned().unwrap_or(Value::Null),
            "size": attachment.get("size").cloned().unwrap_or(Value::Null),
        });
        self.add_event(
            workspace,
            entity_id,
            record_id,
            ActivityEventType::Attachment,
            payload,
            actor,
        )
    }

    /// List entries, newest first; `limit` is clamped to 1..=200.
    #[must_use]
    pub fn list(
        &self,
        workspace: &str,
        entity_id: &str,
        record_id: &str,
        limit: usize,
    ) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .expect("activity poisoned")
            .get(&(
                workspace.to_string(),
                entity_id.to_string(),
                record_id.to_string(),
            ))
            .map(|entries| entries.iter().take(clamp_limit(limit)).cloned().collect())
            .unwrap_or_default()
    }

    /// List entries created strictly after `since` (an ISO timestamp).
    #[must_use]
    pub fn list_since(
        &self,
        workspace: &str,
        entity_id: &str,
        record_id: &str,
        since: &str,
        limit: usize,
    ) -> Vec<ActivityEntry> {
        self.list(workspace, entity_id, record_id, 200)
            .into_iter()
            .filter(|entry| entry.created_at.as_str() > since)
            .take(clamp_limit(limit))
            .collect()
    }
}
