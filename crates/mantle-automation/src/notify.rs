// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-app notifications created by `system.notify` automation steps.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// One notification row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Notification {
    /// Notification id.
    pub id: String,
    /// Recipient user id.
    pub recipient_user_id: String,
    /// Short title.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Severity (`info`, `warning`, `error`).
    pub severity: String,
    /// Optional navigation target.
    #[serde(default)]
    pub link_to: Option<String>,
    /// The event that produced the notification.
    #[serde(default)]
    pub source_event: Option<Value>,
    /// When the recipient read it.
    #[serde(default)]
    pub read_at: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// In-memory notification store, workspace-scoped.
#[derive(Debug, Default)]
pub struct NotificationStore {
    items: Mutex<BTreeMap<(String, String), Notification>>,
}

impl NotificationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a notification.
    pub fn create(
        &self,
        workspace: &str,
        recipient_user_id: &str,
        title: &str,
        body: &str,
        severity: &str,
        link_to: Option<&str>,
        source_event: Option<Value>,
    ) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            recipient_user_id: recipient_user_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            severity: severity.to_string(),
            link_to: link_to.map(String::from),
            source_event,
            read_at: None,
            created_at: now(),
        };
        self.items
            .lock()
            .expect("notifications poisoned")
            .insert((workspace.to_string(), notification.id.clone()), notification.clone());
        notification
    }

    /// List a user's notifications, newest first.
    #[must_use]
    pub fn list(&self, workspace: &str, user_id: &str, unread_only: bool, limit: usize) -> Vec<Notification> {
        let mut out: Vec<Notification> = self
            .items
            .lock()
            .expect("notifications poisoned")
            .iter()
            .filter(|((ws, _), n)| {
                ws == workspace
                    && n.recipient_user_id == user_id
                    && (!unread_only || n.read_at.is_none())
            })
            .map(|(_, n)| n.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(1));
        out
    }

    /// Unread count for a user.
    #[must_use]
    pub fn unread_count(&self, workspace: &str, user_id: &str) -> usize {
        self.items
            .lock()
            .expect("notifications poisoned")
            .iter()
            .filter(|((ws, _), n)| {
                ws == workspace && n.recipient_user_id == user_id && n.read_at.is_none()
            })
            .count()
    }

    /// Mark one notification read. Returns the updated row.
    #[must_use]
    pub fn mark_read(&self, workspace: &str, notification_id: &str) -> Option<Notification> {
        let mut items = self.items.lock().expect("notifications poisoned");
        let notification = items.get_mut(&(workspace.to_string(), notification_id.to_string()))?;
        if notification.read_at.is_none() {
            notification.read_at = Some(now());
        }
        Some(notification.clone())
    }

    /// Mark all of a user's notifications read; returns how many flipped.
    pub fn mark_all_read(&self, workspace: &str, user_id: &str) -> usize {
        let mut items = self.items.lock().expect("notifications poisoned");
        let ts = now();
        let mut count = 0;
        for ((ws, _), notification) in items.iter_mut() {
            if ws == workspace
                && notification.recipient_user_id == user_id
                && notification.read_at.is_none()
            {
                notification.read_at = Some(ts.clone());
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unread_tracking() {
        let store = NotificationStore::new();
        store.create("w", "u1", "Hi", "body", "info", None, None);
        let second = store.create("w", "u1", "Again", "body", "info", None, None);
        store.create("w", "u2", "Other", "body", "info", None, None);

        assert_eq!(store.unread_count("w", "u1"), 2);
        store.mark_read("w", &second.id).unwrap();
        assert_eq!(store.unread_count("w", "u1"), 1);
        assert_eq!(store.list("w", "u1", true, 10).len(), 1);
        assert_eq!(store.mark_all_read("w", "u1"), 1);
        assert_eq!(store.unread_count("w", "u1"), 0);
    }
}
