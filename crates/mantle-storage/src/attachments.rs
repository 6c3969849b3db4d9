// SPDX-License-Identifier: MIT OR Apache-2.0
//! Attachment rows and record links.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// A stored attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Attachment {
    /// Attachment id.
    pub id: String,
    /// Original filename.
    pub filename: String,
    /// MIME type.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Size in bytes.
    pub size: usize,
    /// Storage key for the bytes.
    pub storage_key: String,
    /// Hex SHA-256 of the bytes.
    pub sha256: String,
    /// Who created it (`worker` for generated documents).
    #[serde(default)]
    pub created_by: Option<String>,
    /// Origin tag (`upload`, `generated`, `preview`).
    pub source: String,
    /// Creation timestamp.
    pub created_at: String,
}

/// A link binding an attachment to a record for a purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentLink {
    /// Link id.
    pub id: String,
    /// Attachment id.
    pub attachment_id: String,
    /// Entity id.
    pub entity_id: String,
    /// Record id.
    pub record_id: String,
    /// Why the attachment is linked (e.g. `template:<id>`).
    pub purpose: String,
    /// Creation timestamp.
    pub created_at: String,
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// In-memory attachment store, workspace-scoped.
#[derive(Debug, Default)]
pub struct AttachmentStore {
    attachments: Mutex<BTreeMap<(String, String), Attachment>>,
    links: Mutex<BTreeMap<(String, String), AttachmentLink>>,
}

impl AttachmentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an attachment row.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        workspace: &str,
        filename: &str,
        mime_type: Option<&str>,
        size: usize,
        storage_key: &str,
        sha256: &str,
        created_by: Option<&str>,
        source: &str,
    ) -> Attachment {
        let attachment = Attachment {
            id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            mime_type: mime_type.map(String::from),
            size,
            storage_key: storage_key.to_string(),
            sha256: sha256.to_string(),
            created_by: created_by.map(String::from),
            source: source.to_string(),
            created_at: now(),
        };
        self.attachments
            .lock()
            .expect("attachments poisoned")
            .insert((workspace.to_string(), attachment.id.clone()), attachment.clone());
        attachment
    }

    /// Fetch one attachment.
    #[must_use]
    pub fn get(&self, workspace: &str, attachment_id: &str) -> Option<Attachment> {
        self.attachments
            .lock()
            .expect("attachments poisoned")
            .get(&(workspace.to_string(), attachment_id.to_string()))
            .cloned()
    }

    /// Link an attachment to a record under a purpose.
    pub fn link(
        &self,
        workspace: &str,
        attachment_id: &str,
        entity_id: &str,
        record_id: &str,
        purpose: &str,
    ) -> AttachmentLink {
        let link = AttachmentLink {
            id: Uuid::new_v4().to_string(),
            attachment_id: attachment_id.to_string(),
            entity_id: entity_id.to_string(),
            record_id: record_id.to_string(),
            purpose: purpose.to_string(),
            created_at: now(),
        };
        self.links
            .lock()
            .expect("links poisoned")
            .insert((workspace.to_string(), link.id.clone()), link.clone());
        link
    }

    /// Links for a record.
    #[must_use]
    pub fn list_links(&self, workspace: &str, entity_id: &str, record_id: &str) -> Vec<AttachmentLink> {
        self.links
            .lock()
            .expect("links poisoned")
            .iter()
            .filter(|((ws, _), link)| {
                ws == workspace && link.entity_id == entity_id && link.record_id == record_id
            })
            .map(|(_, link)| link.clone())
            .collect()
    }

    /// Links with a given purpose, newest first.
    #[must_use]
    pub fn list_links_by_purpose(
        &self,
        workspace: &str,
        purpose: &str,
        limit: usize,
    ) -> Vec<AttachmentLink> {
        let mut out: Vec<AttachmentLink> = self
            .links
            .lock()
            .expect("links poisoned")
            .iter()
            .filter(|((ws, _), link)| ws == workspace && link.purpose == purpose)
            .map(|(_, link)| link.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(1));
        out
    }

    /// Remove and return attachments of `source` created before `cutoff`,
    /// oldest first, bounded by `limit`.
    pub fn delete_by_source_before(
        &self,
        workspace: &str,
        source: &str,
        cutoff: &str,
        limit: usize,
    ) -> Vec<Attachment> {
        let mut attachments = self.attachments.lock().expect("attachments poisoned");
        let mut doomed: Vec<(String, Attachment)> = attachments
            .iter()
            .filter(|((ws, _), attachment)| {
                ws == workspace
                    && attachment.source == source
                    && attachment.created_at.as_str() < cutoff
            })
            .map(|((_, id), attachment)| (id.clone(), attachment.clone()))
            .collect();
        doomed.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at));
        doomed.truncate(limit);
        for (id, _) in &doomed {
            attachments.remove(&(workspace.to_string(), id.clone()));
        }
        doomed.into_iter().map(|(_, attachment)| attachment).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linking_and_purpose_queries() {
        let store = AttachmentStore::new();
        let attachment = store.create("w", "a.pdf", None, 3, "key", "hash", None, "generated");
        store.link("w", &attachment.id, "entity.job", "r1", "template:t1");
        store.link("w", &attachment.id, "entity.job", "r1", "invoice");

        assert_eq!(store.list_links("w", "entity.job", "r1").len(), 2);
        assert_eq!(store.list_links_by_purpose("w", "invoice", 10).len(), 1);
    }

    #[test]
    fn cleanup_removes_only_old_matching_source() {
        let store = AttachmentStore::new();
        store.create("w", "old.pdf", None, 1, "k1", "h1", None, "preview");
        store.create("w", "keep.pdf", None, 1, "k2", "h2", None, "upload");

        let deleted = store.delete_by_source_before("w", "preview", "9999-01-01T00:00:00Z", 100);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].filename, "old.pdf");
        // Re-running finds nothing.
        assert!(store.delete_by_source_before("w", "preview", "9999-01-01T00:00:00Z", 100).is_empty());
    }
}
