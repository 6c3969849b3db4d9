// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-record chatter: lightweight message log, with system entries
//! recorded automatically on writes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// One chatter entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChatterEntry {
    /// Entry id.
    pub id: String,
    /// Entry type (`comment` or `system`).
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Message body.
    pub body: String,
    /// Loose actor object, when known.
    #[serde(default)]
    pub actor: Option<Value>,
    /// Creation timestamp.
    pub created_at: String,
}

/// In-memory chatter store keyed by `(workspace, entity, record)`.
#[derive(Debug, Default)]
pub struct ChatterStore {
    entries: Mutex<BTreeMap<(String, String, String), Vec<ChatterEntry>>>,
}

impl ChatterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry (newest first) and return it.
    pub fn add(
        &self,
        workspace: &str,
        entity_id: &str,
        record_id: &str,
        entry_type: &str,
        body: &str,
        actor: Option<Value>,
    ) -> ChatterEntry {
        let entry = ChatterEntry {
            id: Uuid::new_v4().to_string(),
            entry_type: entry_type.to_string(),
            body: body.to_string(),
            actor,
            created_at: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        };
        self.entries
            .lock()
            .expect("chatter poisoned")
            .entry((
                workspace.to_string(),
                entity_id.to_string(),
                record_id.to_string(),
            ))
            .or_default()
            .insert(0, entry.clone());
        entry
    }

    /// List entries, newest first.
    #[must_use]
    pub fn list(
        &self,
        workspace: &str,
        entity_id: &str,
        record_id: &str,
        limit: usize,
    ) -> Vec<ChatterEntry> {
        self.entries
            .lock()
            .expect("chatter poisoned")
            .get(&(
                workspace.to_string(),
                entity_id.to_string(),
                record_id.to_string(),
            ))
            .map(|entries| entries.iter().take(limit.max(1)).cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_first() {
        let store = ChatterStore::new();
        store.add("w", "entity.job", "r1", "system", "Record created", None);
        store.add("w", "entity.job", "r1", "comment", "hello", None);
        let entries = store.list("w", "entity.job", "r1", 10);
        assert_eq!(entries[0].body, "hello");
        assert_eq!(entries[1].entry_type, "system");
    }
}
