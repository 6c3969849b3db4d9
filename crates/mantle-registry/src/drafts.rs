// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-module draft working copies with version history.
//!
//! Drafts never affect the installed head; installing a draft goes through
//! the registry. Versions are kept newest-first.

use mantle_manifest::Issue;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// The mutable working copy for a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Draft {
    /// Module the draft edits.
    pub module_id: String,
    /// Working-copy manifest.
    pub manifest: Value,
    /// First-save timestamp (preserved across upserts).
    pub created_at: String,
    /// Last-save timestamp.
    pub updated_at: String,
    /// Last editor.
    #[serde(default)]
    pub updated_by: Option<String>,
    /// Snapshot hash the draft was branched from.
    #[serde(default)]
    pub base_snapshot_id: Option<String>,
}

/// One saved draft version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DraftVersion {
    /// Version id.
    pub id: String,
    /// Module the version belongs to.
    pub module_id: String,
    /// Manifest at this version.
    pub manifest: Value,
    /// Author note.
    #[serde(default)]
    pub note: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Author.
    #[serde(default)]
    pub created_by: Option<String>,
    /// Parent version, if branched.
    #[serde(default)]
    pub parent_version_id: Option<String>,
    /// Patch ops that produced this version, if any.
    #[serde(default)]
    pub ops_applied: Option<Value>,
    /// Validation errors present when the version was saved.
    #[serde(default)]
    pub validation_errors: Option<Vec<Issue>>,
}

/// Summary row for draft listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DraftSummary {
    /// Module id.
    pub module_id: String,
    /// Last-save timestamp.
    pub updated_at: String,
    /// Last editor.
    #[serde(default)]
    pub updated_by: Option<String>,
    /// Snapshot hash the draft was branched from.
    #[serde(default)]
    pub base_snapshot_id: Option<String>,
}

/// In-memory draft store.
#[derive(Debug, Default)]
pub struct DraftStore {
    drafts: Mutex<BTreeMap<String, Draft>>,
    versions: Mutex<BTreeMap<String, Vec<DraftVersion>>>,
}

impl DraftStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Summaries of all drafts, newest-updated first.
    #[must_use]
    pub fn list(&self) -> Vec<DraftSummary> {
        let mut out: Vec<DraftSummary> = self
            .drafts
            .lock()
            .expect("drafts poisoned")
            .values()
            .map(|draft| DraftSummary {
                module_id: draft.module_id.clone(),
                updated_at: draft.updated_at.clone(),
                updated_by: draft.updated_by.clone(),
                base_snapshot_id: draft.base_snapshot_id.clone(),
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Fetch the working copy for a module.
    #[must_use]
    pub fn get(&self, module_id: &str) -> Option<Draft> {
        self.drafts
            .lock()
            .expect("drafts poisoned")
            .get(module_id)
            .cloned()
    }

    /// Replace the working copy, preserving `created_at` and
    /// `base_snapshot_id` when the caller leaves them unset.
    pub fn upsert(
        &self,
        module_id: &str,
        manifest: Value,
        updated_by: Option<&str>,
        base_snapshot_id: Option<&str>,
    ) -> Draft {
        let mut drafts = self.drafts.lock().expect("drafts poisoned");
        let ts = now();
        let existing = drafts.get(module_id);
        let created_at = existing.map_or_else(|| ts.clone(), |d| d.created_at.clone());
        let base = base_snapshot_id
            .map(String::from)
            .or_else(|| existing.and_then(|d| d.base_snapshot_id.clone()));
        let draft = Draft {
            module_id: module_id.to_string(),
            manifest,
            created_at,
            updated_at: ts,
            updated_by: updated_by.map(String::from),
            base_snapshot_id: base,
        };
        drafts.insert(module_id.to_string(), draft.clone());
        draft
    }

    /// Append a version (newest-first) and move the working copy to it.
    #[allow(clippy::too_many_arguments)]
    pub fn create_version(
        &self,
        module_id: &str,
        manifest: Value,
        note: Option<&str>,
        created_by: Option<&str>,
        parent_version_id: Option<&str>,
        ops_applied: Option<Value>,
        validation_errors: Option<Vec<Issue>>,
    ) -> DraftVersion {
        let version = DraftVersion {
            id: Uuid::new_v4().to_string(),
            module_id: module_id.to_string(),
            manifest: manifest.clone(),
            note: note.map(String::from),
            created_at: now(),
            created_by: created_by.map(String::from),
            parent_version_id: parent_version_id.map(String::from),
            ops_applied,
            validation_errors,
        };
        self.versions
            .lock()
            .expect("versions poisoned")
            .entry(module_id.to_string())
            .or_default()
            .insert(0, version.clone());
        self.upsert(module_id, manifest, created_by, None);
        version
    }

    /// Versions for a module, newest first.
    #[must_use]
    pub fn list_versions(&self, module_id: &str) -> Vec<DraftVersion> {
        self.versions
            .lock()
            .expect("versions poisoned")
            .get(module_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Fetch a specific version.
    #[must_use]
    pub fn get_version(&self, module_id: &str, version_id: &str) -> Option<DraftVersion> {
        self.list_versions(module_id)
            .into_iter()
            .find(|v| v.id == version_id)
    }

    /// Drop the working copy and all versions for a module.
    pub fn delete(&self, module_id: &str) -> bool {
        let had_draft = self
            .drafts
            .lock()
            .expect("drafts poisoned")
            .remove(module_id)
            .is_some();
        let had_versions = self
            .versions
            .lock()
            .expect("versions poisoned")
            .remove(module_id)
            .is_some();
        had_draft || had_versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_preserves_created_at_and_base() {
        let store = DraftStore::new();
        let first = store.upsert("demo", json!({"v": 1}), Some("ada"), Some("sha256:base"));
        let second = store.upsert("demo", json!({"v": 2}), Some("grace"), None);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.base_snapshot_id.as_deref(), Some("sha256:base"));
        assert_eq!(second.updated_by.as_deref(), Some("grace"));
    }

    #[test]
    fn versions_are_newest_first_and_move_the_working_copy() {
        let store = DraftStore::new();
        store.create_version("demo", json!({"v": 1}), Some("one"), None, None, None, None);
        let v2 = store.create_version("demo", json!({"v": 2}), Some("two"), None, None, None, None);
        let versions = store.list_versions("demo");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].id, v2.id);
        assert_eq!(store.get("demo").unwrap().manifest, json!({"v": 2}));
    }

    #[test]
    fn delete_clears_everything() {
        let store = DraftStore::new();
        store.create_version("demo", json!({}), None, None, None, None, None);
        assert!(store.delete("demo"));
        assert!(store.get("demo").is_none());
        assert!(store.list_versions("demo").is_empty());
        assert!(!store.delete("demo"));
    }
}
