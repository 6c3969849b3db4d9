// SPDX-License-Identifier: MIT OR Apache-2.0
//! Generic entity record store.
//!
//! Records are JSON objects keyed by `(workspace, entity_id, id)`. The
//! store does not interpret field types; the validation layer and the
//! action executor sit on top.

use mantle_registry::EntityRecordOps;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Typed store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// No record with that id exists for the entity.
    #[error("[RECORD_NOT_FOUND] record {record_id:?} not found in {entity_id:?}")]
    NotFound {
        /// Entity id.
        entity_id: String,
        /// Record id.
        record_id: String,
    },
}

/// One page item from [`RecordStore::list_page`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPageItem {
    /// Record id.
    pub record_id: String,
    /// The (possibly projected) record.
    pub record: Value,
}

/// A lookup row: id plus display value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRow {
    /// Record id.
    pub id: String,
    /// Value of the display field.
    pub display: Value,
}

type Bucket = BTreeMap<String, Value>;

/// In-memory generic record store.
#[derive(Debug, Default)]
pub struct RecordStore {
    buckets: Mutex<BTreeMap<(String, String), Bucket>>,
}

impl RecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bucket<R>(
        &self,
        workspace: &str,
        entity_id: &str,
        f: impl FnOnce(&mut Bucket) -> R,
    ) -> R {
        let mut buckets = self.buckets.lock().expect("record store poisoned");
        let bucket = buckets
            .entry((workspace.to_string(), entity_id.to_string()))
            .or_default();
        f(bucket)
    }

    /// Create a record, assigning a fresh UUID `id`.
    pub fn create(&self, workspace: &str, entity_id: &str, data: &Value) -> (String, Value) {
        let record_id = Uuid::new_v4().to_string();
        let mut record = data.as_object().cloned().unwrap_or_default();
        record.insert("id".into(), json!(record_id));
        let record = Value::Object(record);
        self.with_bucket(workspace, entity_id, |bucket| {
            bucket.insert(record_id.clone(), record.clone());
        });
        (record_id, record)
    }

    /// Fetch a record.
    #[must_use]
    pub fn get(&self, workspace: &str, entity_id: &str, record_id: &str) -> Option<Value> {
        self.with_bucket(workspace, entity_id, |bucket| bucket.get(record_id).cloned())
    }

    /// Merge `patch` into an existing record.
    ///
    /// # Errors
    ///
    /// [`RecordError::NotFound`] when the record does not exist.
    pub fn update(
        &self,
        workspace: &str,
        entity_id: &str,
        record_id: &str,
        patch: &Value,
    ) -> Result<Value, RecordError> {
        self.with_bucket(workspace, entity_id, |bucket| {
            let Some(record) = bucket.get_mut(record_id) else {
                return Err(RecordError::NotFound {
                    entity_id: entity_id.to_string(),
                    record_id: record_id.to_string(),
                });
            };
            if let (Some(target), Some(changes)) = (record.as_object_mut(), patch.as_object()) {
                for (key, value) in changes {
                    target.insert(key.clone(), value.clone());
                }
                target.insert("id".into(), json!(record_id));
            }
            Ok(record.clone())
        })
    }

    /// Delete a record. Returns `false` when it was absent.
    pub fn delete(&self, workspace: &str, entity_id: &str, record_id: &str) -> bool {
        self.with_bucket(workspace, entity_id, |bucket| {
            bucket.remove(record_id).is_some()
        })
    }

    /// Number of records for an entity.
    #[must_use]
    pub fn count(&self, workspace: &str, entity_id: &str) -> usize {
        self.with_bucket(workspace, entity_id, |bucket| bucket.len())
    }

    /// Destroy every record of an entity.
    pub fn delete_all(&self, workspace: &str, entity_id: &str) {
        self.with_bucket(workspace, entity_id, |bucket| bucket.clear());
    }

    /// List records with limit/offset and optional case-insensitive
    /// substring search over `search_fields`. Ordering is stable (by id).
    #[must_use]
    pub fn list(
        &self,
        workspace: &str,
        entity_id: &str,
        limit: usize,
        offset: usize,
        q: Option<&str>,
        search_fields: &[String],
    ) -> Vec<Value> {
        self.with_bucket(workspace, entity_id, |bucket| {
            bucket
                .values()
                .filter(|record| matches_query(record, q, search_fields))
                .skip(offset)
                .take(limit)
                .cloned()
                .collect()
        })
    }

    /// Cursor pagination. The cursor is an opaque token (last id of the
    /// previous page); `fields` projects records while always retaining
    /// `id`.
    #[must_use]
    pub fn list_page(
        &self,
        workspace: &str,
        entity_id: &str,
        limit: usize,
        cursor: Option<&str>,
        q: Option<&str>,
        search_fields: &[String],
        fields: Option<&[String]>,
    ) -> (Vec<RecordPageItem>, Option<String>) {
        self.with_bucket(workspace, entity_id, |bucket| {
            let mut items: Vec<RecordPageItem> = Vec::new();
            let mut last_id: Option<String> = None;
            let mut more = false;

            for (id, record) in bucket.iter() {
                if let Some(cursor) = cursor {
                    if id.as_str() <= cursor {
                        continue;
                    }
                }
                if !matches_query(record, q, search_fields) {
                    continue;
                }
                if items.len() == limit {
                    more = true;
                    break;
                }
                items.push(RecordPageItem {
                    record_id: id.clone(),
                    record: project_record(record, fields),
                });
                last_id = Some(id.clone());
            }

            let next_cursor = if more { last_id } else { None };
            (items, next_cursor)
        })
    }

    /// Lookup-optimized listing: id plus display value only.
    #[must_use]
    pub fn list_lookup(
        &self,
        workspace: &str,
        entity_id: &str,
        display_field: &str,
        limit: usize,
        q: Option<&str>,
    ) -> Vec<LookupRow> {
        let search_fields = vec![display_field.to_string()];
        self.with_bucket(workspace, entity_id, |bucket| {
            bucket
                .iter()
                .filter(|(_, record)| matches_query(record, q, &search_fields))
                .take(limit)
                .map(|(id, record)| LookupRow {
                    id: id.clone(),
                    display: record.get(display_field).cloned().unwrap_or(Value::Null),
                })
                .collect()
        })
    }
}

fn matches_query(record: &Value, q: Option<&str>, search_fields: &[String]) -> bool {
    let Some(q) = q.filter(|q| !q.is_empty()) else {
        return true;
    };
    let needle = q.to_lowercase();
    search_fields.iter().any(|field| {
        record
            .get(field)
            .map(|value| match value {
                Value::String(s) => s.to_lowercase().contains(&needle),
                other => other.to_string().to_lowercase().contains(&needle),
            })
            .unwrap_or(false)
    })
}

fn project_record(record: &Value, fields: Option<&[String]>) -> Value {
    let Some(fields) = fields.filter(|f| !f.is_empty()) else {
        return record.clone();
    };
    let mut out = Map::new();
    if let Some(map) = record.as_object() {
        for field in fields {
            if let Some(value) = map.get(field) {
                out.insert(field.clone(), value.clone());
            }
        }
        if let Some(id) = map.get("id") {
            out.insert("id".into(), id.clone());
        }
    }
    Value::Object(out)
}

/// A record store bound to one workspace, carrying the tenant dimension so
/// collaborators (registry delete, lookup validation) stay single-keyed.
#[derive(Clone)]
pub struct WorkspaceRecords {
    store: Arc<RecordStore>,
    workspace: String,
}

impl WorkspaceRecords {
    /// Bind `store` to a workspace.
    #[must_use]
    pub fn new(store: Arc<RecordStore>, workspace: impl Into<String>) -> Self {
        Self {
            store,
            workspace: workspace.into(),
        }
    }

    /// The bound workspace id.
    #[must_use]
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Fetch a record in the bound workspace.
    #[must_use]
    pub fn get(&self, entity_id: &str, record_id: &str) -> Option<Value> {
        self.store.get(&self.workspace, entity_id, record_id)
    }
}

impl EntityRecordOps for WorkspaceRecords {
    fn count_records(&self, entity_id: &str) -> usize {
        self.store.count(&self.workspace, entity_id)
    }

    fn delete_records(&self, entity_id: &str) {
        self.store.delete_all(&self.workspace, entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> RecordStore {
        let store = RecordStore::new();
        for name in ["Alpha", "Beta", "Gamma"] {
            store.create("w1", "entity.item", &json!({"item.name": name}));
        }
        store
    }

    #[test]
    fn create_assigns_uuid_ids() {
        let store = RecordStore::new();
        let (id, record) = store.create("w1", "entity.item", &json!({"item.name": "A"}));
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(record["id"], json!(id));
        assert_eq!(record["item.name"], json!("A"));
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let store = seeded();
        let hits = store.list(
            "w1",
            "entity.item",
            50,
            0,
            Some("alph"),
            &["item.name".to_string()],
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["item.name"], json!("Alpha"));
    }

    #[test]
    fn pagination_walks_the_whole_set() {
        let store = seeded();
        let (page1, cursor) = store.list_page("w1", "entity.item", 2, None, None, &[], None);
        assert_eq!(page1.len(), 2);
        let cursor = cursor.expect("more pages");
        let (page2, done) = store.list_page("w1", "entity.item", 2, Some(&cursor), None, &[], None);
        assert_eq!(page2.len(), 1);
        assert!(done.is_none());

        let mut all: Vec<String> = page1.into_iter().chain(page2).map(|i| i.record_id).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn projection_retains_id() {
        let store = seeded();
        let fields = vec!["item.name".to_string()];
        let (page, _) = store.list_page("w1", "entity.item", 10, None, None, &[], Some(&fields));
        for item in page {
            assert!(item.record.get("id").is_some());
            assert!(item.record.get("item.name").is_some());
        }
    }

    #[test]
    fn update_merges_and_preserves_id() {
        let store = RecordStore::new();
        let (id, _) = store.create("w1", "entity.item", &json!({"item.name": "A"}));
        let updated = store
            .update("w1", "entity.item", &id, &json!({"item.name": "B", "id": "spoofed"}))
            .unwrap();
        assert_eq!(updated["item.name"], json!("B"));
        assert_eq!(updated["id"], json!(id));
    }

    #[test]
    fn missing_update_target_errors() {
        let store = RecordStore::new();
        let err = store
            .update("w1", "entity.item", "nope", &json!({}))
            .unwrap_err();
        assert!(matches!(err, RecordError::NotFound { .. }));
    }

    #[test]
    fn workspaces_are_isolated() {
        let store = RecordStore::new();
        store.create("w1", "entity.item", &json!({"item.name": "A"}));
        assert_eq!(store.count("w2", "entity.item"), 0);
    }

    #[test]
    fn lookup_listing_returns_display_values() {
        let store = seeded();
        let rows = store.list_lookup("w1", "entity.item", "item.name", 10, Some("bet"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].display, json!("Beta"));
    }
}
