// SPDX-License-Identifier: MIT OR Apache-2.0
//! Module registry: lifecycle over the append-only manifest store.

use crate::audit::{AuditAction, AuditEntry};
use crate::cache::{Cache, REGISTRY_PREFIXES};
use crate::error::RegistryError;
use crate::store::ManifestStore;
use mantle_canonical::manifest_hash;
use mantle_manifest::{
    CompiledManifest, Issue, PatchOp, apply_patchset, compile_manifest, validate_full,
    validate_manifest_raw,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Module ids the registry refuses to mutate.
pub const SYSTEM_MODULE_IDS: &[&str] = &["studio", "settings", "audit", "diagnostics", "auth"];

/// Registry row for an installed module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleRecord {
    /// Module id, unique within the workspace.
    pub module_id: String,
    /// Display name from the manifest.
    pub name: String,
    /// Current head hash.
    #[serde(default)]
    pub current_hash: Option<String>,
    /// Whether the module serves requests.
    pub enabled: bool,
    /// Whether the module is archived (disabled, records retained).
    pub archived: bool,
    /// Install timestamp.
    pub installed_at: String,
    /// Last mutation timestamp.
    pub updated_at: String,
    /// Sort order in the launcher.
    #[serde(default)]
    pub display_order: i64,
    /// Icon identifier.
    #[serde(default)]
    pub icon_key: Option<String>,
}

/// Counting and destroying entity records during module delete. The record
/// store implements this; the registry never touches record storage
/// directly.
pub trait EntityRecordOps: Send + Sync {
    /// Number of records stored for an entity.
    fn count_records(&self, entity_id: &str) -> usize;
    /// Destroy all records of an entity.
    fn delete_records(&self, entity_id: &str);
}

/// Outcome of a delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Whether the module was archived rather than deleted outright.
    pub archived: bool,
    /// Audit id of the recorded action.
    pub audit_id: String,
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Registry of installed modules for one workspace.
pub struct ModuleRegistry {
    store: Arc<ManifestStore>,
    cache: Arc<Cache>,
    modules: Mutex<BTreeMap<String, ModuleRecord>>,
    mutating: Mutex<BTreeSet<String>>,
}

/// RAII guard for the per-module mutation gate.
struct MutationGuard<'a> {
    registry: &'a ModuleRegistry,
    module_id: String,
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .mutating
            .lock()
            .expect("mutation gate poisoned")
            .remove(&self.module_id);
    }
}

impl ModuleRegistry {
    /// Create a registry over `store`, invalidating `cache` on mutation.
    #[must_use]
    pub fn new(store: Arc<ManifestStore>, cache: Arc<Cache>) -> Self {
        Self {
            store,
            cache,
            modules: Mutex::new(BTreeMap::new()),
            mutating: Mutex::new(BTreeSet::new()),
        }
    }

    /// The underlying manifest store.
    #[must_use]
    pub fn store(&self) -> &Arc<ManifestStore> {
        &self.store
    }

    fn lock_module(&self, module_id: &str) -> Result<MutationGuard<'_>, RegistryError> {
        let mut mutating = self.mutating.lock().expect("mutation gate poisoned");
        if !mutating.insert(module_id.to_string()) {
            return Err(RegistryError::MutationInProgress {
                module_id: module_id.to_string(),
            });
        }
        Ok(MutationGuard {
            registry: self,
            module_id: module_id.to_string(),
        })
    }

    fn guard_system(&self, module_id: &str, code: &'static str) -> Result<(), RegistryError> {
        if SYSTEM_MODULE_IDS.contains(&module_id) {
            return Err(RegistryError::SystemModule {
                code,
                module_id: module_id.to_string(),
            });
        }
        Ok(())
    }

    fn invalidate(&self) {
        self.cache.invalidate_prefixes(REGISTRY_PREFIXES);
    }

    /// Install refuses on any raw, strict, or gating completeness error.
    fn gate_manifest(manifest: &Value, module_id: &str) -> Result<(), RegistryError> {
        let report = validate_full(manifest, module_id);
        if report.installable() {
            return Ok(());
        }
        let mut issues: Vec<Issue> = report.errors;
        issues.extend(report.strict);
        issues.extend(
            report
                .completeness
                .into_iter()
                .filter(|issue| !issue.code.contains("ORPHAN")),
        );
        Err(RegistryError::ManifestInvalid { issues })
    }

    /// Install a module from a full manifest. Returns the head hash.
    ///
    /// # Errors
    ///
    /// Validation failures, a concurrent mutation, or storage errors.
    pub fn install(
        &self,
        module_id: &str,
        manifest: &Value,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<String, RegistryError> {
        let _guard = self.lock_module(module_id)?;
        Self::gate_manifest(manifest, module_id)?;
        let hash = self.store.init_module(module_id, manifest, actor, reason)?;
        self.upsert_record(module_id, &hash);
        self.invalidate();
        tracing::info!(module_id, hash = %hash, "module installed");
        Ok(hash)
    }

    /// Upgrade a module from a full manifest. Returns the new head hash.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ModuleNotFound`] when the module is not installed,
    /// plus the failure modes of [`ModuleRegistry::install`].
    pub fn upgrade(
        &self,
        module_id: &str,
        manifest: &Value,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<String, RegistryError> {
        self.require_module(module_id)?;
        let _guard = self.lock_module(module_id)?;
        Self::gate_manifest(manifest, module_id)?;
        let hash = self.store.init_module(module_id, manifest, actor, reason)?;
        self.upsert_record(module_id, &hash);
        self.invalidate();
        Ok(hash)
    }

    /// Apply resolved patch ops to the current head (or an empty base when
    /// the module is new), producing and installing the next snapshot.
    /// Returns `(hash, transaction_group_id)`.
    ///
    /// # Errors
    ///
    /// Patch failures, validation failures, a concurrent mutation, or
    /// storage errors.
    pub fn apply_ops(
        &self,
        module_id: &str,
        ops: &[PatchOp],
        actor: Option<&str>,
        reason: Option<&str>,
        max_ops: Option<usize>,
        draft_version_id: Option<&str>,
    ) -> Result<(String, String), RegistryError> {
        let _guard = self.lock_module(module_id)?;

        let previous = self.store.get_head(module_id);
        let base = match &previous {
            Some(hash) => self.store.get_snapshot(module_id, hash)?,
            None => json!({}),
        };
        let outcome = apply_patchset(&base, ops, max_ops)?;

        Self::gate_manifest(&outcome.manifest, module_id)?;
        let (normalized, _errors, _warnings) = validate_manifest_raw(&outcome.manifest, module_id);
        let hash = manifest_hash(&normalized)?;
        self.store.write_snapshot(module_id, &hash, &normalized)?;
        self.store.set_head(module_id, &hash);

        let transaction_group_id = Uuid::new_v4().to_string();
        self.store.append_audit(AuditEntry {
            audit_id: Uuid::new_v4().to_string(),
            module_id: module_id.to_string(),
            action: if previous.is_some() {
                AuditAction::Upgrade
            } else {
                AuditAction::Install
            },
            from_hash: previous,
            to_hash: Some(hash.clone()),
            actor: actor.map(String::from),
            reason: reason.map(String::from),
            transaction_group_id: Some(transaction_group_id.clone()),
            draft_version_id: draft_version_id.map(String::from),
            at: now(),
        });

        self.upsert_record(module_id, &hash);
        self.invalidate();
        Ok((hash, transaction_group_id))
    }

    fn upsert_record(&self, module_id: &str, hash: &str) {
        let name = self
            .store
            .get_snapshot(module_id, hash)
            .ok()
            .and_then(|m| {
                m.get("module")
                    .and_then(|module| module.get("name"))
                    .and_then(Value::as_str)
                    .map(String::from)
            })
            .unwrap_or_else(|| module_id.to_string());

        let mut modules = self.modules.lock().expect("modules poisoned");
        let ts = now();
        modules
            .entry(module_id.to_string())
            .and_modify(|record| {
                record.current_hash = Some(hash.to_string());
                record.name.clone_from(&name);
                record.updated_at.clone_from(&ts);
            })
            .or_insert_with(|| ModuleRecord {
                module_id: module_id.to_string(),
                name,
                current_hash: Some(hash.to_string()),
                enabled: true,
                archived: false,
                installed_at: ts.clone(),
                updated_at: ts,
                display_order: 0,
                icon_key: None,
            });
    }

    /// All module records, ordered by display order then id.
    #[must_use]
    pub fn list(&self) -> Vec<ModuleRecord> {
        let mut records: Vec<ModuleRecord> = self
            .modules
            .lock()
            .expect("modules poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.module_id.cmp(&b.module_id))
        });
        records
    }

    /// Fetch one module record.
    #[must_use]
    pub fn get(&self, module_id: &str) -> Option<ModuleRecord> {
        self.modules
            .lock()
            .expect("modules poisoned")
            .get(module_id)
            .cloned()
    }

    fn require_module(&self, module_id: &str) -> Result<ModuleRecord, RegistryError> {
        self.get(module_id).ok_or_else(|| RegistryError::ModuleNotFound {
            module_id: module_id.to_string(),
        })
    }

    /// The head manifest of a module.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ModuleNotFound`] or snapshot errors.
    pub fn manifest(&self, module_id: &str) -> Result<Value, RegistryError> {
        let record = self.require_module(module_id)?;
        let Some(hash) = record.current_hash else {
            return Err(RegistryError::SnapshotNotFound {
                module_id: module_id.to_string(),
                hash: String::new(),
            });
        };
        self.store.get_snapshot(module_id, &hash)
    }

    /// The compiled head manifest of a module.
    ///
    /// # Errors
    ///
    /// Same as [`ModuleRegistry::manifest`], plus compile issues surfaced
    /// as [`RegistryError::ManifestInvalid`].
    pub fn compiled(&self, module_id: &str) -> Result<CompiledManifest, RegistryError> {
        let manifest = self.manifest(module_id)?;
        compile_manifest(&manifest, module_id)
            .map_err(|issues| RegistryError::ManifestInvalid { issues })
    }

    /// Enable or disable a module.
    ///
    /// # Errors
    ///
    /// Refused for system modules; [`RegistryError::ModuleNotFound`] when
    /// absent.
    pub fn set_enabled(
        &self,
        module_id: &str,
        enabled: bool,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<ModuleRecord, RegistryError> {
        self.guard_system(module_id, "MODULE_MODIFY_FORBIDDEN")?;
        let record = {
            let mut modules = self.modules.lock().expect("modules poisoned");
            let Some(record) = modules.get_mut(module_id) else {
                return Err(RegistryError::ModuleNotFound {
                    module_id: module_id.to_string(),
                });
            };
            record.enabled = enabled;
            record.updated_at = now();
            record.clone()
        };
        self.store.append_audit(AuditEntry {
            audit_id: Uuid::new_v4().to_string(),
            module_id: module_id.to_string(),
            action: if enabled { AuditAction::Enable } else { AuditAction::Disable },
            from_hash: record.current_hash.clone(),
            to_hash: record.current_hash.clone(),
            actor: actor.map(String::from),
            reason: reason.map(String::from),
            transaction_group_id: None,
            draft_version_id: None,
            at: now(),
        });
        self.invalidate();
        Ok(record)
    }

    /// Set the launcher icon for a module.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ModuleNotFound`] when absent.
    pub fn set_icon(&self, module_id: &str, icon_key: Option<&str>) -> Result<(), RegistryError> {
        let mut modules = self.modules.lock().expect("modules poisoned");
        let Some(record) = modules.get_mut(module_id) else {
            return Err(RegistryError::ModuleNotFound {
                module_id: module_id.to_string(),
            });
        };
        record.icon_key = icon_key.map(String::from);
        record.updated_at = now();
        Ok(())
    }

    /// Set the launcher sort order for a module.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ModuleNotFound`] when absent.
    pub fn set_display_order(&self, module_id: &str, order: i64) -> Result<(), RegistryError> {
        let mut modules = self.modules.lock().expect("modules poisoned");
        let Some(record) = modules.get_mut(module_id) else {
            return Err(RegistryError::ModuleNotFound {
                module_id: module_id.to_string(),
            });
        };
        record.display_order = order;
        record.updated_at = now();
        Ok(())
    }

    /// Re-point the head at an earlier snapshot.
    ///
    /// `target` may be a snapshot hash, a transaction group id, or a draft
    /// version id; the latter two resolve through the audit history.
    ///
    /// # Errors
    ///
    /// `MODULE_ROLLBACK_FORBIDDEN` for system modules; target resolution
    /// failures; a concurrent mutation.
    pub fn rollback(
        &self,
        module_id: &str,
        target: &str,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<String, RegistryError> {
        self.guard_system(module_id, "MODULE_ROLLBACK_FORBIDDEN")?;
        self.require_module(module_id)?;
        let _guard = self.lock_module(module_id)?;

        let hash = self.resolve_rollback_target(module_id, target)?;
        let previous = self.store.get_head(module_id);
        self.store.set_head(module_id, &hash);
        self.store.append_audit(AuditEntry {
            audit_id: Uuid::new_v4().to_string(),
            module_id: module_id.to_string(),
            action: AuditAction::Rollback,
            from_hash: previous,
            to_hash: Some(hash.clone()),
            actor: actor.map(String::from),
            reason: reason.map(String::from),
            transaction_group_id: None,
            draft_version_id: None,
            at: now(),
        });

        if let Some(record) = self.modules.lock().expect("modules poisoned").get_mut(module_id) {
            record.current_hash = Some(hash.clone());
            record.updated_at = now();
        }
        self.invalidate();
        tracing::info!(module_id, hash = %hash, "module rolled back");
        Ok(hash)
    }

    fn resolve_rollback_target(
        &self,
        module_id: &str,
        target: &str,
    ) -> Result<String, RegistryError> {
        if target.starts_with("sha256:") {
            if self.store.has_snapshot(module_id, target)? {
                return Ok(target.to_string());
            }
            return Err(RegistryError::RollbackTargetNotFound {
                module_id: module_id.to_string(),
                target: target.to_string(),
            });
        }
        let history = self.store.list_history(module_id);
        let resolved = history.iter().find_map(|entry| {
            let matches = entry.transaction_group_id.as_deref() == Some(target)
                || entry.draft_version_id.as_deref() == Some(target)
                || entry.audit_id == target;
            if matches { entry.to_hash.clone() } else { None }
        });
        resolved.ok_or_else(|| RegistryError::RollbackTargetNotFound {
            module_id: module_id.to_string(),
            target: target.to_string(),
        })
    }

    /// Delete or archive a module.
    ///
    /// When the module still owns records the call fails with
    /// `MODULE_HAS_RECORDS` unless `force` (destroy records, then archive)
    /// or `archive` (keep records, archive the module) is set.
    ///
    /// # Errors
    ///
    /// `MODULE_DELETE_FORBIDDEN` for system modules, `MODULE_HAS_RECORDS`,
    /// a concurrent mutation, or storage errors.
    pub fn delete(
        &self,
        module_id: &str,
        force: bool,
        archive: bool,
        records: &dyn EntityRecordOps,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<DeleteOutcome, RegistryError> {
        self.guard_system(module_id, "MODULE_DELETE_FORBIDDEN")?;
        let record = self.require_module(module_id)?;
        let _guard = self.lock_module(module_id)?;

        let manifest = record
            .current_hash
            .as_deref()
            .and_then(|hash| self.store.get_snapshot(module_id, hash).ok())
            .unwrap_or_else(|| json!({}));
        let entity_ids = collect_entity_record_ids(&manifest);

        let mut record_count = 0usize;
        let mut entity_counts = serde_json::Map::new();
        for entity_id in &entity_ids {
            let count = records.count_records(entity_id);
            record_count += count;
            if count > 0 {
                entity_counts.insert(entity_id.clone(), json!(count));
            }
        }

        if record_count > 0 && !force && !archive {
            return Err(RegistryError::ModuleHasRecords {
                module_id: module_id.to_string(),
                record_count,
                entity_counts: Value::Object(entity_counts),
            });
        }

        if force {
            for entity_id in &entity_ids {
                records.delete_records(entity_id);
            }
        }

        let audit_id = Uuid::new_v4().to_string();
        let action = if archive {
            AuditAction::ModuleArchived
        } else {
            AuditAction::ModuleDeleted
        };
        self.store.append_audit(AuditEntry {
            audit_id: audit_id.clone(),
            module_id: module_id.to_string(),
            action,
            from_hash: record.current_hash.clone(),
            to_hash: None,
            actor: actor.map(String::from),
            reason: reason.map(String::from),
            transaction_group_id: None,
            draft_version_id: None,
            at: now(),
        });
        self.store.forget_module(module_id);

        {
            let mut modules = self.modules.lock().expect("modules poisoned");
            if let Some(record) = modules.get_mut(module_id) {
                record.archived = true;
                record.enabled = false;
                record.updated_at = now();
            }
        }
        self.invalidate();
        tracing::info!(module_id, archive, force, "module removed");
        Ok(DeleteOutcome {
            archived: true,
            audit_id,
        })
    }
}

/// Entity ids (both `entity.<slug>` and bare-slug forms) declared by a
/// manifest, for record counting during delete.
#[must_use]
pub fn collect_entity_record_ids(manifest: &Value) -> Vec<String> {
    let mut out = BTreeSet::new();
    if let Some(entities) = manifest.get("entities").and_then(Value::as_array) {
        for entity in entities {
            let Some(id) = entity.get("id").and_then(Value::as_str) else {
                continue;
            };
            out.insert(id.to_string());
            match id.strip_prefix("entity.") {
                Some(slug) => out.insert(slug.to_string()),
                None => out.insert(format!("entity.{id}")),
            };
        }
    }
    out.into_iter().collect()
}
