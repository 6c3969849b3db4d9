// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only manifest snapshot store.
//!
//! Snapshots are content-addressed canonical-JSON blobs keyed by
//! `(module_id, hash)`. Blobs are never mutated or deleted; rollback only
//! re-points the head. Two blob backends ship: in-memory and a file tree
//! (`<root>/<module_id>/<hex>.json`).

use crate::audit::{AuditAction, AuditEntry};
use crate::error::RegistryError;
use anyhow::Context;
use mantle_canonical::{canonical_dumps, manifest_hash};
use mantle_manifest::validate_manifest_raw;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Storage for snapshot blobs.
pub trait BlobStore: Send + Sync {
    /// Write a blob if absent. Writing an existing key is a no-op.
    fn write(&self, module_id: &str, hash: &str, canonical: &str) -> anyhow::Result<()>;
    /// Read a blob, or `None` when absent.
    fn read(&self, module_id: &str, hash: &str) -> anyhow::Result<Option<String>>;
    /// Whether a blob exists.
    fn exists(&self, module_id: &str, hash: &str) -> anyhow::Result<bool>;
}

/// In-memory blob backend.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryBlobStore {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn write(&self, module_id: &str, hash: &str, canonical: &str) -> anyhow::Result<()> {
        self.blobs
            .lock()
            .expect("blob store poisoned")
            .entry((module_id.to_string(), hash.to_string()))
            .or_insert_with(|| canonical.to_string());
        Ok(())
    }

    fn read(&self, module_id: &str, hash: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .blobs
            .lock()
            .expect("blob store poisoned")
            .get(&(module_id.to_string(), hash.to_string()))
            .cloned())
    }

    fn exists(&self, module_id: &str, hash: &str) -> anyhow::Result<bool> {
        Ok(self
            .blobs
            .lock()
            .expect("blob store poisoned")
            .contains_key(&(module_id.to_string(), hash.to_string())))
    }
}

/// File-backed blob backend storing canonical JSON under
/// `<root>/<module_id>/<hex>.json`.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, module_id: &str, hash: &str) -> PathBuf {
        let hex = hash.strip_prefix("sha256:").unwrap_or(hash);
        self.root.join(module_id).join(format!("{hex}.json"))
    }
}

impl BlobStore for FsBlobStore {
    fn write(&self, module_id: &str, hash: &str, canonical: &str) -> anyhow::Result<()> {
        let path = self.blob_path(module_id, hash);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create snapshot dir {}", parent.display()))?;
        }
        std::fs::write(&path, canonical)
            .with_context(|| format!("write snapshot to {}", path.display()))?;
        Ok(())
    }

    fn read(&self, module_id: &str, hash: &str) -> anyhow::Result<Option<String>> {
        let path = self.blob_path(module_id, hash);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("read snapshot from {}", path.display()))),
        }
    }

    fn exists(&self, module_id: &str, hash: &str) -> anyhow::Result<bool> {
        Ok(self.blob_path(module_id, hash).exists())
    }
}

/// A snapshot listing entry, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    /// Content hash.
    pub hash: String,
    /// Write timestamp.
    pub at: String,
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Append-only snapshot store with head pointers and an audit log.
pub struct ManifestStore {
    blobs: Box<dyn BlobStore>,
    heads: Mutex<BTreeMap<String, String>>,
    snapshots: Mutex<BTreeMap<String, Vec<SnapshotRef>>>,
    audit: Mutex<BTreeMap<String, Vec<AuditEntry>>>,
}

impl ManifestStore {
    /// Create a store over the given blob backend.
    #[must_use]
    pub fn new(blobs: Box<dyn BlobStore>) -> Self {
        Self {
            blobs,
            heads: Mutex::new(BTreeMap::new()),
            snapshots: Mutex::new(BTreeMap::new()),
            audit: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create a store over the in-memory backend.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBlobStore::new()))
    }

    /// Normalize, validate (raw layer), hash, persist, and point head at a
    /// manifest. Returns the new head hash.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ManifestInvalid`] when raw validation fails;
    /// storage errors when the blob cannot be written.
    pub fn init_module(
        &self,
        module_id: &str,
        manifest: &Value,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<String, RegistryError> {
        let (normalized, errors, _warnings) = validate_manifest_raw(manifest, module_id);
        if !errors.is_empty() {
            return Err(RegistryError::ManifestInvalid { issues: errors });
        }
        let hash = manifest_hash(&normalized)?;
        self.write_snapshot(module_id, &hash, &normalized)?;
        let previous = self.set_head(module_id, &hash);
        let action = if previous.is_some() {
            AuditAction::Upgrade
        } else {
            AuditAction::Install
        };
        self.append_audit(AuditEntry {
            audit_id: uuid::Uuid::new_v4().to_string(),
            module_id: module_id.to_string(),
            action,
            from_hash: previous,
            to_hash: Some(hash.clone()),
            actor: actor.map(String::from),
            reason: reason.map(String::from),
            transaction_group_id: None,
            draft_version_id: None,
            at: now(),
        });
        Ok(hash)
    }

    /// Persist a snapshot blob without touching the head.
    pub(crate) fn write_snapshot(
        &self,
        module_id: &str,
        hash: &str,
        manifest: &Value,
    ) -> Result<(), RegistryError> {
        if !self.blobs.exists(module_id, hash)? {
            let canonical = canonical_dumps(manifest)?;
            self.blobs.write(module_id, hash, &canonical)?;
            self.snapshots
                .lock()
                .expect("snapshots poisoned")
                .entry(module_id.to_string())
                .or_default()
                .insert(
                    0,
                    SnapshotRef {
                        hash: hash.to_string(),
                        at: now(),
                    },
                );
        }
        Ok(())
    }

    /// Point the head at `hash`, returning the previous head.
    pub(crate) fn set_head(&self, module_id: &str, hash: &str) -> Option<String> {
        self.heads
            .lock()
            .expect("heads poisoned")
            .insert(module_id.to_string(), hash.to_string())
    }

    /// Append an audit entry.
    pub(crate) fn append_audit(&self, entry: AuditEntry) {
        self.audit
            .lock()
            .expect("audit poisoned")
            .entry(entry.module_id.clone())
            .or_default()
            .insert(0, entry);
    }

    /// Read a snapshot blob.
    ///
    /// # Errors
    ///
    /// [`RegistryError::SnapshotNotFound`] when the blob is absent.
    pub fn get_snapshot(&self, module_id: &str, hash: &str) -> Result<Value, RegistryError> {
        let Some(text) = self.blobs.read(module_id, hash)? else {
            return Err(RegistryError::SnapshotNotFound {
                module_id: module_id.to_string(),
                hash: hash.to_string(),
            });
        };
        serde_json::from_str(&text)
            .map_err(|err| RegistryError::Storage(anyhow::Error::new(err).context("parse snapshot")))
    }

    /// The current head hash, or `None` when the module has no snapshots.
    #[must_use]
    pub fn get_head(&self, module_id: &str) -> Option<String> {
        self.heads.lock().expect("heads poisoned").get(module_id).cloned()
    }

    /// Snapshot refs, newest first.
    #[must_use]
    pub fn list_snapshots(&self, module_id: &str) -> Vec<SnapshotRef> {
        self.snapshots
            .lock()
            .expect("snapshots poisoned")
            .get(module_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Audit entries, newest first.
    #[must_use]
    pub fn list_history(&self, module_id: &str) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .expect("audit poisoned")
            .get(module_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a snapshot blob exists.
    pub(crate) fn has_snapshot(&self, module_id: &str, hash: &str) -> Result<bool, RegistryError> {
        Ok(self.blobs.exists(module_id, hash)?)
    }

    /// Forget all store state for a module (registry delete path). Blob
    /// files written by the fs backend stay on disk; only indexing state is
    /// dropped.
    pub(crate) fn forget_module(&self, module_id: &str) {
        self.heads.lock().expect("heads poisoned").remove(module_id);
        self.snapshots
            .lock()
            .expect("snapshots poisoned")
            .remove(module_id);
    }
}
