// SPDX-License-Identifier: MIT OR Apache-2.0
//! Module registry and manifest store.
//!
//! Manifests are content-addressed, append-only snapshots; a module's head
//! pointer selects the snapshot in force, and every lifecycle action lands
//! in an audit trail. The draft store holds per-module working copies that
//! never affect the head until installed.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod audit;
mod cache;
mod drafts;
mod error;
mod registry;
mod store;

pub use audit::{AuditAction, AuditEntry};
pub use cache::{Cache, REGISTRY_PREFIXES};
pub use drafts::{Draft, DraftStore, DraftSummary, DraftVersion};
pub use error::RegistryError;
pub use registry::{
    DeleteOutcome, EntityRecordOps, ModuleRecord, ModuleRegistry, SYSTEM_MODULE_IDS,
    collect_entity_record_ids,
};
pub use store::{BlobStore, FsBlobStore, ManifestStore, MemoryBlobStore, SnapshotRef};
