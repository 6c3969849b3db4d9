// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed registry errors with stable codes.

use mantle_manifest::Issue;
use serde_json::Value;

/// Errors raised by the manifest store and module registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No module with that id is installed in the workspace.
    #[error("[MODULE_NOT_FOUND] module {module_id:?} not found")]
    ModuleNotFound {
        /// Requested module id.
        module_id: String,
    },

    /// The requested snapshot blob does not exist.
    #[error("[SNAPSHOT_NOT_FOUND] snapshot {hash:?} not found for {module_id:?}")]
    SnapshotNotFound {
        /// Module id.
        module_id: String,
        /// Requested hash.
        hash: String,
    },

    /// Another mutation is already running for this module.
    #[error("[MODULE_MUTATION_IN_PROGRESS] module {module_id:?} is being mutated")]
    MutationInProgress {
        /// Module id.
        module_id: String,
    },

    /// System modules cannot be mutated.
    #[error("[{code}] system module {module_id:?} cannot be modified")]
    SystemModule {
        /// Stable code for the refused operation.
        code: &'static str,
        /// Module id.
        module_id: String,
    },

    /// The module still owns records; delete needs `force` or `archive`.
    #[error("[MODULE_HAS_RECORDS] module {module_id:?} has {record_count} records")]
    ModuleHasRecords {
        /// Module id.
        module_id: String,
        /// Total records across entities.
        record_count: usize,
        /// Per-entity counts.
        entity_counts: Value,
    },

    /// The manifest failed raw validation.
    #[error("[MANIFEST_INVALID] manifest has {} validation errors", issues.len())]
    ManifestInvalid {
        /// The validation errors.
        issues: Vec<Issue>,
    },

    /// A rollback target could not be resolved to a snapshot hash.
    #[error("[MODULE_ROLLBACK_TARGET_NOT_FOUND] target {target:?} not found for {module_id:?}")]
    RollbackTargetNotFound {
        /// Module id.
        module_id: String,
        /// The unresolvable target.
        target: String,
    },

    /// Patchset application failed during install or upgrade.
    #[error(transparent)]
    Patch(#[from] mantle_manifest::PatchError),

    /// Canonicalization failed (non-finite numbers in a manifest).
    #[error(transparent)]
    Canonical(#[from] mantle_canonical::CanonicalJsonError),

    /// Blob storage failure.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl RegistryError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::ModuleNotFound { .. } => "MODULE_NOT_FOUND",
            RegistryError::SnapshotNotFound { .. } => "SNAPSHOT_NOT_FOUND",
            RegistryError::MutationInProgress { .. } => "MODULE_MUTATION_IN_PROGRESS",
            RegistryError::SystemModule { code, .. } => code,
            RegistryError::ModuleHasRecords { .. } => "MODULE_HAS_RECORDS",
            RegistryError::ManifestInvalid { .. } => "MANIFEST_INVALID",
            RegistryError::RollbackTargetNotFound { .. } => "MODULE_ROLLBACK_TARGET_NOT_FOUND",
            RegistryError::Patch(err) => err.code(),
            RegistryError::Canonical(_) => "MANIFEST_CANONICALIZATION_FAILED",
            RegistryError::Storage(_) => "STORAGE_ERROR",
        }
    }
}
