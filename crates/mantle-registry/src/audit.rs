// SPDX-License-Identifier: MIT OR Apache-2.0
//! Module audit trail types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle actions recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// First snapshot for a module.
    Install,
    /// Head advanced to a new snapshot.
    Upgrade,
    /// Module enabled.
    Enable,
    /// Module disabled.
    Disable,
    /// Head re-pointed at an earlier snapshot.
    Rollback,
    /// Module deleted (records destroyed).
    ModuleDeleted,
    /// Module archived (records kept).
    ModuleArchived,
}

/// One append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AuditEntry {
    /// Unique entry id.
    pub audit_id: String,
    /// Module the entry belongs to.
    pub module_id: String,
    /// What happened.
    pub action: AuditAction,
    /// Head before the action.
    #[serde(default)]
    pub from_hash: Option<String>,
    /// Head after the action.
    #[serde(default)]
    pub to_hash: Option<String>,
    /// Acting principal.
    #[serde(default)]
    pub actor: Option<String>,
    /// Free-form reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Groups the audit rows of one patchset application.
    #[serde(default)]
    pub transaction_group_id: Option<String>,
    /// Draft version the snapshot was installed from, if any.
    #[serde(default)]
    pub draft_version_id: Option<String>,
    /// Timestamp (`YYYY-MM-DDTHH:MM:SSZ`).
    pub at: String,
}
