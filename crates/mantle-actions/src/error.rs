// SPDX-License-Identifier: MIT OR Apache-2.0
//! Executor errors with stable codes.

use mantle_events::EventValidationError;
use mantle_manifest::Issue;
use mantle_registry::RegistryError;

/// Errors raised while executing an action.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The module is not installed in the workspace.
    #[error("[MODULE_NOT_INSTALLED] module {module_id:?} is not installed")]
    ModuleNotInstalled {
        /// Module id.
        module_id: String,
    },

    /// The module is installed but disabled or archived.
    #[error("[MODULE_DISABLED] module {module_id:?} is disabled")]
    ModuleDisabled {
        /// Module id.
        module_id: String,
    },

    /// No action with that id exists in the manifest.
    #[error("[ACTION_NOT_FOUND] action {action_id:?} not found in {module_id:?}")]
    ActionNotFound {
        /// Module id.
        module_id: String,
        /// Action id.
        action_id: String,
    },

    /// The action's `enabled_when`/`visible_when` gate failed.
    #[error("[ACTION_DISABLED] action {action_id:?} is not enabled in this context")]
    ActionDisabled {
        /// Action id.
        action_id: String,
    },

    /// The action context is missing required inputs (e.g. `record_id`).
    #[error("[ACTION_CONTEXT_INVALID] {detail}")]
    ContextInvalid {
        /// What is missing.
        detail: String,
    },

    /// The target entity is not declared by any enabled module.
    #[error("[ENTITY_NOT_FOUND] entity {entity_id:?} not found")]
    EntityNotFound {
        /// Entity id.
        entity_id: String,
    },

    /// The target record does not exist.
    #[error("[RECORD_NOT_FOUND] record {record_id:?} not found in {entity_id:?}")]
    RecordNotFound {
        /// Entity id.
        entity_id: String,
        /// Record id.
        record_id: String,
    },

    /// Schema or workflow validation failed; nothing was written.
    #[error("[VALIDATION_FAILED] {} validation issues", issues.len())]
    Validation {
        /// The issues, with field paths.
        issues: Vec<Issue>,
    },

    /// A condition AST could not be evaluated.
    #[error("[CONDITION_INVALID] {message} (path={path})")]
    ConditionInvalid {
        /// Evaluation failure message.
        message: String,
        /// Path of the failing node.
        path: String,
    },

    /// The write phase failed after validation; the transaction rolled
    /// back and pending events were dropped.
    #[error("[RECORD_WRITE_FAILED] {detail}")]
    RecordWriteFailed {
        /// Adapter-level detail (constraint, table, column when known).
        detail: String,
    },

    /// Envelope construction failed; propagated without mutation.
    #[error(transparent)]
    Event(#[from] EventValidationError),

    /// Registry failure while resolving the module or manifest.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ActionError {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ActionError::ModuleNotInstalled { .. } => "MODULE_NOT_INSTALLED",
            ActionError::ModuleDisabled { .. } => "MODULE_DISABLED",
            ActionError::ActionNotFound { .. } => "ACTION_NOT_FOUND",
            ActionError::ActionDisabled { .. } => "ACTION_DISABLED",
            ActionError::ContextInvalid { .. } => "ACTION_CONTEXT_INVALID",
            ActionError::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
            ActionError::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            ActionError::Validation { .. } => "VALIDATION_FAILED",
            ActionError::ConditionInvalid { .. } => "CONDITION_INVALID",
            ActionError::RecordWriteFailed { .. } => "RECORD_WRITE_FAILED",
            ActionError::Event(_) => "EVENT_INVALID",
            ActionError::Registry(err) => err.code(),
        }
    }
}
