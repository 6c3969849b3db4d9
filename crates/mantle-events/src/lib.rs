// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sealed event envelopes, the outbox queue, and the in-process bus.
//!
//! Every event the runtime emits is an [`EventEnvelope`]: an immutable,
//! validated value with a canonical-serializable payload and fully
//! populated metadata. The bus enqueues envelopes to the [`Outbox`] before
//! dispatching to subscribers, and subscriber failures never propagate to
//! the publisher.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod envelope;
mod outbox;

pub use bus::{EventBus, EventBusStats, Handler, SubscriptionId};
pub use envelope::{
    Actor, EventEnvelope, EventMeta, EventMetaInit, EventValidationError, SCHEMA_VERSION,
    make_event, now_timestamp, validate_event,
};
pub use outbox::Outbox;

/// Generic event emitted after a record is created.
pub const RECORD_CREATED: &str = "record.created";
/// Generic event emitted after a record is updated.
pub const RECORD_UPDATED: &str = "record.updated";
/// Emitted when a workflow status field changes value.
pub const WORKFLOW_STATUS_CHANGED: &str = "workflow.status_changed";
/// Emitted when an action is executed.
pub const ACTION_CLICKED: &str = "action.clicked";
