// SPDX-License-Identifier: MIT OR Apache-2.0
//! FIFO outbox for validated envelopes awaiting delivery.

use crate::envelope::{EventEnvelope, EventValidationError, validate_event};
use std::sync::Mutex;

/// A simple FIFO queue of validated events.
///
/// Enqueue order is preserved for a single publisher; acking removes by
/// `event_id`.
#[derive(Debug, Default)]
pub struct Outbox {
    events: Mutex<Vec<EventEnvelope>>,
}

impl Outbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and enqueue an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventValidationError`] when the envelope fails validation.
    pub fn enqueue(&self, event: EventEnvelope) -> Result<(), EventValidationError> {
        validate_event(&event)?;
        self.events.lock().expect("outbox poisoned").push(event);
        Ok(())
    }

    /// Snapshot of pending events in enqueue order.
    #[must_use]
    pub fn pending(&self) -> Vec<EventEnvelope> {
        self.events.lock().expect("outbox poisoned").clone()
    }

    /// Remove the event with the given id. Returns `false` when absent.
    pub fn ack(&self, event_id: &str) -> bool {
        let mut events = self.events.lock().expect("outbox poisoned");
        match events.iter().position(|e| e.meta.event_id == event_id) {
            Some(idx) => {
                events.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Drop every pending event.
    pub fn clear(&self) {
        self.events.lock().expect("outbox poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventMetaInit, make_event};
    use serde_json::json;

    fn event(name: &str) -> EventEnvelope {
        make_event(
            name,
            json!({}),
            EventMetaInit {
                module_id: "m".into(),
                manifest_hash: "sha256:x".into(),
                ..EventMetaInit::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn fifo_order_preserved() {
        let outbox = Outbox::new();
        outbox.enqueue(event("a")).unwrap();
        outbox.enqueue(event("b")).unwrap();
        let pending = outbox.pending();
        assert_eq!(pending[0].name, "a");
        assert_eq!(pending[1].name, "b");
    }

    #[test]
    fn ack_removes_by_event_id() {
        let outbox = Outbox::new();
        let e = event("a");
        let id = e.meta.event_id.clone();
        outbox.enqueue(e).unwrap();
        assert!(outbox.ack(&id));
        assert!(!outbox.ack(&id));
        assert!(outbox.pending().is_empty());
    }

    #[test]
    fn clear_empties_the_queue() {
        let outbox = Outbox::new();
        outbox.enqueue(event("a")).unwrap();
        outbox.clear();
        assert!(outbox.pending().is_empty());
    }
}
