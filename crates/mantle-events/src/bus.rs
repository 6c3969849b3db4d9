// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process event bus with by-name subscriptions.
//!
//! Publishing validates the envelope, enqueues it to the outbox (when one
//! is attached), then dispatches to subscribers in registration order.
//! Subscriber failures are suppressed and counted; they never reach the
//! publisher.

use crate::envelope::{EventEnvelope, EventValidationError, validate_event};
use crate::outbox::Outbox;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Subscriber callback. Returning an error counts as a failed delivery but
/// does not interrupt dispatch.
pub type Handler = Box<dyn Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync>;

/// Opaque handle for unsubscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Snapshot of bus counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusStats {
    /// Events accepted by `publish`.
    pub total_published: u64,
    /// Deliveries whose handler returned an error.
    pub failed_deliveries: u64,
}

/// In-process bus dispatching [`EventEnvelope`]s by name.
pub struct EventBus {
    outbox: Option<Arc<Outbox>>,
    subs: Mutex<BTreeMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
    total_published: AtomicU64,
    failed_deliveries: AtomicU64,
}

impl EventBus {
    /// Create a bus without an outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::with_outbox(None)
    }

    /// Create a bus that enqueues every published event to `outbox` before
    /// dispatching.
    #[must_use]
    pub fn with_outbox(outbox: Option<Arc<Outbox>>) -> Self {
        Self {
            outbox,
            subs: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            total_published: AtomicU64::new(0),
            failed_deliveries: AtomicU64::new(0),
        }
    }

    /// Register a handler for events named `name`. Handlers run in
    /// registration order.
    pub fn subscribe(&self, name: &str, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs
            .lock()
            .expect("bus poisoned")
            .entry(name.to_string())
            .or_default()
            .push((id, handler));
        SubscriptionId(id)
    }

    /// Remove a subscription. Returns `false` when it was already gone.
    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        let mut subs = self.subs.lock().expect("bus poisoned");
        let Some(handlers) = subs.get_mut(name) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id.0);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            subs.remove(name);
        }
        removed
    }

    /// Validate, enqueue, and dispatch an event.
    ///
    /// # Errors
    ///
    /// Returns [`EventValidationError`] when the envelope is invalid; the
    /// event is then neither enqueued nor dispatched.
    pub fn publish(&self, event: &EventEnvelope) -> Result<(), EventValidationError> {
        validate_event(event)?;
        if let Some(outbox) = &self.outbox {
            outbox.enqueue(event.clone())?;
        }
        self.total_published.fetch_add(1, Ordering::Relaxed);

        let subs = self.subs.lock().expect("bus poisoned");
        if let Some(handlers) = subs.get(&event.name) {
            for (_, handler) in handlers {
                if let Err(err) = handler(event) {
                    self.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event = %event.name,
                        event_id = %event.meta.event_id,
                        error = %err,
                        "event subscriber failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Current counter snapshot.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            total_published: self.total_published.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventMetaInit, make_event};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn event(name: &str) -> EventEnvelope {
        make_event(
            name,
            json!({"n": 1}),
            EventMetaInit {
                module_id: "m".into(),
                manifest_hash: "sha256:x".into(),
                ..EventMetaInit::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn dispatches_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            bus.subscribe(
                "x",
                Box::new(move |_| {
                    order.lock().unwrap().push(tag);
                    Ok(())
                }),
            );
        }
        bus.publish(&event("x")).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn handler_errors_are_suppressed() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        bus.subscribe("x", Box::new(|_| anyhow::bail!("boom")));
        {
            let delivered = Arc::clone(&delivered);
            bus.subscribe(
                "x",
                Box::new(move |_| {
                    delivered.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }),
            );
        }
        bus.publish(&event("x")).unwrap();
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        assert_eq!(bus.stats().failed_deliveries, 1);
    }

    #[test]
    fn outbox_receives_published_events() {
        let outbox = Arc::new(Outbox::new());
        let bus = EventBus::with_outbox(Some(Arc::clone(&outbox)));
        bus.publish(&event("x")).unwrap();
        assert_eq!(outbox.pending().len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let id = {
            let delivered = Arc::clone(&delivered);
            bus.subscribe(
                "x",
                Box::new(move |_| {
                    delivered.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }),
            )
        };
        assert!(bus.unsubscribe("x", id));
        assert!(!bus.unsubscribe("x", id));
        bus.publish(&event("x")).unwrap();
        assert_eq!(delivered.load(Ordering::Relaxed), 0);
    }
}
