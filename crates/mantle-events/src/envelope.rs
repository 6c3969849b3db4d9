// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event envelope construction and validation.

use chrono::{DateTime, Utc};
use mantle_canonical::canonical_dumps;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope schema version carried by every event.
pub const SCHEMA_VERSION: &str = "1";

/// The acting principal recorded on an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Actor {
    /// Stable principal id.
    pub id: String,
    /// Roles held at emission time.
    pub roles: Vec<String>,
}

/// Envelope metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventMeta {
    /// Unique event id (UUIDv4).
    pub event_id: String,
    /// UTC emission timestamp, `YYYY-MM-DDTHH:MM:SSZ`.
    pub occurred_at: String,
    /// Module that produced the event.
    pub module_id: String,
    /// Content hash of the manifest in force, `sha256:`-prefixed.
    pub manifest_hash: String,
    /// The acting principal, if any.
    #[serde(default)]
    pub actor: Option<Actor>,
    /// Correlation id, if any.
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Envelope schema version (always `"1"`).
    pub schema_version: String,
}

/// A sealed event. Immutable once constructed; construction validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventEnvelope {
    /// Event name (e.g. `record.created`).
    pub name: String,
    /// JSON-object payload, free of non-finite numbers.
    pub payload: Value,
    /// Envelope metadata.
    pub meta: EventMeta,
}

/// Validation failure with a precise envelope path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}{}", path.as_ref().map(|p| format!(" (path={p})")).unwrap_or_default())]
pub struct EventValidationError {
    /// Stable code (e.g. `META_OCCURRED_AT_INVALID`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Envelope path of the offending field.
    pub path: Option<String>,
}

impl EventValidationError {
    fn new(code: &str, message: impl Into<String>, path: &str) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            path: Some(path.into()),
        }
    }
}

/// Inputs for [`make_event`]. Missing identity and timing fields are filled
/// at construction.
#[derive(Debug, Clone, Default)]
pub struct EventMetaInit {
    /// Module that produces the event.
    pub module_id: String,
    /// Manifest hash in force.
    pub manifest_hash: String,
    /// Acting principal.
    pub actor: Option<Actor>,
    /// Correlation id.
    pub trace_id: Option<String>,
    /// Explicit event id (defaults to a fresh UUIDv4).
    pub event_id: Option<String>,
    /// Explicit timestamp (defaults to now, second precision, `Z` suffix).
    pub occurred_at: Option<String>,
}

/// Current UTC time in the envelope timestamp format.
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Construct and validate an event envelope.
///
/// # Errors
///
/// Returns [`EventValidationError`] when the payload is not a canonical-
/// serializable object or any metadata field is malformed.
pub fn make_event(
    name: &str,
    payload: Value,
    meta: EventMetaInit,
) -> Result<EventEnvelope, EventValidationError> {
    let envelope = EventEnvelope {
        name: name.to_string(),
        payload,
        meta: EventMeta {
            event_id: meta.event_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            occurred_at: meta.occurred_at.unwrap_or_else(now_timestamp),
            module_id: meta.module_id,
            manifest_hash: meta.manifest_hash,
            actor: meta.actor,
            trace_id: meta.trace_id,
            schema_version: SCHEMA_VERSION.to_string(),
        },
    };
    validate_event(&envelope)?;
    Ok(envelope)
}

/// Validate an envelope against the sealed-event rules.
///
/// # Errors
///
/// Returns the first [`EventValidationError`] encountered, with a
/// JSON-pointer-like path.
pub fn validate_event(event: &EventEnvelope) -> Result<(), EventValidationError> {
    if event.name.is_empty() {
        return Err(EventValidationError::new(
            "EVENT_NAME_INVALID",
            "name must be a non-empty string",
            "name",
        ));
    }

    if !event.payload.is_object() {
        return Err(EventValidationError::new(
            "PAYLOAD_INVALID",
            "payload must be an object",
            "payload",
        ));
    }
    // Canonical serialization enforces JSON-only scalars and rejects
    // non-finite numbers.
    if let Err(err) = canonical_dumps(&event.payload) {
        return Err(EventValidationError::new(
            "PAYLOAD_INVALID",
            err.to_string(),
            "payload",
        ));
    }

    if event.meta.event_id.is_empty() {
        return Err(EventValidationError::new(
            "META_EVENT_ID_INVALID",
            "event_id must be a non-empty string",
            "meta.event_id",
        ));
    }

    validate_occurred_at(&event.meta.occurred_at)?;

    if event.meta.module_id.is_empty() {
        return Err(EventValidationError::new(
            "META_MODULE_ID_INVALID",
            "module_id must be a non-empty string",
            "meta.module_id",
        ));
    }

    if !event.meta.manifest_hash.starts_with("sha256:") {
        return Err(EventValidationError::new(
            "META_MANIFEST_HASH_INVALID",
            "manifest_hash must start with 'sha256:'",
            "meta.manifest_hash",
        ));
    }

    if let Some(actor) = &event.meta.actor {
        if actor.id.is_empty() {
            return Err(EventValidationError::new(
                "META_ACTOR_INVALID",
                "actor.id must be a non-empty string",
                "meta.actor.id",
            ));
        }
    }

    if event.meta.schema_version != SCHEMA_VERSION {
        return Err(EventValidationError::new(
            "META_SCHEMA_VERSION_INVALID",
            format!("schema_version must be {SCHEMA_VERSION:?}"),
            "meta.schema_version",
        ));
    }

    Ok(())
}

fn validate_occurred_at(value: &str) -> Result<(), EventValidationError> {
    if !value.ends_with('Z') {
        return Err(EventValidationError::new(
            "META_OCCURRED_AT_INVALID",
            "occurred_at must end with 'Z'",
            "meta.occurred_at",
        ));
    }
    if DateTime::parse_from_rfc3339(value).is_err() {
        return Err(EventValidationError::new(
            "META_OCCURRED_AT_INVALID",
            "occurred_at must be ISO 8601",
            "meta.occurred_at",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn init() -> EventMetaInit {
        EventMetaInit {
            module_id: "jobs".into(),
            manifest_hash: "sha256:abc".into(),
            ..EventMetaInit::default()
        }
    }

    #[test]
    fn fills_identity_and_timestamp() {
        let event = make_event("record.created", json!({"record_id": "r1"}), init()).unwrap();
        assert!(Uuid::parse_str(&event.meta.event_id).is_ok());
        assert!(event.meta.occurred_at.ends_with('Z'));
        assert_eq!(event.meta.schema_version, "1");
    }

    #[test]
    fn occurred_at_matches_the_contract_shape() {
        let event = make_event("record.created", json!({}), init()).unwrap();
        let re_ok = event.meta.occurred_at.len() == 20
            && event.meta.occurred_at.as_bytes()[4] == b'-'
            && event.meta.occurred_at.as_bytes()[10] == b'T';
        assert!(re_ok, "unexpected timestamp {:?}", event.meta.occurred_at);
    }

    #[test]
    fn rejects_non_object_payload() {
        let err = make_event("x", json!([1, 2]), init()).unwrap_err();
        assert_eq!(err.code, "PAYLOAD_INVALID");
    }

    #[test]
    fn rejects_bad_manifest_hash() {
        let mut meta = init();
        meta.manifest_hash = "md5:nope".into();
        let err = make_event("x", json!({}), meta).unwrap_err();
        assert_eq!(err.code, "META_MANIFEST_HASH_INVALID");
        assert_eq!(err.path.as_deref(), Some("meta.manifest_hash"));
    }

    #[test]
    fn rejects_bad_timestamp() {
        let mut meta = init();
        meta.occurred_at = Some("2024-01-01 10:00:00".into());
        let err = make_event("x", json!({}), meta).unwrap_err();
        assert_eq!(err.code, "META_OCCURRED_AT_INVALID");
    }

    #[test]
    fn rejects_empty_name() {
        let err = make_event("", json!({}), init()).unwrap_err();
        assert_eq!(err.code, "EVENT_NAME_INVALID");
    }
}
