// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared helpers for walking and editing raw manifest trees.

use serde_json::{Map, Value, json};

/// Entity id prefix.
pub const ENTITY_PREFIX: &str = "entity.";

/// The slug of an entity id (`entity.job` → `job`). Ids without the prefix
/// return unchanged.
#[must_use]
pub fn entity_slug(entity_id: &str) -> &str {
    entity_id.strip_prefix(ENTITY_PREFIX).unwrap_or(entity_id)
}

/// Canonicalize an entity reference to `entity.<slug>` form.
#[must_use]
pub fn canonical_entity_id(reference: &str) -> String {
    if reference.starts_with(ENTITY_PREFIX) {
        reference.to_string()
    } else {
        format!("{ENTITY_PREFIX}{reference}")
    }
}

/// Title-case an identifier: `in_progress` → `In Progress`.
#[must_use]
pub fn title_case(raw: &str) -> String {
    raw.split(['_', ' '])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Borrow a string member of an object.
#[must_use]
pub fn get_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Mutable access to an object member, inserting an empty object if absent
/// or of the wrong shape.
pub fn ensure_object<'a>(parent: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    if !parent.get(key).is_some_and(Value::is_object) {
        parent.insert(key.to_string(), json!({}));
    }
    parent
        .get_mut(key)
        .and_then(Value::as_object_mut)
        .expect("just inserted object")
}

/// Mutable access to an array member, inserting an empty array if absent or
/// of the wrong shape.
pub fn ensure_array<'a>(parent: &'a mut Map<String, Value>, key: &str) -> &'a mut Vec<Value> {
    if !parent.get(key).is_some_and(Value::is_array) {
        parent.insert(key.to_string(), json!([]));
    }
    parent
        .get_mut(key)
        .and_then(Value::as_array_mut)
        .expect("just inserted array")
}

/// Find the index of an array element whose `id` member equals `id`.
#[must_use]
pub fn index_by_id(items: &[Value], id: &str) -> Option<usize> {
    items
        .iter()
        .position(|item| get_str(item, "id") == Some(id))
}

/// Iterate the string `id` members of an array of objects.
pub fn ids_of(items: &[Value]) -> impl Iterator<Item = &str> {
    items.iter().filter_map(|item| get_str(item, "id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_and_canonical_forms() {
        assert_eq!(entity_slug("entity.job"), "job");
        assert_eq!(entity_slug("job"), "job");
        assert_eq!(canonical_entity_id("job"), "entity.job");
        assert_eq!(canonical_entity_id("entity.job"), "entity.job");
    }

    #[test]
    fn title_casing() {
        assert_eq!(title_case("draft"), "Draft");
        assert_eq!(title_case("in_progress"), "In Progress");
    }
}
