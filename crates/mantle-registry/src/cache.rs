// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-scoped response cache with prefix invalidation.
//!
//! Keys are flat strings (`records:list:entity.job:...`); registry
//! mutations invalidate whole families by prefix so stale compiled
//! manifests or record pages never outlive a head change.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Cache key prefixes invalidated on every registry mutation.
pub const REGISTRY_PREFIXES: &[&str] = &[
    "modules",
    "registry_list",
    "manifest",
    "compiled",
    "records:list",
    "records:get",
    "lookup",
    "chatter",
    "bootstrap",
];

/// A mutexed map with prefix invalidation.
#[derive(Debug, Default)]
pub struct Cache {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl Cache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a cached value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().expect("cache poisoned").get(key).cloned()
    }

    /// Store a value.
    pub fn put(&self, key: impl Into<String>, value: Value) {
        self.entries
            .lock()
            .expect("cache poisoned")
            .insert(key.into(), value);
    }

    /// Drop every entry whose key starts with any of `prefixes`.
    pub fn invalidate_prefixes(&self, prefixes: &[&str]) {
        self.entries
            .lock()
            .expect("cache poisoned")
            .retain(|key, _| !prefixes.iter().any(|prefix| key.starts_with(prefix)));
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache poisoned").len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefix_invalidation_is_selective() {
        let cache = Cache::new();
        cache.put("records:list:entity.job", json!(1));
        cache.put("records:get:entity.job:r1", json!(2));
        cache.put("drafts:demo", json!(3));
        cache.invalidate_prefixes(&["records:list", "records:get"]);
        assert!(cache.get("records:list:entity.job").is_none());
        assert!(cache.get("records:get:entity.job:r1").is_none());
        assert_eq!(cache.get("drafts:demo"), Some(json!(3)));
    }
}
