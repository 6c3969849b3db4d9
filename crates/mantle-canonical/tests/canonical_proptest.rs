// SPDX-License-Identifier: MIT OR Apache-2.0

use mantle_canonical::{canonical_dumps, manifest_hash};
use proptest::prelude::*;
use serde_json::{Map, Value, json};

/// Strategy producing arbitrary JSON trees of bounded depth.
fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9_é]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 32, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::vec(("[a-z_]{1,8}", inner), 0..6).prop_map(|entries| {
                let mut map = Map::new();
                for (k, v) in entries {
                    map.insert(k, v);
                }
                Value::Object(map)
            }),
        ]
    })
}

/// Rebuild a value with object keys inserted in reverse order. Canonical
/// output must not depend on insertion order.
fn shuffle_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter().rev() {
                out.insert(k.clone(), shuffle_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(shuffle_keys).collect()),
        other => other.clone(),
    }
}

proptest! {
    #[test]
    fn canonical_form_is_insertion_order_independent(value in arb_json()) {
        let shuffled = shuffle_keys(&value);
        prop_assert_eq!(
            canonical_dumps(&value).unwrap(),
            canonical_dumps(&shuffled).unwrap()
        );
    }

    #[test]
    fn equal_canonical_forms_hash_equally(value in arb_json()) {
        let shuffled = shuffle_keys(&value);
        prop_assert_eq!(
            manifest_hash(&value).unwrap(),
            manifest_hash(&shuffled).unwrap()
        );
    }

    #[test]
    fn canonical_output_parses_back(value in arb_json()) {
        let text = canonical_dumps(&value).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(parsed, value);
    }
}
