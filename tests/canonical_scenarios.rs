// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical-form determinism and normalization fixed-point scenarios.

use mantle_canonical::{CanonicalJsonError, canonical_dumps, manifest_hash};
use mantle_manifest::normalize_manifest;
use serde_json::json;

#[test]
fn canonical_determinism() {
    assert_eq!(
        canonical_dumps(&json!({"b": 1, "a": 2})).unwrap(),
        r#"{"a":2,"b":1}"#
    );
    assert_ne!(
        canonical_dumps(&json!({"n": 1})).unwrap(),
        canonical_dumps(&json!({"n": 1.0})).unwrap()
    );
    assert!(matches!(
        canonical_dumps(&f64::NAN).unwrap_err(),
        CanonicalJsonError::NonFiniteNumber { .. }
    ));
}

#[test]
fn identical_canonical_forms_hash_identically() {
    let m1 = json!({"module": {"id": "x", "name": "X"}, "entities": []});
    let m2 = json!({"entities": [], "module": {"name": "X", "id": "x"}});
    assert_eq!(manifest_hash(&m1).unwrap(), manifest_hash(&m2).unwrap());
}

/// Feed a manifest with a lookup missing `display_field`, an enum with
/// string options, one workflow and no statusbar; after normalization the
/// defaults are filled and a second application is byte-identical.
#[test]
fn normalization_fixed_point_scenario() {
    let manifest = json!({
        "manifest_version": "1.3",
        "module": {"id": "crm", "name": "CRM"},
        "entities": [
            {
                "id": "entity.deal",
                "label": "Deal",
                "display_field": "deal.title",
                "fields": [
                    {"id": "deal.title", "type": "string", "label": "Title"},
                    {"id": "deal.stage", "type": "enum", "label": "Stage",
                     "options": ["open", "won"]},
                    {"id": "deal.company_id", "type": "lookup", "label": "Company",
                     "entity": "entity.company"},
                ],
            },
            {
                "id": "entity.company",
                "label": "Company",
                "display_field": "company.name",
                "fields": [{"id": "company.name", "type": "string", "label": "Name"}],
            },
        ],
        "views": [
            {"id": "deal.form", "kind": "form", "entity": "entity.deal",
             "sections": [{"id": "main", "title": "Main", "fields": ["deal.title", "deal.stage"]}]},
        ],
        "pages": [],
        "actions": [],
        "workflows": [
            {"entity": "entity.deal", "status_field": "deal.stage", "states": ["open", "won"]}
        ],
        "app": {"nav": []},
    });

    let (first, _) = normalize_manifest(&manifest, "crm");

    // Lookup gained the default display field.
    let lookup = &first["entities"][0]["fields"][2];
    assert_eq!(lookup["display_field"], json!("company.name"));

    // Enum options are value/label objects.
    let stage = &first["entities"][0]["fields"][1];
    assert_eq!(
        stage["options"],
        json!([
            {"value": "open", "label": "Open"},
            {"value": "won", "label": "Won"},
        ])
    );

    // The form view gained a statusbar bound to the workflow field.
    let form = first["views"]
        .as_array()
        .unwrap()
        .iter()
        .find(|v| v["id"] == json!("deal.form"))
        .unwrap();
    assert_eq!(form["header"]["statusbar"]["field_id"], json!("deal.stage"));

    // Second application is a byte-level fixed point.
    let (second, _) = normalize_manifest(&first, "crm");
    assert_eq!(
        canonical_dumps(&first).unwrap(),
        canonical_dumps(&second).unwrap()
    );
}
