// SPDX-License-Identifier: MIT OR Apache-2.0
//! Normalization must be a fixed point for *any* manifest, not just the
//! handwritten fixtures: `normalize(normalize(m)) == normalize(m)`,
//! compared on canonical bytes.

use mantle_canonical::canonical_dumps;
use mantle_manifest::{normalize_manifest, validate_full};
use proptest::prelude::*;
use serde_json::{Value, json};

const SLUGS: &[&str] = &["job", "task", "client", "order"];
const FIELD_TYPES: &[&str] = &["string", "text", "number", "boolean", "date"];

#[derive(Debug, Clone)]
struct EntitySpec {
    slug: &'static str,
    name_required: bool,
    extra_type: &'static str,
    extra_required: bool,
    status_options: Option<Vec<&'static str>>,
    with_workflow: bool,
    lookup_target: Option<&'static str>,
}

#[derive(Debug, Clone)]
struct ManifestSpec {
    entities: Vec<EntitySpec>,
    declare_views: bool,
}

fn arb_entity(slug: &'static str, others: Vec<&'static str>) -> impl Strategy<Value = EntitySpec> {
    let lookup = if others.is_empty() {
        Just(None::<&'static str>).boxed()
    } else {
        proptest::option::of(proptest::sample::select(others)).boxed()
    };
    (
        any::<bool>(),
        proptest::sample::select(FIELD_TYPES),
        any::<bool>(),
        proptest::option::of(proptest::sample::subsequence(
            vec!["draft", "active", "done"],
            0..=3,
        )),
        any::<bool>(),
        lookup,
    )
        .prop_map(
            move |(name_required, extra_type, extra_required, status_options, with_workflow, lookup_target)| {
                EntitySpec {
                    slug,
                    name_required,
                    extra_type,
                    extra_required,
                    status_options,
                    with_workflow,
                    lookup_target,
                }
            },
        )
}

fn arb_manifest() -> impl Strategy<Value = ManifestSpec> {
    (proptest::sample::subsequence(SLUGS.to_vec(), 1..=3), any::<bool>()).prop_flat_map(
        |(slugs, declare_views)| {
            let entities: Vec<_> = slugs
                .iter()
                .copied()
                .map(|slug| {
                    let others: Vec<&'static str> =
                        slugs.iter().copied().filter(|s| *s != slug).collect();
                    arb_entity(slug, others)
                })
                .collect();
            entities.prop_map(move |entities| ManifestSpec {
                entities,
                declare_views,
            })
        },
    )
}

fn build_manifest(spec: &ManifestSpec) -> Value {
    let mut entities = Vec::new();
    let mut views = Vec::new();
    let mut workflows = Vec::new();

    for entity in &spec.entities {
        let slug = entity.slug;
        let mut fields = vec![
            json!({"id": format!("{slug}.name"), "type": "string", "label": "Name",
                   "required": entity.name_required}),
            json!({"id": format!("{slug}.detail"), "type": entity.extra_type, "label": "Detail",
                   "required": entity.extra_required}),
        ];
        if let Some(options) = &entity.status_options {
            fields.push(json!({
                "id": format!("{slug}.status"), "type": "enum", "label": "Status",
                "options": options,
            }));
        }
        if let Some(target) = entity.lookup_target {
            fields.push(json!({
                "id": format!("{slug}.owner_id"), "type": "lookup", "label": "Owner",
                "target": target,
            }));
        }
        entities.push(json!({
            "id": format!("entity.{slug}"),
            "label": slug,
            "display_field": format!("{slug}.name"),
            "fields": fields,
        }));

        if entity.with_workflow && entity.status_options.is_some() {
            workflows.push(json!({
                "entity": format!("entity.{slug}"),
                "status_field": format!("{slug}.status"),
                "states": ["draft", "done"],
            }));
        }
        if spec.declare_views {
            views.push(json!({
                "id": format!("{slug}.list"), "kind": "list",
                "entity": format!("entity.{slug}"), "columns": [],
            }));
        }
    }

    json!({
        "manifest_version": "1.3",
        "module": {"id": "gen", "name": "Generated"},
        "entities": entities,
        "views": views,
        "pages": [],
        "actions": [],
        "workflows": workflows,
        "app": {"nav": []},
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn normalize_is_idempotent(spec in arb_manifest()) {
        let manifest = build_manifest(&spec);
        let (first, _) = normalize_manifest(&manifest, "gen");
        let (second, _) = normalize_manifest(&first, "gen");
        prop_assert_eq!(
            canonical_dumps(&first).unwrap(),
            canonical_dumps(&second).unwrap()
        );
    }

    #[test]
    fn normalized_manifests_pass_the_pipeline(spec in arb_manifest()) {
        let manifest = build_manifest(&spec);
        let report = validate_full(&manifest, "gen");
        prop_assert!(report.errors.is_empty(), "raw errors: {:?}", report.errors);
        prop_assert!(report.strict.is_empty(), "strict errors: {:?}", report.strict);
    }
}
