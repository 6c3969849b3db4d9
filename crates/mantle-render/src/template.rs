// SPDX-License-Identifier: MIT OR Apache-2.0
//! Locked template environment.
//!
//! Templates render in an environment built from
//! [`minijinja::Environment::empty`]: no globals, and only the allow-listed
//! filters and tests exist at all — sandboxing by construction rather than
//! by deny-list. Autoescape is off; strict mode makes undefined variables
//! hard errors.

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde_json::Value;
use std::collections::BTreeSet;

/// Filters available inside templates.
pub const ALLOWED_FILTERS: &[&str] = &[
    "default", "lower", "upper", "title", "trim", "replace", "round", "length", "int", "float",
];

/// Tests available inside templates.
pub const ALLOWED_TESTS: &[&str] = &["defined", "undefined", "none", "equalto"];

/// Template failure surfaced as `TEMPLATE_RENDER_FAILED`.
#[derive(Debug, thiserror::Error)]
#[error("[TEMPLATE_RENDER_FAILED] {message}")]
pub struct TemplateError {
    /// Human-readable failure detail.
    pub message: String,
    /// 1-based source line, when known.
    pub line: Option<usize>,
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        Self {
            message: err.to_string(),
            line: err.line(),
        }
    }
}

/// A syntax or render problem found by [`validate_templates`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateIssue {
    /// `<label>: <detail>`.
    pub message: String,
    /// 1-based source line.
    pub line: usize,
}

fn locked_env(strict: bool) -> Environment<'static> {
    let mut env = Environment::empty();
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_undefined_behavior(if strict {
        UndefinedBehavior::Strict
    } else {
        UndefinedBehavior::Lenient
    });

    env.add_filter("default", minijinja::filters::default);
    env.add_filter("lower", minijinja::filters::lower);
    env.add_filter("upper", minijinja::filters::upper);
    env.add_filter("title", minijinja::filters::title);
    env.add_filter("trim", minijinja::filters::trim);
    env.add_filter("replace", minijinja::filters::replace);
    env.add_filter("round", minijinja::filters::round);
    env.add_filter("length", minijinja::filters::length);
    env.add_filter("int", minijinja::filters::int);
    env.add_filter("float", minijinja::filters::float);

    env.add_test("defined", minijinja::tests::is_defined);
    env.add_test("undefined", minijinja::tests::is_undefined);
    env.add_test("none", minijinja::tests::is_none);
    env.add_test("equalto", minijinja::tests::is_eq);

    env
}

/// Deep-sanitize a render context: objects and arrays pass through, and
/// anything non-JSON can't occur in a [`Value`] to begin with. A non-object
/// root becomes an empty object so top-level lookups stay name-based.
#[must_use]
pub fn sanitize_context(ctx: &Value) -> Value {
    match ctx {
        Value::Object(_) => ctx.clone(),
        _ => Value::Object(serde_json::Map::new()),
    }
}

/// Render a template against a context.
///
/// # Errors
///
/// Returns [`TemplateError`] on syntax errors, and in strict mode also on
/// undefined variables.
pub fn render_template(text: &str, ctx: &Value, strict: bool) -> Result<String, TemplateError> {
    let env = locked_env(strict);
    let rendered = env.render_str(text, sanitize_context(ctx))?;
    Ok(rendered)
}

/// Validate a batch of labeled templates.
///
/// Returns `(errors, declared_vars, undefined_vars)`: syntax errors, the
/// union of variables the templates reference, and — when a context is
/// supplied — referenced variables missing from it.
#[must_use]
pub fn validate_templates(
    templates: &[(&str, Option<&str>)],
    ctx: Option<&Value>,
) -> (Vec<TemplateIssue>, BTreeSet<String>, BTreeSet<String>) {
    let mut errors = Vec::new();
    let mut declared = BTreeSet::new();
    let mut undefined = BTreeSet::new();

    let env = locked_env(false);
    for &(label, text) in templates {
        let Some(text) = text.filter(|t| !t.is_empty()) else {
            continue;
        };
        let template = match env.template_from_str(text) {
            Ok(template) => template,
            Err(err) => {
                errors.push(TemplateIssue {
                    message: format!("{label}: {err}"),
                    line: err.line().unwrap_or(1),
                });
                continue;
            }
        };
        let referenced = template.undeclared_variables(false);
        declared.extend(referenced.iter().cloned());

        if let Some(ctx) = ctx {
            let sanitized = sanitize_context(ctx);
            let missing: Vec<&String> = referenced
                .iter()
                .filter(|name| sanitized.get(name.as_str()).is_none())
                .collect();
            if render_template(text, &sanitized, true).is_err() {
                undefined.extend(missing.into_iter().cloned());
            }
        }
    }

    (errors, declared, undefined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_with_allowed_filters() {
        let out = render_template(
            "Hello {{ record.name | upper }}",
            &json!({"record": {"name": "Ada"}}),
            true,
        )
        .unwrap();
        assert_eq!(out, "Hello ADA");
    }

    #[test]
    fn disallowed_filters_do_not_exist() {
        let err = render_template("{{ items | join(', ') }}", &json!({"items": [1, 2]}), true)
            .unwrap_err();
        assert!(err.message.contains("join"), "{}", err.message);
    }

    #[test]
    fn strict_mode_rejects_undefined_variables() {
        assert!(render_template("{{ missing }}", &json!({}), true).is_err());
        assert_eq!(render_template("{{ missing }}", &json!({}), false).unwrap(), "");
    }

    #[test]
    fn allowed_tests_work() {
        let out = render_template(
            "{% if record.name is defined %}yes{% else %}no{% endif %}",
            &json!({"record": {"name": "x"}}),
            true,
        )
        .unwrap();
        assert_eq!(out, "yes");
    }

    #[test]
    fn validation_reports_syntax_and_undefined() {
        let (errors, declared, undefined) = validate_templates(
            &[
                ("subject", Some("Hello {{ record.name }}")),
                ("body", Some("{% broken")),
                ("footer", Some("{{ company }}")),
            ],
            Some(&json!({"record": {"name": "Ada"}})),
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.starts_with("body:"));
        assert!(declared.contains("record"));
        assert!(declared.contains("company"));
        assert!(undefined.contains("company"));
        assert!(!undefined.contains("record"));
    }

    #[test]
    fn autoescape_is_off() {
        let out = render_template("{{ html }}", &json!({"html": "<b>x</b>"}), true).unwrap();
        assert_eq!(out, "<b>x</b>");
    }
}
