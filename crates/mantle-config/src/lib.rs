// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runtime configuration loaded from environment variables.
//!
//! Unset variables fall back to defaults; malformed numerics also fall
//! back, each producing an advisory [`ConfigWarning`] rather than failing
//! startup.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Advisory configuration issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A variable did not parse and its default was used.
    InvalidValue {
        /// Variable name.
        key: String,
        /// The raw value found.
        value: String,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::InvalidValue { key, value } => {
                write!(f, "invalid value for {key}: {value:?}, using default")
            }
        }
    }
}

/// Advisory performance budgets checked by perf tests, not enforced at
/// runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfBudgets {
    /// p95 budget for the list bootstrap, in milliseconds.
    pub p95_ms_bootstrap_list: u64,
    /// Query-count budget for the list bootstrap.
    pub max_queries_bootstrap_list: u64,
    /// p95 budget for the form bootstrap, in milliseconds.
    pub p95_ms_bootstrap_form: u64,
    /// Query-count budget for the form bootstrap.
    pub max_queries_bootstrap_form: u64,
}

impl Default for PerfBudgets {
    fn default() -> Self {
        Self {
            p95_ms_bootstrap_list: 250,
            max_queries_bootstrap_list: 10,
            p95_ms_bootstrap_form: 250,
            max_queries_bootstrap_form: 10,
        }
    }
}

/// Top-level runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// `USE_DB=1` selects persistent stores over in-memory ones.
    pub use_db: bool,
    /// Worker poll interval in milliseconds.
    pub worker_poll_ms: u64,
    /// Jobs claimed per worker cycle.
    pub worker_batch: usize,
    /// Workspace the worker binds to between jobs.
    pub worker_org_id: String,
    /// Symmetric key for secret-at-rest encryption.
    pub app_secret_key: Option<String>,
    /// Deployment environment tag (`dev`, `prod`, ...).
    pub app_env: String,
    /// Patch batch limit for studio agents (iterations).
    pub max_agent_iters: usize,
    /// Patch batch limit for studio agents (ops per batch).
    pub max_agent_ops: usize,
    /// Advisory perf budgets.
    pub perf: PerfBudgets,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            use_db: false,
            worker_poll_ms: 1000,
            worker_batch: 5,
            worker_org_id: "default".into(),
            app_secret_key: None,
            app_env: "dev".into(),
            max_agent_iters: 8,
            max_agent_ops: 200,
            perf: PerfBudgets::default(),
        }
    }
}

fn parse_or_default<T: std::str::FromStr>(
    vars: &BTreeMap<String, String>,
    key: &str,
    default: T,
    warnings: &mut Vec<ConfigWarning>,
) -> T {
    match vars.get(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warnings.push(ConfigWarning::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                });
                default
            }
        },
    }
}

impl RuntimeSettings {
    /// Load settings from the process environment.
    #[must_use]
    pub fn from_env() -> (Self, Vec<ConfigWarning>) {
        let vars: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load settings from an explicit variable map (testable).
    #[must_use]
    pub fn from_vars(vars: &BTreeMap<String, String>) -> (Self, Vec<ConfigWarning>) {
        let defaults = Self::default();
        let mut warnings = Vec::new();

        let use_db = match vars.get("USE_DB").map(String::as_str) {
            None => defaults.use_db,
            Some("1") => true,
            Some("0") => false,
            Some(other) => {
                warnings.push(ConfigWarning::InvalidValue {
                    key: "USE_DB".into(),
                    value: other.to_string(),
                });
                defaults.use_db
            }
        };

        let perf_defaults = PerfBudgets::default();
        let perf = PerfBudgets {
            p95_ms_bootstrap_list: parse_or_default(
                vars,
                "PERF_P95_MS_BOOTSTRAP_LIST",
                perf_defaults.p95_ms_bootstrap_list,
                &mut warnings,
            ),
            max_queries_bootstrap_list: parse_or_default(
                vars,
                "PERF_MAX_QUERIES_BOOTSTRAP_LIST",
                perf_defaults.max_queries_bootstrap_list,
                &mut warnings,
            ),
            p95_ms_bootstrap_form: parse_or_default(
                vars,
                "PERF_P95_MS_BOOTSTRAP_FORM",
                perf_defaults.p95_ms_bootstrap_form,
                &mut warnings,
            ),
            max_queries_bootstrap_form: parse_or_default(
                vars,
                "PERF_MAX_QUERIES_BOOTSTRAP_FORM",
                perf_defaults.max_queries_bootstrap_form,
                &mut warnings,
            ),
        };

        let settings = Self {
            use_db,
            worker_poll_ms: parse_or_default(
                vars,
                "WORKER_POLL_MS",
                defaults.worker_poll_ms,
                &mut warnings,
            ),
            worker_batch: parse_or_default(
                vars,
                "WORKER_BATCH",
                defaults.worker_batch,
                &mut warnings,
            ),
            worker_org_id: vars
                .get("WORKER_ORG_ID")
                .cloned()
                .unwrap_or(defaults.worker_org_id),
            app_secret_key: vars.get("APP_SECRET_KEY").cloned().filter(|v| !v.is_empty()),
            app_env: vars
                .get("APP_ENV")
                .or_else(|| vars.get("ENV"))
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.app_env),
            max_agent_iters: parse_or_default(
                vars,
                "MAX_AGENT_ITERS",
                defaults.max_agent_iters,
                &mut warnings,
            ),
            max_agent_ops: parse_or_default(
                vars,
                "MAX_AGENT_OPS",
                defaults.max_agent_ops,
                &mut warnings,
            ),
            perf,
        };
        (settings, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_unset() {
        let (settings, warnings) = RuntimeSettings::from_vars(&BTreeMap::new());
        assert_eq!(settings, RuntimeSettings::default());
        assert!(warnings.is_empty());
    }

    #[test]
    fn parses_worker_knobs() {
        let (settings, warnings) = RuntimeSettings::from_vars(&vars(&[
            ("USE_DB", "1"),
            ("WORKER_POLL_MS", "250"),
            ("WORKER_BATCH", "10"),
            ("WORKER_ORG_ID", "acme"),
        ]));
        assert!(settings.use_db);
        assert_eq!(settings.worker_poll_ms, 250);
        assert_eq!(settings.worker_batch, 10);
        assert_eq!(settings.worker_org_id, "acme");
        assert!(warnings.is_empty());
    }

    #[test]
    fn malformed_numerics_warn_and_default() {
        let (settings, warnings) =
            RuntimeSettings::from_vars(&vars(&[("WORKER_POLL_MS", "soon"), ("USE_DB", "yes")]));
        assert_eq!(settings.worker_poll_ms, 1000);
        assert!(!settings.use_db);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn app_env_normalized() {
        let (settings, _) = RuntimeSettings::from_vars(&vars(&[("APP_ENV", " Prod ")]));
        assert_eq!(settings.app_env, "prod");
    }
}
