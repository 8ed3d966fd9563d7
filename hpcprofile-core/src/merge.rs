//! Override and merge engine.
//!
//! Combines a base profile with environment-derived patches and
//! caller-supplied overrides: dashboard patching for hub sessions, dotted
//! path inflation, deep merging, and `${VAR}` expansion. All operations
//! are pure functions over `serde_json::Value` documents; none of them
//! mutates its input.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ProfileError, Result};

/// Environment variable announcing a JupyterHub session
pub const HUB_USER_VAR: &str = "JUPYTERHUB_USER";

/// Dashboard link template used when running under a hub.
///
/// The braces are placeholders for the dashboard renderer, not for our
/// `${VAR}` expansion, so the template passes through resolution verbatim.
const HUB_DASHBOARD_LINK: &str = "/user/{JUPYTERHUB_USER}/proxy/{port}/status";

static ENV_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"));

/// Deep-merge `overrides` on top of `base`.
///
/// Nested mappings merge recursively; any other pairing is replaced by the
/// override value wholesale.
pub fn deep_merge(base: Value, overrides: Value) -> Value {
    match (base, overrides) {
        (Value::Object(mut base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.remove(&key) {
                    Some(existing) => {
                        base.insert(key, deep_merge(existing, value));
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Value::Object(base)
        }
        (_, overrides) => overrides,
    }
}

/// Convert a flat mapping of dotted-path keys into a nested document.
///
/// Later keys win on leaf conflicts. A path that runs through an existing
/// scalar is rejected rather than silently corrupting the document.
pub fn inflate_overrides(overrides: &BTreeMap<String, Value>) -> Result<Value> {
    let mut root = Map::new();

    for (path, value) in overrides {
        let mut parts = path.split('.').collect::<Vec<_>>();
        let leaf = parts.pop().unwrap_or(path.as_str());

        let mut cursor = &mut root;
        for part in parts {
            let slot = cursor
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            cursor = match slot {
                Value::Object(inner) => inner,
                _ => {
                    return Err(ProfileError::OverrideConflict {
                        path: path.clone(),
                        segment: part.to_string(),
                    })
                }
            };
        }

        cursor.insert(leaf.to_string(), value.clone());
    }

    Ok(Value::Object(root))
}

/// Expand `${VAR}` references in every string leaf of the document.
///
/// A reference to an unset variable is an error, never an empty string.
pub fn expand_env(document: Value) -> Result<Value> {
    expand_with(document, &|name| std::env::var(name).ok())
}

/// Expansion against an arbitrary variable lookup; the seam the tests use
pub fn expand_with(document: Value, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Value> {
    match document {
        Value::String(text) => expand_string(&text, lookup).map(Value::String),
        Value::Object(mapping) => {
            let mut expanded = Map::with_capacity(mapping.len());
            for (key, value) in mapping {
                expanded.insert(key, expand_with(value, lookup)?);
            }
            Ok(Value::Object(expanded))
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| expand_with(item, lookup))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

fn expand_string(text: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mut expanded = String::with_capacity(text.len());
    let mut last = 0;

    for capture in ENV_REFERENCE.captures_iter(text) {
        let whole = capture.get(0).expect("capture 0 always present");
        let name = &capture[1];
        let value = lookup(name)
            .ok_or_else(|| ProfileError::UnresolvedEnvironmentVariable(name.to_string()))?;

        expanded.push_str(&text[last..whole.start()]);
        expanded.push_str(&value);
        last = whole.end();
    }
    expanded.push_str(&text[last..]);

    Ok(expanded)
}

/// Patch the dashboard link when running inside a JupyterHub session.
///
/// Additive deep merge; unrelated keys are untouched. Without the hub
/// variable this is the identity.
pub fn apply_hub_patch(document: Value) -> Value {
    apply_hub_patch_with(document, std::env::var(HUB_USER_VAR).ok().as_deref())
}

pub fn apply_hub_patch_with(document: Value, hub_user: Option<&str>) -> Value {
    match hub_user {
        Some(user) if !user.is_empty() => {
            debug!("hub session for {user:?}, patching dashboard link");
            let patch = serde_json::json!({
                "distributed": {
                    "dashboard": {
                        "link": HUB_DASHBOARD_LINK,
                    }
                }
            });
            deep_merge(document, patch)
        }
        _ => document,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use serial_test::serial;

    #[test]
    fn deep_merge_combines_nested_mappings() {
        let merged = deep_merge(json!({"a": {"x": 1}}), json!({"a": {"y": 2}}));
        assert_eq!(merged, json!({"a": {"x": 1, "y": 2}}));
    }

    #[test]
    fn deep_merge_replaces_leaves() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": {"y": 2}}));
        assert_eq!(merged, json!({"a": {"y": 2}}));

        let merged = deep_merge(json!({"a": {"x": 1}}), json!({"a": 3}));
        assert_eq!(merged, json!({"a": 3}));
    }

    #[test]
    fn inflate_builds_nested_documents() {
        let overrides = BTreeMap::from([
            ("cluster.memory".to_string(), json!("4GiB")),
            ("cluster.processes".to_string(), json!(2)),
        ]);

        let inflated = inflate_overrides(&overrides).unwrap();
        assert_eq!(
            inflated,
            json!({"cluster": {"memory": "4GiB", "processes": 2}})
        );
    }

    #[test]
    fn inflate_rejects_scalar_collisions() {
        let overrides = BTreeMap::from([
            ("a".to_string(), json!(1)),
            ("a.b".to_string(), json!(2)),
        ]);

        let err = inflate_overrides(&overrides).unwrap_err();
        assert!(matches!(err, ProfileError::OverrideConflict { .. }));
    }

    #[test]
    fn expansion_substitutes_known_variables() {
        let lookup = |name: &str| (name == "SCRATCH").then(|| "/scratch/me".to_string());

        let expanded = expand_with(
            json!({"cluster": {"local_directory": "${SCRATCH}/workers"}}),
            &lookup,
        )
        .unwrap();

        assert_eq!(
            expanded,
            json!({"cluster": {"local_directory": "/scratch/me/workers"}})
        );
    }

    #[test]
    fn expansion_fails_on_unset_variables() {
        let lookup = |_: &str| None;

        let err = expand_with(json!({"path": "${NOT_SET}"}), &lookup).unwrap_err();
        assert!(matches!(
            err,
            ProfileError::UnresolvedEnvironmentVariable(name) if name == "NOT_SET"
        ));
    }

    #[test]
    fn expansion_leaves_plain_strings_alone() {
        let lookup = |_: &str| None;
        let document = json!({"walltime": "04:00:00", "count": 3});

        assert_eq!(expand_with(document.clone(), &lookup).unwrap(), document);
    }

    #[test]
    fn hub_patch_sets_dashboard_link() {
        let patched = apply_hub_patch_with(json!({"cluster": {"type": "local"}}), Some("me"));

        assert_eq!(
            patched,
            json!({
                "cluster": {"type": "local"},
                "distributed": {"dashboard": {"link": HUB_DASHBOARD_LINK}},
            })
        );
    }

    #[test]
    fn hub_patch_is_identity_without_hub_user() {
        let document = json!({"cluster": {"type": "local"}});
        assert_eq!(apply_hub_patch_with(document.clone(), None), document);
    }

    #[test]
    #[serial]
    fn expansion_reads_the_process_environment() {
        std::env::set_var("HPCPROFILE_TEST_SCRATCH", "/scratch/me");
        let expanded = expand_env(json!({"dir": "${HPCPROFILE_TEST_SCRATCH}/work"}));
        std::env::remove_var("HPCPROFILE_TEST_SCRATCH");

        assert_eq!(expanded.unwrap(), json!({"dir": "/scratch/me/work"}));
    }

    #[test]
    #[serial]
    fn hub_patch_reads_the_process_environment() {
        std::env::set_var(HUB_USER_VAR, "someone");
        let patched = apply_hub_patch(json!({}));
        std::env::remove_var(HUB_USER_VAR);

        assert_eq!(
            patched["distributed"]["dashboard"]["link"],
            json!(HUB_DASHBOARD_LINK)
        );
    }
}
