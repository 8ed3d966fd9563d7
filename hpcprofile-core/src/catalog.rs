//! Profile catalog - loads and caches the named cluster profiles.
//!
//! The built-in profiles ship inside the crate as a YAML document. Parsing
//! happens once per catalog instance and the result lives for as long as
//! the catalog does; tests construct throwaway catalogs from strings.

use std::collections::BTreeMap;

use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ProfileError, Result};

/// The packaged profile definitions
const BUILTIN_PROFILES: &str = include_str!("profiles.yaml");

/// A set of named cluster profiles
pub struct ProfileCatalog {
    source: String,
    definitions: OnceCell<BTreeMap<String, Value>>,
}

impl ProfileCatalog {
    /// Catalog backed by the profiles packaged with the crate
    pub fn builtin() -> Self {
        Self {
            source: BUILTIN_PROFILES.to_string(),
            definitions: OnceCell::new(),
        }
    }

    /// Catalog backed by an arbitrary YAML document (tests, alternate sources)
    pub fn from_yaml(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            definitions: OnceCell::new(),
        }
    }

    /// Parse the profile source, caching the result.
    ///
    /// Malformed YAML is fatal and propagates on every call.
    pub fn definitions(&self) -> Result<&BTreeMap<String, Value>> {
        self.definitions.get_or_try_init(|| {
            let parsed: BTreeMap<String, Value> = serde_yaml_ng::from_str(&self.source)?;
            info!("loaded {} cluster profiles", parsed.len());
            Ok(parsed)
        })
    }

    /// Look up a profile by name.
    ///
    /// Unknown names fail with a message enumerating every valid choice.
    pub fn get(&self, name: &str) -> Result<&Value> {
        let definitions = self.definitions()?;
        definitions.get(name).ok_or_else(|| {
            let available = definitions
                .keys()
                .map(|n| format!("{n:?}"))
                .collect::<Vec<_>>()
                .join(", ");
            ProfileError::UnknownProfile {
                name: name.to_string(),
                available,
            }
        })
    }

    /// Declared backend type of every profile, without instantiating anything.
    ///
    /// A malformed profile maps to `None` instead of failing; the error is
    /// raised later, if and when the profile is actually used.
    pub fn profile_types(&self) -> Result<BTreeMap<String, Option<String>>> {
        let definitions = self.definitions()?;
        let types = definitions
            .iter()
            .map(|(name, body)| {
                let type_name = body
                    .get("cluster")
                    .and_then(|cluster| cluster.get("type"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                debug!("profile {name:?} declares type {type_name:?}");
                (name.clone(), type_name)
            })
            .collect();

        Ok(types)
    }
}
