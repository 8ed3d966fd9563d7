//! Lifecycle facade - the public entry points over the resolution pipeline.
//!
//! Resolution itself is synchronous and pure; only backend construction is
//! awaited. The pipeline order is fixed: catalog lookup, hub dashboard
//! patch, override inflation and deep merge, environment expansion,
//! resource derivation, assembly, defaults merge.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::assembly::{new_cluster, GlobalDefaults, SpawnContext};
use crate::backend::ClusterHandle;
use crate::catalog::ProfileCatalog;
use crate::error::{ProfileError, Result};
use crate::merge::{apply_hub_patch, deep_merge, expand_env, inflate_overrides};
use crate::registry::BackendRegistry;
use crate::resources::derive_resources;

/// Construction parameters passed through to the backend
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Whether the caller drives the handle from async code
    pub asynchronous: bool,
    /// Runtime the backend should spawn its tasks on
    pub runtime: Option<tokio::runtime::Handle>,
}

/// Resolves named profiles and manages the resulting clusters
pub struct Orchestrator {
    catalog: ProfileCatalog,
    registry: BackendRegistry,
    defaults: Arc<GlobalDefaults>,
}

impl Orchestrator {
    /// Facade over the packaged profiles and built-in backends
    pub fn new() -> Self {
        Self::with_parts(ProfileCatalog::builtin(), BackendRegistry::builtin())
    }

    /// Facade over explicit collaborators (tests, embedders)
    pub fn with_parts(catalog: ProfileCatalog, registry: BackendRegistry) -> Self {
        Self {
            catalog,
            registry,
            defaults: Arc::new(GlobalDefaults::new()),
        }
    }

    pub fn catalog(&self) -> &ProfileCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn defaults(&self) -> &GlobalDefaults {
        &self.defaults
    }

    /// Run the resolution pipeline without instantiating anything.
    ///
    /// Returns the final document: profile plus hub patch plus overrides,
    /// with derived resource values spliced into the `cluster` section.
    pub fn resolve(&self, name: &str, overrides: &BTreeMap<String, Value>) -> Result<Value> {
        self.resolve_document(name, overrides).map(Value::Object)
    }

    fn resolve_document(
        &self,
        name: &str,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<Map<String, Value>> {
        let profile = self.catalog.get(name)?.clone();

        let patched = apply_hub_patch(profile);
        let merged = deep_merge(patched, inflate_overrides(overrides)?);
        let expanded = expand_env(merged)?;

        let Value::Object(mut document) = expanded else {
            return Err(ProfileError::MissingClusterSection(name.to_string()));
        };
        let cluster = document
            .get("cluster")
            .and_then(Value::as_object)
            .ok_or_else(|| ProfileError::MissingClusterSection(name.to_string()))?;

        if let Some(derived) = derive_resources(cluster)? {
            debug!("profile {name:?}: resource derivation rewrote the cluster section");
            document.insert("cluster".to_string(), Value::Object(derived));
        }

        Ok(document)
    }

    /// Resolve a profile and construct the cluster it describes.
    ///
    /// On success the non-`cluster` settings of the resolved document are
    /// deep-merged into the process-wide defaults - a documented side
    /// effect on shared state.
    pub async fn create(
        &self,
        name: &str,
        overrides: &BTreeMap<String, Value>,
        options: CreateOptions,
    ) -> Result<Box<dyn ClusterHandle>> {
        info!("creating cluster from profile {name:?}");
        let document = self.resolve_document(name, overrides)?;
        let cluster = document
            .get("cluster")
            .and_then(Value::as_object)
            .ok_or_else(|| ProfileError::MissingClusterSection(name.to_string()))?;

        let handle = new_cluster(
            name,
            cluster,
            &self.registry,
            SpawnContext {
                asynchronous: options.asynchronous,
                runtime: options.runtime,
            },
        )
        .await?;

        self.defaults.merge_from(&document);
        info!(
            "cluster {name:?} up at {}",
            handle.scheduler_address()
        );

        Ok(handle)
    }

    /// Profile names mapped to their declared backend types, without any
    /// instantiation
    pub fn available_clusters(&self) -> Result<BTreeMap<String, Option<String>>> {
        self.catalog.profile_types()
    }

    /// Human-readable profile listing
    pub fn describe(&self) -> Result<String> {
        let mut lines = vec!["Available clusters:".to_string()];
        for (name, type_name) in self.available_clusters()? {
            let type_name = type_name.unwrap_or_else(|| "<malformed>".to_string());
            lines.push(format!(" \u{2022} {name}: {type_name}"));
        }
        Ok(lines.join("\n"))
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}
