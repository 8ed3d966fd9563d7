//! Cluster assembly - turns a resolved document into a backend instance
//! and folds its remaining settings into the process-wide defaults.

use std::sync::RwLock;

use serde_json::{Map, Value};
use tracing::debug;

use crate::backend::{ClusterHandle, ClusterSpec};
use crate::error::{ProfileError, Result};
use crate::merge::deep_merge;
use crate::registry::BackendRegistry;

/// Construction parameters forwarded alongside the cluster keys
#[derive(Debug, Clone, Default)]
pub struct SpawnContext {
    pub asynchronous: bool,
    pub runtime: Option<tokio::runtime::Handle>,
}

/// Construct a backend instance from the `cluster` section of a resolved
/// document.
///
/// The `type` key selects the backend; every other key is forwarded with
/// hyphens normalized to underscores.
pub async fn new_cluster(
    name: &str,
    cluster: &Map<String, Value>,
    registry: &BackendRegistry,
    context: SpawnContext,
) -> Result<Box<dyn ClusterHandle>> {
    let type_name = cluster
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProfileError::MissingBackendType(name.to_string()))?;

    let backend = registry.resolve(type_name)?;
    debug!("resolved backend {type_name:?} for profile {name:?}");

    let params = normalize_keys(cluster);
    let spec = ClusterSpec {
        name: name.to_string(),
        params,
        asynchronous: context.asynchronous,
        runtime: context.runtime,
    };

    backend.spawn(spec).await
}

/// Normalize cluster keys for the backend constructor: fold hyphens to
/// underscores and drop the consumed `type` key.
pub fn normalize_keys(cluster: &Map<String, Value>) -> Map<String, Value> {
    cluster
        .iter()
        .filter(|(key, _)| key.as_str() != "type")
        .map(|(key, value)| (key.replace('-', "_"), value.clone()))
        .collect()
}

/// Process-wide configuration defaults.
///
/// Non-`cluster` settings of a resolved profile land here on creation.
/// The merge is explicit shared state: safe for concurrent reads, writers
/// should be serialized by the caller (in practice, cluster creation).
pub struct GlobalDefaults {
    values: RwLock<Value>,
}

impl GlobalDefaults {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(Value::Object(Map::new())),
        }
    }

    /// Deep-merge every non-`cluster` top-level key of `document` into the
    /// defaults. Existing settings survive unless the document explicitly
    /// overrides them.
    pub fn merge_from(&self, document: &Map<String, Value>) {
        let settings: Map<String, Value> = document
            .iter()
            .filter(|(key, _)| key.as_str() != "cluster")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if settings.is_empty() {
            return;
        }

        let mut values = self.values.write().expect("defaults lock poisoned");
        let current = std::mem::replace(&mut *values, Value::Null);
        *values = deep_merge(current, Value::Object(settings));
    }

    /// Current defaults as a document
    pub fn snapshot(&self) -> Value {
        self.values.read().expect("defaults lock poisoned").clone()
    }
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self::new()
    }
}
