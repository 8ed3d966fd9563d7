//! Cluster backend boundary.
//!
//! A backend turns a fully resolved cluster configuration into a running
//! cluster and hands back an opaque handle. The resolution pipeline only
//! builds the [`ClusterSpec`]; everything past `spawn` (process spawning,
//! batch submission, scaling) belongs to the backend.

pub mod local;
pub mod pbs;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

/// Fully resolved parameters handed to a backend
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    /// Profile name the spec was resolved from (diagnostics only)
    pub name: String,
    /// Normalized cluster keys (hyphens already folded to underscores,
    /// `type` removed)
    pub params: Map<String, Value>,
    /// Whether the caller drives the handle from async code
    pub asynchronous: bool,
    /// Scheduling context the backend should spawn its tasks on, if the
    /// caller wants a specific one
    pub runtime: Option<tokio::runtime::Handle>,
}

impl ClusterSpec {
    /// Integer parameter lookup, tolerating absence
    pub fn usize_param(&self, key: &str) -> Option<usize> {
        self.params.get(key).and_then(Value::as_u64).map(|n| n as usize)
    }

    /// String parameter lookup, tolerating absence
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// A pluggable cluster implementation
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Type name this backend serves (e.g. `"local"`, `"pbs"`)
    fn type_name(&self) -> &str;

    /// Launch a cluster for the given spec
    async fn spawn(&self, spec: ClusterSpec) -> Result<Box<dyn ClusterHandle>>;
}

/// A running cluster, owned by the caller
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    /// Address of the scheduler control endpoint (`tcp://host:port`)
    fn scheduler_address(&self) -> &str;

    /// Number of workers currently attached
    fn workers(&self) -> usize;

    /// Scale to `n` workers
    async fn scale(&self, n: usize) -> Result<()>;

    /// Wait until at least `n` workers are attached
    async fn wait_for_workers(&self, n: usize) -> Result<()>;

    /// Shut the cluster down
    async fn shutdown(&self) -> Result<()>;

    /// Resolve once the cluster has shut down, however that was triggered
    async fn finished(&self);
}
