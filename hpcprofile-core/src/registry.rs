//! Backend registry - maps cluster type names to lazy backend factories.
//!
//! Factories run only when a backend type is actually requested, so a
//! backend with a heavy or unavailable toolchain costs nothing until a
//! profile asks for it. Registration and resolution are thread-safe; a
//! later registration under the same name silently wins.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::backend::{local::LocalBackend, pbs::PbsBackend, ClusterBackend};
use crate::error::{ProfileError, Result};

/// Zero-argument factory producing a backend implementation
pub type BackendFactory = Arc<dyn Fn() -> Result<Arc<dyn ClusterBackend>> + Send + Sync>;

/// Registry of cluster backend types
pub struct BackendRegistry {
    factories: RwLock<HashMap<String, BackendFactory>>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in backend types (`local`, `pbs`) registered
    pub fn builtin() -> Self {
        let registry = Self::new();
        registry.register("local", || Ok(Arc::new(LocalBackend::new())));
        registry.register("pbs", || {
            let backend = PbsBackend::detect()?;
            Ok(Arc::new(backend) as Arc<dyn ClusterBackend>)
        });
        registry
    }

    /// Register a backend factory under a type name.
    ///
    /// Replaces any previous factory with the same name.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Result<Arc<dyn ClusterBackend>> + Send + Sync + 'static,
    {
        debug!("registering cluster type {name:?}");
        self.factories
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), Arc::new(factory));
    }

    /// Resolve a type name by invoking its factory.
    ///
    /// The factory runs on every call; memoization, if any, is the
    /// factory's own business.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ClusterBackend>> {
        let factory = {
            let factories = self.factories.read().expect("registry lock poisoned");
            factories
                .get(name)
                .cloned()
                .ok_or_else(|| ProfileError::UnknownBackend(name.to_string()))?
        };

        factory()
    }

    /// Registered type names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names = self
            .factories
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unknown_type_fails() {
        let registry = BackendRegistry::new();
        let err = registry
            .resolve("slurm")
            .err()
            .expect("unregistered type must not resolve");
        assert!(matches!(err, ProfileError::UnknownBackend(name) if name == "slurm"));
    }

    #[test]
    fn builtin_types_are_registered() {
        let registry = BackendRegistry::builtin();
        assert_eq!(registry.names(), vec!["local", "pbs"]);
    }

    #[test]
    fn factories_run_lazily_and_per_resolve() {
        let registry = BackendRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&calls);
        registry.register("local", move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(LocalBackend::new()))
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry.resolve("local").unwrap();
        registry.resolve("local").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn later_registration_wins() {
        let registry = BackendRegistry::new();
        registry.register("local", || {
            Err(ProfileError::Backend("first registration".to_string()))
        });
        registry.register("local", || Ok(Arc::new(LocalBackend::new())));

        assert!(registry.resolve("local").is_ok());
    }
}
