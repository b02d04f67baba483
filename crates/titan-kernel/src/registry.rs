//! Kernel spec registry.
//!
//! Catalogs the environments sessions can be started from. Specs are stored
//! behind `Arc` and never mutated after registration; listing order is
//! registration order.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use titan_types::KernelSpec;

use crate::error::{KernelError, KernelResult};

/// Registry of kernel specs keyed by name.
#[derive(Default)]
pub struct KernelSpecRegistry {
    specs: RwLock<IndexMap<String, Arc<KernelSpec>>>,
}

impl std::fmt::Debug for KernelSpecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSpecRegistry")
            .field("specs", &self.specs.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KernelSpecRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock `python3` and `sql` specs.
    pub fn with_builtin_specs() -> Self {
        let registry = Self::new();
        for spec in [KernelSpec::python3(), KernelSpec::sql()] {
            // Fresh registry, names are distinct.
            let _ = registry.register(spec);
        }
        registry
    }

    /// Register a spec. Fails if the name is taken; the registry is left
    /// unchanged in that case.
    pub fn register(&self, spec: KernelSpec) -> KernelResult<Arc<KernelSpec>> {
        let mut specs = self.specs.write();
        if specs.contains_key(&spec.name) {
            return Err(KernelError::DuplicateName(spec.name));
        }
        let spec = Arc::new(spec);
        specs.insert(spec.name.clone(), Arc::clone(&spec));
        tracing::debug!(spec = %spec.name, env = %spec.environment_type, "Registered kernel spec");
        Ok(spec)
    }

    /// Look up a spec by name.
    pub fn get(&self, name: &str) -> KernelResult<Arc<KernelSpec>> {
        self.specs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::SpecNotFound(name.to_string()))
    }

    /// All specs, in registration order.
    pub fn list(&self) -> Vec<Arc<KernelSpec>> {
        self.specs.read().values().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.specs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.read().is_empty()
    }
}
