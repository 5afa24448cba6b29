//! Static registry of storage backends keyed by configuration name

use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;
use tandem_common::{StorageBackend, TandemError, TandemResult};
use tracing::info;

use crate::{
    filesystem::{FILESYSTEM_BACKEND, FilesystemBackend},
    memory::{MEMORY_BACKEND, MemoryBackend},
};

/// Default root of the filesystem backend
pub const DEFAULT_STORAGE_PATH: &str = "./storage";

/// Builds a backend from its configuration section
pub type BackendConstructor = fn(&Value) -> TandemResult<Arc<dyn StorageBackend>>;

pub struct PersistenceRegistry {
    constructors: BTreeMap<&'static str, BackendConstructor>,
}

impl PersistenceRegistry {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the `memory` and `filesystem` backends
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(MEMORY_BACKEND, |_| Ok(Arc::new(MemoryBackend::new())));
        registry.register(FILESYSTEM_BACKEND, |options| {
            let path = options
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_STORAGE_PATH);
            Ok(Arc::new(FilesystemBackend::new(path)))
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, constructor: BackendConstructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn create(&self, name: &str, options: &Value) -> TandemResult<Arc<dyn StorageBackend>> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            TandemError::Config(format!(
                "unknown persistence backend '{}', expected one of {:?}",
                name,
                self.names()
            ))
        })?;
        let backend = constructor(options)?;
        info!("Persistence backend '{}' initialized", name);
        Ok(backend)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }
}

impl Default for PersistenceRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = PersistenceRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["filesystem", "memory"]);

        let backend = registry.create("memory", &Value::Null).unwrap();
        assert_eq!(backend.name(), "memory");

        let options = serde_json::json!({ "path": "/tmp/tandem-storage" });
        let backend = registry.create("filesystem", &options).unwrap();
        assert_eq!(backend.name(), "filesystem");
    }

    #[test]
    fn test_unknown_backend() {
        let registry = PersistenceRegistry::with_builtins();
        let result = registry.create("s3", &Value::Null);
        assert!(matches!(result, Err(TandemError::Config(_))));
    }
}
