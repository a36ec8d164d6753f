//! Backend registry
//!
//! Maps engine names to constructors. The process-wide registry knows the
//! built-in engines; tests and embedders can build their own.

use super::{SearchBackend, SqliteBackend, TantivyBackend};
use mailidx_common::config::IndexConfig;
use mailidx_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::info;

/// Constructor for one engine
pub type BackendFactory = fn(&IndexConfig) -> Result<Arc<dyn SearchBackend>>;

/// Name to factory mapping
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in engines
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("tantivy", TantivyBackend::create);
        registry.register("sqlite", SqliteBackend::create);
        registry
    }

    /// Process-wide registry of built-in engines
    pub fn global() -> &'static BackendRegistry {
        static REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();
        REGISTRY.get_or_init(Self::with_builtin)
    }

    /// Add or replace an engine
    pub fn register(&mut self, name: &'static str, factory: BackendFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Instantiate the engine named by `config.engine`
    pub fn create(&self, config: &IndexConfig) -> Result<Arc<dyn SearchBackend>> {
        let name = config.engine.to_ascii_lowercase();
        let factory = self.factories.get(name.as_str()).ok_or_else(|| {
            Error::Config(format!(
                "Unknown index engine '{}' (available: {})",
                config.engine,
                self.names().join(", ")
            ))
        })?;

        info!(engine = %name, data_dir = %config.data_dir.display(), "Creating search backend");
        factory(config)
    }
}
