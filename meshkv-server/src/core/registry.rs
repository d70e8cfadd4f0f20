use super::engine::{MemoryEngine, StorageEngine};
use super::error::{Result, StoreError};
use super::events::HostId;
use super::wal::WalEngine;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Options handed to an engine factory when a store is created.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Store name, used to derive on-disk paths.
    pub name: String,
    /// Base directory for persistent engines.
    pub data_dir: Option<PathBuf>,
}

pub type EngineFactory =
    Box<dyn Fn(&EngineOptions) -> Result<Arc<dyn StorageEngine>> + Send + Sync>;

/// Explicit capability registry: engine kinds are mapped to factories at
/// configuration time and resolved through ordinary dispatch. Components
/// receive a `NodeContext` value instead of consulting process-wide state.
pub struct NodeContext {
    host_id: Option<HostId>,
    engines: RwLock<HashMap<String, EngineFactory>>,
}

impl NodeContext {
    /// Context with the built-in engines ("memory", "wal") registered.
    pub fn new(host_id: Option<HostId>) -> Self {
        let ctx = Self {
            host_id,
            engines: RwLock::new(HashMap::new()),
        };
        ctx.register_engine("memory", |_opts| Ok(Arc::new(MemoryEngine::new())));
        ctx.register_engine("wal", |opts| {
            let dir = opts
                .data_dir
                .clone()
                .ok_or_else(|| StoreError::InvalidRequest("wal engine requires data_dir".into()))?;
            let engine = WalEngine::open(dir.join(format!("{}.wal", opts.name)))?;
            Ok(Arc::new(engine))
        });
        ctx
    }

    /// Host identifier of this node, if it participates in replication.
    pub fn host_id(&self) -> Option<HostId> {
        self.host_id
    }

    pub fn register_engine<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&EngineOptions) -> Result<Arc<dyn StorageEngine>> + Send + Sync + 'static,
    {
        self.engines
            .write()
            .insert(kind.to_string(), Box::new(factory));
    }

    /// Build a backing engine. Unknown kinds and engine construction
    /// failures are fatal to store creation.
    pub fn build_engine(&self, kind: &str, opts: &EngineOptions) -> Result<Arc<dyn StorageEngine>> {
        let engines = self.engines.read();
        let factory = engines
            .get(kind)
            .ok_or_else(|| StoreError::UnknownEngine(kind.to_string()))?;
        factory(opts)
    }
}

impl Default for NodeContext {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_memory_engine() {
        let ctx = NodeContext::new(Some(1));
        let engine = ctx
            .build_engine("memory", &EngineOptions::default())
            .unwrap();
        engine.get_and_put("k", b"v".to_vec()).unwrap();
        assert_eq!(engine.get("k"), Some(b"v".to_vec()));
        assert_eq!(ctx.host_id(), Some(1));
    }

    #[test]
    fn test_unknown_engine_kind() {
        let ctx = NodeContext::default();
        let err = ctx
            .build_engine("papyrus", &EngineOptions::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownEngine(_)));
    }

    #[test]
    fn test_custom_factory_registration() {
        let ctx = NodeContext::default();
        ctx.register_engine("custom", |_| Ok(Arc::new(MemoryEngine::new())));
        assert!(ctx.build_engine("custom", &EngineOptions::default()).is_ok());
    }

    #[test]
    fn test_wal_engine_requires_data_dir() {
        let ctx = NodeContext::default();
        let err = ctx.build_engine("wal", &EngineOptions::default()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }
}
