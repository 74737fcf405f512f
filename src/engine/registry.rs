//! Engine Registry
//!
//! Maps URI schemes to engine descriptors and their adapters. Registration
//! is rare and takes the write lock; resolution only reads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rela_core::{EngineError, EngineResult};

use crate::engine::descriptor::EngineDescriptor;
use crate::engine::drivers;
use crate::engine::traits::EngineAdapter;

#[derive(Clone)]
struct Entry {
    descriptor: Arc<EngineDescriptor>,
    adapter: Arc<dyn EngineAdapter>,
}

#[derive(Default)]
struct Inner {
    /// engine id -> entry
    engines: HashMap<String, Entry>,
    /// lower-cased scheme -> engine id
    schemes: HashMap<String, String>,
}

/// Registry of known engines
#[derive(Default)]
pub struct EngineRegistry {
    inner: RwLock<Inner>,
}

impl EngineRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every engine compiled into this crate.
    pub fn with_builtin_engines() -> Self {
        let registry = Self::new();
        for (descriptor, adapter) in drivers::builtin() {
            // builtin descriptors never overlap
            if let Err(e) = registry.register(descriptor, adapter) {
                tracing::error!("Failed to register builtin engine: {}", e);
            }
        }
        registry
    }

    /// Registers an engine under all of its schemes.
    ///
    /// Registering an identical descriptor again is a no-op. A descriptor
    /// that conflicts with an existing id or scheme fails with
    /// `EngineConflict` and leaves the registry unchanged.
    pub fn register(
        &self,
        mut descriptor: EngineDescriptor,
        adapter: Arc<dyn EngineAdapter>,
    ) -> EngineResult<()> {
        descriptor.schemes = descriptor
            .schemes
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();

        if descriptor.schemes.is_empty() {
            return Err(EngineError::engine_conflict(format!(
                "engine '{}' declares no schemes",
                descriptor.id
            )));
        }
        if adapter.engine_id() != descriptor.id {
            return Err(EngineError::engine_conflict(format!(
                "adapter for '{}' registered under descriptor '{}'",
                adapter.engine_id(),
                descriptor.id
            )));
        }

        let mut inner = self.inner.write();

        if let Some(existing) = inner.engines.get(&descriptor.id) {
            if *existing.descriptor == descriptor {
                return Ok(());
            }
            return Err(EngineError::engine_conflict(format!(
                "engine '{}' is already registered with a different descriptor",
                descriptor.id
            )));
        }

        for scheme in &descriptor.schemes {
            if let Some(owner) = inner.schemes.get(scheme) {
                return Err(EngineError::engine_conflict(format!(
                    "scheme '{}' is already registered to engine '{}'",
                    scheme, owner
                )));
            }
        }

        for scheme in &descriptor.schemes {
            inner.schemes.insert(scheme.clone(), descriptor.id.clone());
        }
        tracing::debug!(engine = %descriptor.id, schemes = ?descriptor.schemes, "Registered engine");
        inner.engines.insert(
            descriptor.id.clone(),
            Entry {
                descriptor: Arc::new(descriptor),
                adapter,
            },
        );
        Ok(())
    }

    /// Resolves a URI scheme (case-insensitive) to its descriptor
    pub fn resolve(&self, scheme: &str) -> EngineResult<Arc<EngineDescriptor>> {
        self.lookup(scheme).map(|(descriptor, _)| descriptor)
    }

    /// Resolves a scheme to its descriptor and adapter
    pub fn lookup(
        &self,
        scheme: &str,
    ) -> EngineResult<(Arc<EngineDescriptor>, Arc<dyn EngineAdapter>)> {
        let inner = self.inner.read();
        let entry = inner
            .schemes
            .get(&scheme.to_ascii_lowercase())
            .and_then(|id| inner.engines.get(id))
            .ok_or_else(|| EngineError::unknown_engine(scheme))?;
        Ok((entry.descriptor.clone(), entry.adapter.clone()))
    }

    /// Adapter serving a descriptor
    pub fn adapter(&self, descriptor: &EngineDescriptor) -> EngineResult<Arc<dyn EngineAdapter>> {
        let inner = self.inner.read();
        inner
            .engines
            .get(&descriptor.id)
            .map(|entry| entry.adapter.clone())
            .ok_or_else(|| EngineError::unknown_engine(descriptor.primary_scheme()))
    }

    /// All descriptors, sorted by id
    pub fn descriptors(&self) -> Vec<Arc<EngineDescriptor>> {
        let inner = self.inner.read();
        let mut descriptors: Vec<_> = inner
            .engines
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    /// All registered schemes, sorted
    pub fn schemes(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut schemes: Vec<String> = inner.schemes.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Returns the number of registered engines
    pub fn len(&self) -> usize {
        self.inner.read().engines.len()
    }

    /// Returns true if no engines are registered
    pub fn is_empty(&self) -> bool {
        self.inner.read().engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::target::ConnectTarget;
    use crate::engine::traits::SessionOptions;
    use async_trait::async_trait;
    use rela_core::{Capability, QueryResult, SessionId, Value};
    use rela_sql::Dialect;

    struct MockAdapter {
        id: &'static str,
    }

    #[async_trait]
    impl EngineAdapter for MockAdapter {
        fn engine_id(&self) -> &str {
            self.id
        }

        async fn connect(
            &self,
            _target: &ConnectTarget,
            _options: &SessionOptions,
        ) -> EngineResult<SessionId> {
            Ok(SessionId::new())
        }

        async fn execute(
            &self,
            _session: SessionId,
            _statement: &str,
            _params: &[Value],
        ) -> EngineResult<QueryResult> {
            Ok(QueryResult::empty())
        }

        async fn disconnect(&self, _session: SessionId) -> EngineResult<()> {
            Ok(())
        }
    }

    fn mock(id: &'static str) -> Arc<dyn EngineAdapter> {
        Arc::new(MockAdapter { id })
    }

    fn descriptor(id: &str, schemes: &[&str]) -> EngineDescriptor {
        EngineDescriptor::new(id, "Mock", Dialect::Postgres).with_schemes(schemes)
    }

    #[test]
    fn test_registry_basics() {
        let registry = EngineRegistry::new();
        assert!(registry.is_empty());

        registry
            .register(descriptor("mock1", &["mock1", "mk1"]), mock("mock1"))
            .unwrap();
        registry.register(descriptor("mock2", &["mock2"]), mock("mock2")).unwrap();
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.resolve("mk1").unwrap().id, "mock1");
        assert_eq!(registry.resolve("MOCK2").unwrap().id, "mock2");
        assert_eq!(registry.schemes(), vec!["mk1", "mock1", "mock2"]);
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = EngineRegistry::new();
        let err = registry.resolve("nosuchdb").unwrap_err();
        assert!(matches!(err, EngineError::UnknownEngine { .. }));
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = EngineRegistry::new();
        registry.register(descriptor("a", &["a"]), mock("a")).unwrap();
        registry.register(descriptor("a", &["a"]), mock("a")).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicts_leave_registry_unchanged() {
        let registry = EngineRegistry::new();
        registry.register(descriptor("a", &["a", "shared"]), mock("a")).unwrap();

        // same id, different descriptor
        let changed = descriptor("a", &["a"]).with_capabilities(&[Capability::Transactions]);
        let err = registry.register(changed, mock("a")).unwrap_err();
        assert!(matches!(err, EngineError::EngineConflict { .. }));

        // second scheme collides: the first one must not be registered either
        let err = registry
            .register(descriptor("b", &["b", "shared"]), mock("b"))
            .unwrap_err();
        assert!(matches!(err, EngineError::EngineConflict { .. }));
        assert!(registry.resolve("b").is_err());
        assert_eq!(registry.resolve("shared").unwrap().id, "a");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_adapter_must_match_descriptor() {
        let registry = EngineRegistry::new();
        let err = registry.register(descriptor("a", &["a"]), mock("b")).unwrap_err();
        assert!(matches!(err, EngineError::EngineConflict { .. }));
    }

    #[test]
    fn test_builtin_engines() {
        let registry = EngineRegistry::with_builtin_engines();
        for scheme in [
            "postgresql",
            "postgres",
            "mysql",
            "oracle",
            "redshift",
            "snowflake",
            "presto",
            "bigquery",
            "databricks",
            "duckdb",
            "trino",
            "clickhouse",
            "vertica",
        ] {
            let descriptor = registry.resolve(scheme).unwrap();
            assert!(registry.adapter(&descriptor).is_ok(), "{}", scheme);
        }
    }
}
