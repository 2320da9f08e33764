//! Process-wide catalog of node implementations, keyed by metadata id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use common::error::RegistryError;
use common::types::{NodeMetadata, NodeSource};
use tracing::debug;

use crate::node::WorkflowNode;
use crate::nodes::StateSetterNode;

/// Produces a fresh node instance per call.
pub type NodeFactory = Arc<dyn Fn() -> Arc<dyn WorkflowNode> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOptions {
    /// Keep the probe instance and hand it out on every `instantiate`.
    pub singleton: bool,
    pub source: NodeSource,
}

impl RegisterOptions {
    pub fn singleton() -> Self {
        Self {
            singleton: true,
            ..Self::default()
        }
    }

    pub fn with_source(source: NodeSource) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
struct Registration {
    factory: NodeFactory,
    metadata: NodeMetadata,
    singleton: Option<Arc<dyn WorkflowNode>>,
    source: NodeSource,
}

/// Maps node type ids to factories. Read-mostly after startup; mutations
/// serialize on the interior lock. Lookups are synchronous so the parser
/// can consult the registry without an async context.
pub struct NodeRegistry {
    environment: NodeSource,
    entries: RwLock<HashMap<String, Registration>>,
}

impl NodeRegistry {
    /// A registry answering queries for the given environment. The built-in
    /// state setter is registered eagerly, so `has("__state_setter__")`
    /// holds before any explicit registration.
    pub fn new(environment: NodeSource) -> Self {
        let registry = Self {
            environment,
            entries: RwLock::new(HashMap::new()),
        };
        registry.seed_builtins();
        registry
    }

    fn seed_builtins(&self) {
        let setter: Arc<dyn WorkflowNode> = Arc::new(StateSetterNode);
        let metadata = setter.metadata();
        self.write().insert(
            metadata.id.clone(),
            Registration {
                factory: Arc::new(|| Arc::new(StateSetterNode) as Arc<dyn WorkflowNode>),
                metadata,
                singleton: Some(setter),
                source: NodeSource::Universal,
            },
        );
    }

    /// Register a node type via its factory. The factory is invoked once to
    /// probe metadata; the `(id, name, version)` triple must be non-empty.
    /// Re-registering the same id at the same version is a no-op; a
    /// different version is a conflict.
    pub fn register_with(
        &self,
        factory: NodeFactory,
        options: RegisterOptions,
    ) -> Result<String, RegistryError> {
        let probe = factory();
        let metadata = probe.metadata();
        if metadata.id.is_empty() || metadata.name.is_empty() || metadata.version.is_empty() {
            return Err(RegistryError::Registration(
                "node metadata must provide non-empty id, name and version".to_string(),
            ));
        }

        let mut entries = self.write();
        if let Some(existing) = entries.get(&metadata.id) {
            if existing.metadata.version == metadata.version {
                return Ok(metadata.id);
            }
            return Err(RegistryError::VersionConflict {
                id: metadata.id,
                existing: existing.metadata.version.clone(),
                offered: metadata.version,
            });
        }

        debug!(node_id = %metadata.id, version = %metadata.version, "registering node type");
        let id = metadata.id.clone();
        entries.insert(
            id.clone(),
            Registration {
                factory,
                metadata,
                singleton: options.singleton.then_some(probe),
                source: options.source,
            },
        );
        Ok(id)
    }

    /// Convenience wrapper for `Default`-constructible node types.
    pub fn register<N>(&self, options: RegisterOptions) -> Result<String, RegistryError>
    where
        N: WorkflowNode + Default + 'static,
    {
        self.register_with(
            Arc::new(|| Arc::new(N::default()) as Arc<dyn WorkflowNode>),
            options,
        )
    }

    /// Fresh instance (or the singleton) for a node type id. Registrations
    /// hidden from this registry's environment answer as not found.
    pub fn instantiate(&self, node_id: &str) -> Result<Arc<dyn WorkflowNode>, RegistryError> {
        let entries = self.read();
        let registration = entries
            .get(node_id)
            .filter(|r| r.source.visible_to(self.environment))
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;
        Ok(match &registration.singleton {
            Some(instance) => Arc::clone(instance),
            None => (registration.factory)(),
        })
    }

    pub fn has(&self, node_id: &str) -> bool {
        self.read()
            .get(node_id)
            .is_some_and(|r| r.source.visible_to(self.environment))
    }

    pub fn metadata(&self, node_id: &str) -> Result<NodeMetadata, RegistryError> {
        self.read()
            .get(node_id)
            .filter(|r| r.source.visible_to(self.environment))
            .map(|r| r.metadata.clone())
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))
    }

    /// All visible registrations, optionally narrowed to one source tag.
    pub fn list(&self, source: Option<NodeSource>) -> Vec<NodeMetadata> {
        self.read()
            .values()
            .filter(|r| r.source.visible_to(self.environment))
            .filter(|r| source.map_or(true, |s| r.source == s))
            .map(|r| r.metadata.clone())
            .collect()
    }

    pub fn unregister(&self, node_id: &str) -> bool {
        self.write().remove(node_id).is_some()
    }

    /// Drop every registration, then re-seed the built-ins.
    pub fn clear(&self) {
        self.write().clear();
        self.seed_builtins();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Registration>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Registration>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(NodeSource::Universal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::types::{EdgeMap, ExecutionContext, JsonValue, STATE_SETTER_NODE_ID};
    use serde_json::json;

    struct Probe {
        version: &'static str,
        source_name: &'static str,
    }

    impl Default for Probe {
        fn default() -> Self {
            Self {
                version: "1.0.0",
                source_name: "probe",
            }
        }
    }

    #[async_trait]
    impl WorkflowNode for Probe {
        fn metadata(&self) -> NodeMetadata {
            NodeMetadata::new(self.source_name, "Probe", self.version)
        }

        async fn execute(
            &self,
            _ctx: &mut ExecutionContext,
            _config: &JsonValue,
        ) -> anyhow::Result<EdgeMap> {
            Ok(EdgeMap::single("success", json!({})))
        }
    }

    struct Anonymous;

    #[async_trait]
    impl WorkflowNode for Anonymous {
        fn metadata(&self) -> NodeMetadata {
            NodeMetadata::new("", "Nameless", "1.0.0")
        }

        async fn execute(
            &self,
            _ctx: &mut ExecutionContext,
            _config: &JsonValue,
        ) -> anyhow::Result<EdgeMap> {
            Ok(EdgeMap::new())
        }
    }

    #[test]
    fn state_setter_is_available_before_any_registration() {
        let registry = NodeRegistry::default();
        assert!(registry.has(STATE_SETTER_NODE_ID));
        assert!(registry.instantiate(STATE_SETTER_NODE_ID).is_ok());
    }

    #[test]
    fn empty_metadata_is_rejected() {
        let registry = NodeRegistry::default();
        let result = registry.register_with(
            Arc::new(|| Arc::new(Anonymous) as Arc<dyn WorkflowNode>),
            Default::default(),
        );
        assert!(matches!(result, Err(RegistryError::Registration(_))));
    }

    #[test]
    fn same_version_reregistration_is_noop_but_version_bump_conflicts() {
        let registry = NodeRegistry::default();
        registry
            .register::<Probe>(Default::default())
            .expect("first registration");
        registry
            .register::<Probe>(Default::default())
            .expect("same version is a no-op");

        let bumped = registry.register_with(
            Arc::new(|| {
                Arc::new(Probe {
                    version: "2.0.0",
                    source_name: "probe",
                }) as Arc<dyn WorkflowNode>
            }),
            Default::default(),
        );
        assert!(matches!(bumped, Err(RegistryError::VersionConflict { .. })));
    }

    #[test]
    fn non_singleton_instantiation_constructs_fresh_instances() {
        let registry = NodeRegistry::default();
        registry
            .register::<Probe>(Default::default())
            .expect("registration");
        let a = registry.instantiate("probe").expect("instance");
        let b = registry.instantiate("probe").expect("instance");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn singleton_instantiation_returns_the_same_instance() {
        let registry = NodeRegistry::default();
        registry
            .register::<Probe>(RegisterOptions::singleton())
            .expect("registration");
        let a = registry.instantiate("probe").expect("instance");
        let b = registry.instantiate("probe").expect("instance");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn server_nodes_are_hidden_from_client_environments() {
        let registry = NodeRegistry::new(NodeSource::Client);
        registry
            .register::<Probe>(RegisterOptions::with_source(NodeSource::Server))
            .expect("registration");
        assert!(!registry.has("probe"));
        assert!(matches!(
            registry.instantiate("probe"),
            Err(RegistryError::NotFound(_))
        ));
        // Universal nodes stay visible.
        assert!(registry.has(STATE_SETTER_NODE_ID));
    }

    #[test]
    fn list_filters_by_source_tag() {
        let registry = NodeRegistry::default();
        registry
            .register::<Probe>(RegisterOptions::with_source(NodeSource::Server))
            .expect("registration");
        let server_only = registry.list(Some(NodeSource::Server));
        assert_eq!(server_only.len(), 1);
        assert_eq!(server_only[0].id, "probe");
        // Unfiltered listing includes the built-in setter too.
        assert_eq!(registry.list(None).len(), 2);
    }

    #[test]
    fn clear_reseeds_builtins() {
        let registry = NodeRegistry::default();
        registry
            .register::<Probe>(Default::default())
            .expect("registration");
        registry.clear();
        assert!(!registry.has("probe"));
        assert!(registry.has(STATE_SETTER_NODE_ID));
    }

    #[test]
    fn unregister_removes_the_entry() {
        let registry = NodeRegistry::default();
        registry
            .register::<Probe>(Default::default())
            .expect("registration");
        assert!(registry.unregister("probe"));
        assert!(!registry.unregister("probe"));
        assert!(!registry.has("probe"));
    }
}
