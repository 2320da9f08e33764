//! Per-execution shared state and the inter-node edge-context slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::error::StateError;
use common::types::{JsonMap, JsonValue};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

struct ExecutionSlot {
    /// The state blob. Its mutex is the serialization point: updates for
    /// one execution queue here while executions never contend with each
    /// other.
    state: Mutex<JsonMap>,
    /// Single-slot staging area between nodes; consumed at most once.
    edge_context: Mutex<Option<JsonMap>>,
}

/// Keyed store of per-execution state. One slot per execution, created on
/// `initialize` and removed by `cleanup` (possibly deferred by the
/// retention window so status readers can still fetch the final state).
pub struct StateManager {
    slots: RwLock<HashMap<Uuid, Arc<ExecutionSlot>>>,
    retention: Duration,
}

impl StateManager {
    pub fn new(retention: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub async fn initialize(&self, execution_id: Uuid, seed: JsonMap) {
        let slot = Arc::new(ExecutionSlot {
            state: Mutex::new(seed),
            edge_context: Mutex::new(None),
        });
        self.slots.write().await.insert(execution_id, slot);
    }

    async fn slot(&self, execution_id: Uuid) -> Result<Arc<ExecutionSlot>, StateError> {
        self.slots
            .read()
            .await
            .get(&execution_id)
            .cloned()
            .ok_or(StateError::ExecutionNotFound(execution_id))
    }

    /// Clone of the current state; callers cannot mutate the slot through it.
    pub async fn get_state(&self, execution_id: Uuid) -> Result<JsonMap, StateError> {
        let slot = self.slot(execution_id).await?;
        let state = slot.state.lock().await;
        Ok(state.clone())
    }

    /// Deep-merge a partial update into the state. Used for seeding and
    /// external patches; node write-back goes through [`replace_state`].
    ///
    /// [`replace_state`]: StateManager::replace_state
    pub async fn update_state(&self, execution_id: Uuid, partial: JsonMap) -> Result<(), StateError> {
        let slot = self.slot(execution_id).await?;
        let mut state = slot.state.lock().await;
        deep_merge(&mut state, partial);
        Ok(())
    }

    /// Swap in a node's mutated snapshot wholesale. Replacement (rather
    /// than merge) preserves overwrite semantics: a node that replaced an
    /// object must not see the old keys resurrected.
    pub async fn replace_state(&self, execution_id: Uuid, next: JsonMap) -> Result<(), StateError> {
        let slot = self.slot(execution_id).await?;
        let mut state = slot.state.lock().await;
        *state = next;
        Ok(())
    }

    pub async fn set_edge_context(
        &self,
        execution_id: Uuid,
        data: JsonMap,
    ) -> Result<(), StateError> {
        let slot = self.slot(execution_id).await?;
        let mut edge_context = slot.edge_context.lock().await;
        *edge_context = Some(data);
        Ok(())
    }

    /// Return and atomically clear the edge context.
    pub async fn take_edge_context(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<JsonMap>, StateError> {
        let slot = self.slot(execution_id).await?;
        let mut edge_context = slot.edge_context.lock().await;
        Ok(edge_context.take())
    }

    /// Remove all per-execution data immediately.
    pub async fn cleanup(&self, execution_id: Uuid) {
        if self.slots.write().await.remove(&execution_id).is_some() {
            debug!(%execution_id, "state slot cleaned up");
        }
    }

    /// Remove the slot after the retention window elapses.
    pub fn schedule_cleanup(self: &Arc<Self>, execution_id: Uuid) {
        let manager = Arc::clone(self);
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            manager.cleanup(execution_id).await;
        });
    }
}

/// Recursive object merge: objects merge key-wise, everything else is
/// overwritten by the patch.
pub fn deep_merge(target: &mut JsonMap, patch: JsonMap) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: JsonValue) -> JsonMap {
        match value {
            JsonValue::Object(m) => m,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn deep_merge_merges_objects_and_overwrites_scalars() {
        let mut target = map(json!({"a": {"x": 1, "y": 2}, "b": 1}));
        deep_merge(&mut target, map(json!({"a": {"y": 3, "z": 4}, "b": {"now": "object"}})));
        assert_eq!(
            JsonValue::Object(target),
            json!({"a": {"x": 1, "y": 3, "z": 4}, "b": {"now": "object"}})
        );
    }

    #[tokio::test]
    async fn get_state_returns_a_defensive_copy() {
        let manager = StateManager::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        manager.initialize(id, map(json!({"n": 1}))).await;

        let mut snapshot = manager.get_state(id).await.expect("state");
        snapshot.insert("n".into(), json!(99));

        let fresh = manager.get_state(id).await.expect("state");
        assert_eq!(fresh.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn update_state_deep_merges() {
        let manager = StateManager::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        manager.initialize(id, map(json!({"config": {"a": 1}}))).await;
        manager
            .update_state(id, map(json!({"config": {"b": 2}})))
            .await
            .expect("update");
        let state = manager.get_state(id).await.expect("state");
        assert_eq!(JsonValue::Object(state), json!({"config": {"a": 1, "b": 2}}));
    }

    #[tokio::test]
    async fn replace_state_drops_old_keys() {
        let manager = StateManager::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        manager.initialize(id, map(json!({"old": true}))).await;
        manager
            .replace_state(id, map(json!({"new": true})))
            .await
            .expect("replace");
        let state = manager.get_state(id).await.expect("state");
        assert_eq!(JsonValue::Object(state), json!({"new": true}));
    }

    #[tokio::test]
    async fn edge_context_is_consumed_exactly_once() {
        let manager = StateManager::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        manager.initialize(id, JsonMap::new()).await;
        manager
            .set_edge_context(id, map(json!({"from": "previous"})))
            .await
            .expect("set");

        let first = manager.take_edge_context(id).await.expect("take");
        assert_eq!(first.map(JsonValue::Object), Some(json!({"from": "previous"})));

        let second = manager.take_edge_context(id).await.expect("take");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn cleanup_makes_subsequent_access_fail() {
        let manager = StateManager::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        manager.initialize(id, JsonMap::new()).await;
        manager.cleanup(id).await;

        assert!(matches!(
            manager.get_state(id).await,
            Err(StateError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            manager.take_edge_context(id).await,
            Err(StateError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            manager.update_state(id, JsonMap::new()).await,
            Err(StateError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_cleanup_fires_after_retention() {
        let manager = Arc::new(StateManager::new(Duration::from_secs(60)));
        let id = Uuid::new_v4();
        manager.initialize(id, JsonMap::new()).await;
        manager.schedule_cleanup(id);

        // Still readable inside the retention window.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(manager.get_state(id).await.is_ok());

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(manager.get_state(id).await.is_err());
    }
}
