use async_trait::async_trait;
use common::types::{EdgeMap, ExecutionContext, JsonValue, NodeMetadata};
use serde_json::json;

use crate::node::WorkflowNode;

/// Reference node that increments a numeric state key on every call.
///
/// Config:
/// - `key`: state key to increment (default `"n"`)
/// - `edge`: name of the edge returned after incrementing (default
///   `"continue"`)
/// - `stopAt`: when set, the node returns no edge once the counter has
///   reached this value, letting a loop fall through
#[derive(Debug, Default)]
pub struct CounterNode;

#[async_trait]
impl WorkflowNode for CounterNode {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("counter", "Counter", "1.0.0")
            .with_description("Increments a state key each call; loop-friendly")
            .with_outputs(&["continue"])
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        config: &JsonValue,
    ) -> anyhow::Result<EdgeMap> {
        let key = config
            .get("key")
            .and_then(JsonValue::as_str)
            .unwrap_or("n")
            .to_string();
        let edge = config
            .get("edge")
            .and_then(JsonValue::as_str)
            .unwrap_or("continue")
            .to_string();
        let stop_at = config.get("stopAt").and_then(JsonValue::as_i64);

        let current = ctx.state.get(&key).and_then(JsonValue::as_i64).unwrap_or(0);
        let next = current + 1;
        ctx.state.insert(key, json!(next));

        if stop_at.is_some_and(|limit| next >= limit) {
            return Ok(EdgeMap::new());
        }
        Ok(EdgeMap::single(edge, json!({})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::JsonMap;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            state: JsonMap::new(),
            inputs: JsonMap::new(),
            workflow_id: "wf".to_string(),
            node_id: "counter".to_string(),
            execution_id: Uuid::new_v4(),
            iteration: None,
        }
    }

    #[tokio::test]
    async fn increments_and_selects_continue() {
        let node = CounterNode;
        let mut ctx = ctx();
        for expected in 1..=3 {
            let edges = node.execute(&mut ctx, &json!({})).await.expect("execute");
            assert_eq!(ctx.state.get("n"), Some(&json!(expected)));
            assert_eq!(edges.len(), 1);
        }
    }

    #[tokio::test]
    async fn stops_at_limit() {
        let node = CounterNode;
        let mut ctx = ctx();
        let config = json!({"stopAt": 2});
        assert_eq!(node.execute(&mut ctx, &config).await.expect("first").len(), 1);
        // Second call reaches the limit and returns no edge.
        assert!(node.execute(&mut ctx, &config).await.expect("second").is_empty());
        assert_eq!(ctx.state.get("n"), Some(&json!(2)));
    }
}
