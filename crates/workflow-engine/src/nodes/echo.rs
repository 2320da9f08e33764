use async_trait::async_trait;
use common::types::{EdgeMap, ExecutionContext, JsonValue, NodeMetadata};
use serde_json::json;

use crate::node::WorkflowNode;

/// Reference node that copies its config into the `success` edge payload.
/// Handy for smoke-testing documents and for exercising edge-context flow.
#[derive(Debug, Default)]
pub struct EchoNode;

#[async_trait]
impl WorkflowNode for EchoNode {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("echo", "Echo", "1.0.0")
            .with_description("Returns its config as the success payload")
            .with_outputs(&["success"])
    }

    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        config: &JsonValue,
    ) -> anyhow::Result<EdgeMap> {
        let payload = match config {
            JsonValue::Object(_) => config.clone(),
            _ => json!({}),
        };
        Ok(EdgeMap::single("success", payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::JsonMap;
    use uuid::Uuid;

    #[tokio::test]
    async fn echoes_config_on_success() {
        let node = EchoNode;
        let mut ctx = ExecutionContext {
            state: JsonMap::new(),
            inputs: JsonMap::new(),
            workflow_id: "wf".to_string(),
            node_id: "echo".to_string(),
            execution_id: Uuid::new_v4(),
            iteration: None,
        };
        let edges = node
            .execute(&mut ctx, &json!({"greeting": "hi"}))
            .await
            .expect("execute");
        let (name, value) = edges.into_entries().into_iter().next().expect("one edge");
        assert_eq!(name, "success");
        assert_eq!(value.evaluate(), Some(json!({"greeting": "hi"})));
    }
}
