//! The built-in node behind `$.path` assignment blocks.

use async_trait::async_trait;
use common::types::{
    AiHints, EdgeMap, ExecutionContext, JsonValue, NodeMetadata, LAST_STATE_SET_KEY,
    STATE_SETTER_NODE_ID,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

use crate::node::WorkflowNode;
use crate::template::resolve_templates;

lazy_static! {
    static ref STATE_PATH_RE: Regex =
        Regex::new(r"^\$\.[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
            .expect("state path pattern is a valid regex");
}

/// Whether a document key is *claiming* to be a state-setter path.
pub fn is_state_setter_key(key: &str) -> bool {
    key.starts_with("$.")
}

/// Whether a key is a well-formed state-setter path.
pub fn is_valid_state_path(key: &str) -> bool {
    STATE_PATH_RE.is_match(key)
}

/// Assigns `config.value` into shared state at `config.path`, creating
/// intermediate objects as needed and overwriting the final segment.
///
/// `{{key}}` placeholders inside the value are resolved against the current
/// state before assignment. The explicit form (`"explicit": true`, set by
/// the parser when the document carried a literal `value` key) also writes
/// the `_lastStateSet` diagnostic marker at the state root.
#[derive(Debug, Default)]
pub struct StateSetterNode;

#[async_trait]
impl WorkflowNode for StateSetterNode {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(STATE_SETTER_NODE_ID, "State Setter", "1.0.0")
            .with_description("Assigns a value into shared state at a $.dotted.path")
            .with_outputs(&["success"])
            .with_ai_hints(AiHints {
                purpose: "Write a literal or templated value into shared state".to_string(),
                when_to_use: "Use a $.path key in the workflow document instead of a node id"
                    .to_string(),
                example: Some(json!({"$.config.timeout": {"value": 30}})),
            })
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        config: &JsonValue,
    ) -> anyhow::Result<EdgeMap> {
        let path = config
            .get("path")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| anyhow::anyhow!("state setter config is missing 'path'"))?;
        if !is_valid_state_path(path) {
            anyhow::bail!("invalid state path '{path}'");
        }
        let raw_value = config.get("value").cloned().unwrap_or(JsonValue::Null);
        let explicit = config
            .get("explicit")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);

        let value = resolve_templates(&raw_value, &ctx.state);

        // Walk to the parent of the final segment, creating plain objects
        // for missing (or non-object) intermediate segments.
        let segments: Vec<&str> = path.trim_start_matches("$.").split('.').collect();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| anyhow::anyhow!("state path '{path}' has no segments"))?;

        let mut cursor = &mut ctx.state;
        for segment in parents {
            let entry = cursor
                .entry(segment.to_string())
                .or_insert_with(|| json!({}));
            if !entry.is_object() {
                *entry = json!({});
            }
            cursor = entry
                .as_object_mut()
                .ok_or_else(|| anyhow::anyhow!("segment '{segment}' is not an object"))?;
        }
        cursor.insert(last.to_string(), value.clone());

        if explicit {
            ctx.state.insert(
                LAST_STATE_SET_KEY.to_string(),
                json!({"path": path, "value": value}),
            );
        }

        Ok(EdgeMap::single(
            "success",
            json!({"path": path, "value": value}),
        ))
    }

    fn validate_config(&self, config: &JsonValue) -> anyhow::Result<()> {
        let path = config
            .get("path")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| anyhow::anyhow!("state setter config is missing 'path'"))?;
        if !is_valid_state_path(path) {
            anyhow::bail!("invalid state path '{path}'");
        }
        Ok(())
    }
}
