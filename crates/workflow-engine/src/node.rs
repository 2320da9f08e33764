//! The `WorkflowNode` trait, the contract every node honors.

use async_trait::async_trait;
use common::types::{EdgeMap, ExecutionContext, JsonValue, NodeMetadata};

/// The core node contract.
///
/// Nodes are stateless: an instance lives for the duration of one call
/// unless registered as a singleton, and must not retain references to the
/// context across invocations. `execute` may suspend on I/O and may mutate
/// `ctx.state`; the engine writes the mutated snapshot back after the call.
///
/// Any `Err` is converted into a node failure by the engine. A node that
/// wants a *routable* error catches internally and returns an `error` edge
/// instead.
#[async_trait]
pub trait WorkflowNode: Send + Sync {
    /// Self-description used for registration and catalog queries.
    fn metadata(&self) -> NodeMetadata;

    /// Run the node against the execution context and its static config,
    /// returning the edges it offers. The engine evaluates them in
    /// insertion order and routes on the first taken one.
    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        config: &JsonValue,
    ) -> anyhow::Result<EdgeMap>;

    /// Optional config validation, called by the parser after AST
    /// construction for registered node types.
    fn validate_config(&self, _config: &JsonValue) -> anyhow::Result<()> {
        Ok(())
    }
}
