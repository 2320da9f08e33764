use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::ErrorRecord;

// Basic types
pub type JsonValue = serde_json::Value;
/// `serde_json` is built with `preserve_order`, so this map iterates in
/// insertion order. Document key order is semantic for traversal.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Reserved key under which a node's static config is merged into its inputs.
pub const NODE_CONFIG_KEY: &str = "_nodeConfig";
/// Diagnostic marker written by the state setter's explicit form.
pub const LAST_STATE_SET_KEY: &str = "_lastStateSet";
/// Registry id of the built-in state setter.
pub const STATE_SETTER_NODE_ID: &str = "__state_setter__";
/// Suffix marking a node occurrence as a loop node.
pub const LOOP_SUFFIX: &str = "...";

// Node metadata

/// Self-description every node exposes. The `(id, name, version)` triple
/// must be non-empty or registration fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_hints: Option<AiHints>,
}

impl NodeMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            ai_hints: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_ai_hints(mut self, hints: AiHints) -> Self {
        self.ai_hints = Some(hints);
        self
    }
}

/// Advisory hints that help agentic planners pick nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiHints {
    pub purpose: String,
    pub when_to_use: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<JsonValue>,
}

/// Where a node implementation is allowed to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSource {
    #[default]
    Universal,
    Server,
    Client,
}

impl NodeSource {
    /// Visibility rule: universal registrations are visible everywhere; a
    /// server registration is hidden from client queries and vice versa.
    /// A universal environment applies no filter.
    pub fn visible_to(self, environment: NodeSource) -> bool {
        self == NodeSource::Universal || environment == NodeSource::Universal || self == environment
    }
}

// Parsed workflow AST

/// Output of the parser. Immutable after parsing; share as `Arc<ParsedWorkflow>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedWorkflow {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<JsonMap>,
    pub nodes: Vec<ParsedNode>,
}

impl ParsedWorkflow {
    /// Index of a top-level node by its (loop-suffix-stripped) id.
    pub fn index_of(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.node_id == node_id)
    }
}

/// One node occurrence in the AST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedNode {
    /// Registry key after stripping the optional `...` loop suffix.
    pub node_id: String,
    /// The identifier exactly as written in the document.
    pub raw_node_id: String,
    pub is_loop_node: bool,
    /// The node's parameter mapping (edge declarations removed).
    pub config: JsonMap,
    /// Edge name (optionality marker stripped) to definition.
    pub edges: HashMap<String, EdgeDefinition>,
    /// Direct nested nodes reachable from `edges`, for topological analysis.
    pub children: Vec<ParsedNode>,
    /// 0 at top level, increasing with nesting.
    pub depth: usize,
    /// Debug identifier unique within the workflow.
    pub unique_id: String,
    /// `unique_id` of the enclosing node, if any. A handle rather than a
    /// pointer so the AST stays acyclic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl ParsedNode {
    /// A bare reference to a registered node type, used for in-line side
    /// calls where the document supplies no config or edges.
    pub fn reference(node_id: impl Into<String>, depth: usize) -> Self {
        let node_id = node_id.into();
        Self {
            raw_node_id: node_id.clone(),
            unique_id: format!("{node_id}_inline"),
            node_id,
            is_loop_node: false,
            config: JsonMap::new(),
            edges: HashMap::new(),
            children: Vec::new(),
            depth,
            parent: None,
        }
    }
}

/// A named outgoing transition as declared in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    /// `None` when the edge was declared without a routing value
    /// (pure fall-through, e.g. `"success?": null`).
    pub route: Option<ParsedEdge>,
    /// Whether the document key carried the `?` marker.
    pub optional: bool,
}

/// Routing action attached to an edge. A closed sum; the state-setter edge
/// form reduces to `Nested` over a synthetic setter node at parse time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedEdge {
    /// Jump to another node by id.
    Simple { target: String },
    /// Execute items in order.
    Sequence { items: Vec<SequenceItem> },
    /// Execute the supplied sub-node inline.
    Nested { node: Box<ParsedNode> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceItem {
    Reference(String),
    Node(Box<ParsedNode>),
}

// Execution types

/// Context passed to every node invocation. `state` is a private snapshot
/// the node may mutate; the engine writes it back after the call returns.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub state: JsonMap,
    /// Consumed edge context merged with the state view and the node's
    /// static config under [`NODE_CONFIG_KEY`].
    pub inputs: JsonMap,
    pub workflow_id: String,
    pub node_id: String,
    pub execution_id: Uuid,
    /// Present inside a loop (1-based).
    pub iteration: Option<u32>,
}

/// Lazily evaluated edge payload. `Ready(None)` / a thunk returning `None`
/// means the edge was not taken.
pub enum EdgeValue {
    Ready(Option<JsonValue>),
    Thunk(Box<dyn FnOnce() -> Option<JsonValue> + Send>),
}

impl EdgeValue {
    pub fn evaluate(self) -> Option<JsonValue> {
        match self {
            EdgeValue::Ready(v) => v,
            EdgeValue::Thunk(f) => f(),
        }
    }
}

impl fmt::Debug for EdgeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeValue::Ready(v) => f.debug_tuple("Ready").field(v).finish(),
            EdgeValue::Thunk(_) => f.write_str("Thunk(..)"),
        }
    }
}

/// What a node returns: an ordered mapping from edge name to a lazy payload.
/// The engine evaluates entries in insertion order; the first non-empty
/// payload defines the selected edge. Canonical nodes return exactly one.
#[derive(Debug, Default)]
pub struct EdgeMap {
    entries: Vec<(String, EdgeValue)>,
}

impl EdgeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The common case: exactly one taken edge with a ready payload.
    pub fn single(name: impl Into<String>, payload: JsonValue) -> Self {
        let mut map = Self::new();
        map.push(name, payload);
        map
    }

    pub fn push(&mut self, name: impl Into<String>, payload: JsonValue) {
        self.entries
            .push((name.into(), EdgeValue::Ready(Some(payload))));
    }

    pub fn push_not_taken(&mut self, name: impl Into<String>) {
        self.entries.push((name.into(), EdgeValue::Ready(None)));
    }

    pub fn push_thunk(
        &mut self,
        name: impl Into<String>,
        thunk: impl FnOnce() -> Option<JsonValue> + Send + 'static,
    ) {
        self.entries
            .push((name.into(), EdgeValue::Thunk(Box::new(thunk))));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn into_entries(self) -> Vec<(String, EdgeValue)> {
        self.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Snapshot of one execution, safe to poll while the run is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub final_state: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub node_executions: Vec<NodeExecution>,
    pub metrics: ExecutionMetrics,
}

/// Per-node record within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_edge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_nodes: usize,
    pub executed_nodes: usize,
    pub duration_ms: u64,
    pub state_size_bytes: usize,
}

// Validation types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let valid = !issues.iter().any(|i| i.severity == Severity::Error);
        Self {
            valid,
            errors: issues,
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .count()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.errors
            .iter()
            .filter(|i| i.severity == Severity::Warning)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// JSON-pointer-ish location within the document, e.g. `workflow[2].fetch`.
    pub path: String,
    pub code: ValidationCode,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn error(path: impl Into<String>, code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code,
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(
        path: impl Into<String>,
        code: ValidationCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            code,
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    InvalidSchema,
    InvalidId,
    InvalidName,
    InvalidVersion,
    EmptyWorkflow,
    UnknownReference,
    CircularReference,
    InvalidStateSetterSyntax,
    InvalidConfig,
    InvalidEdge,
    UndeclaredEdge,
    NestingTooDeep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn edge_map_first_non_empty_wins_in_insertion_order() {
        let mut map = EdgeMap::new();
        map.push_not_taken("skip");
        map.push("taken", json!({"a": 1}));
        map.push("also", json!({"b": 2}));

        let mut winner = None;
        for (name, value) in map.into_entries() {
            if let Some(data) = value.evaluate() {
                winner = Some((name, data));
                break;
            }
        }
        let (name, data) = winner.expect("an edge should be taken");
        assert_eq!(name, "taken");
        assert_eq!(data, json!({"a": 1}));
    }

    #[test]
    fn edge_map_thunks_are_deferred() {
        let mut map = EdgeMap::new();
        map.push_thunk("lazy", || Some(json!({"computed": true})));
        let entries = map.into_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.into_iter().next().map(|(_, v)| v.evaluate()),
            Some(Some(json!({"computed": true}))));
    }

    #[test]
    fn node_source_visibility() {
        use NodeSource::*;
        assert!(Universal.visible_to(Server));
        assert!(Universal.visible_to(Client));
        assert!(Server.visible_to(Server));
        assert!(!Server.visible_to(Client));
        assert!(!Client.visible_to(Server));
        assert!(Server.visible_to(Universal));
    }

    #[test]
    fn validation_result_valid_iff_no_errors() {
        let warn_only = ValidationResult::from_issues(vec![ValidationIssue::warning(
            "workflow[0]",
            ValidationCode::UndeclaredEdge,
            "edge 'done' is not a declared output",
        )]);
        assert!(warn_only.valid);
        assert_eq!(warn_only.error_count(), 0);

        let with_error = ValidationResult::from_issues(vec![ValidationIssue::error(
            "id",
            ValidationCode::InvalidId,
            "bad id",
        )]);
        assert!(!with_error.valid);
        assert_eq!(with_error.error_count(), 1);
    }
}
