//! The execution engine: drives a parsed workflow node by node, resolving
//! each selected edge to a routing action.
//!
//! One execution is one cooperative tokio task. Nodes may suspend on I/O,
//! but the engine never runs two nodes of the same execution in parallel;
//! the code between node calls is non-suspending and deterministic apart
//! from the serialized state-manager operations.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::config::EngineConfig;
use common::error::{ErrorRecord, ExecutionError};
use common::types::{
    EdgeDefinition, ExecutionContext, ExecutionMetrics, ExecutionResult, ExecutionStatus, JsonMap,
    JsonValue, NodeExecution, NodeMetadata, NodeSource, ParsedEdge, ParsedNode, ParsedWorkflow,
    SequenceItem, ValidationResult, NODE_CONFIG_KEY,
};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::parser::WorkflowParser;
use crate::registry::NodeRegistry;
use crate::state::{deep_merge, StateManager};

/// `(base, is_loop)` for a node identifier reference.
fn strip_loop_reference(name: &str) -> (&str, bool) {
    match name.strip_suffix(common::types::LOOP_SUFFIX) {
        Some(base) => (base, true),
        None => (name, false),
    }
}

/// The execution API consumed by transports.
///
/// `execute` returns immediately with the execution id; `get_status` is
/// safe to poll while the run is in flight. Finished executions stay
/// readable for the configured retention window, then disappear.
pub struct WorkflowExecutor {
    registry: Arc<NodeRegistry>,
    state: Arc<StateManager>,
    parser: WorkflowParser,
    config: EngineConfig,
    executions: Arc<RwLock<HashMap<Uuid, ExecutionHandle>>>,
}

#[derive(Clone)]
struct ExecutionHandle {
    snapshot: Arc<Mutex<ExecutionResult>>,
    cancel: CancellationToken,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: Arc<NodeRegistry>, config: EngineConfig) -> Self {
        Self {
            state: Arc::new(StateManager::new(config.state_retention())),
            parser: WorkflowParser::new(Arc::clone(&registry)),
            registry,
            config,
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Validate a raw document without executing it.
    pub fn validate(&self, document: &JsonValue) -> ValidationResult {
        self.parser.validate(document)
    }

    /// Parse a raw document against this executor's registry.
    pub fn parse(&self, document: &JsonValue) -> Result<ParsedWorkflow, ValidationResult> {
        self.parser.parse(document)
    }

    pub fn list_registered(&self, source: Option<NodeSource>) -> Vec<NodeMetadata> {
        self.registry.list(source)
    }

    /// Begin an execution and return its id immediately.
    pub async fn execute(&self, workflow: Arc<ParsedWorkflow>, seed: Option<JsonMap>) -> Uuid {
        let task = self.prepare(workflow, seed).await;
        let execution_id = task.execution_id;
        tokio::spawn(async move {
            task.run().await;
        });
        execution_id
    }

    /// Run an execution to completion on the caller's task and return the
    /// final result. Convenience for embedders and tests.
    pub async fn execute_and_wait(
        &self,
        workflow: Arc<ParsedWorkflow>,
        seed: Option<JsonMap>,
    ) -> ExecutionResult {
        self.prepare(workflow, seed).await.run().await
    }

    /// Snapshot of an execution, including partial metrics while running.
    pub async fn get_status(&self, execution_id: Uuid) -> Option<ExecutionResult> {
        let handle = self.executions.read().await.get(&execution_id).cloned()?;
        let snapshot = handle.snapshot.lock().await;
        Some(snapshot.clone())
    }

    /// Request cooperative cancellation. Returns false for unknown or
    /// already-terminal executions.
    pub async fn cancel(&self, execution_id: Uuid) -> bool {
        let Some(handle) = self.executions.read().await.get(&execution_id).cloned() else {
            return false;
        };
        if handle.snapshot.lock().await.status.is_terminal() {
            return false;
        }
        handle.cancel.cancel();
        true
    }

    async fn prepare(&self, workflow: Arc<ParsedWorkflow>, seed: Option<JsonMap>) -> ExecutionTask {
        let execution_id = Uuid::new_v4();
        let mut initial = workflow.initial_state.clone().unwrap_or_default();
        if let Some(seed) = seed {
            deep_merge(&mut initial, seed);
        }
        self.state.initialize(execution_id, initial.clone()).await;

        let snapshot = ExecutionResult {
            execution_id,
            workflow_id: workflow.id.clone(),
            status: ExecutionStatus::Running,
            final_state: initial,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            node_executions: Vec::new(),
            metrics: ExecutionMetrics {
                total_nodes: workflow.nodes.len(),
                ..ExecutionMetrics::default()
            },
        };
        let handle = ExecutionHandle {
            snapshot: Arc::new(Mutex::new(snapshot)),
            cancel: CancellationToken::new(),
        };
        self.executions
            .write()
            .await
            .insert(execution_id, handle.clone());

        ExecutionTask {
            workflow,
            registry: Arc::clone(&self.registry),
            state: Arc::clone(&self.state),
            config: self.config.clone(),
            executions: Arc::clone(&self.executions),
            handle,
            execution_id,
        }
    }
}

/// One running execution: the cursor loop plus everything it needs.
struct ExecutionTask {
    workflow: Arc<ParsedWorkflow>,
    registry: Arc<NodeRegistry>,
    state: Arc<StateManager>,
    config: EngineConfig,
    executions: Arc<RwLock<HashMap<Uuid, ExecutionHandle>>>,
    handle: ExecutionHandle,
    execution_id: Uuid,
}

/// Mutable traversal bookkeeping, owned by the run.
#[derive(Default)]
struct RunState {
    loop_counters: HashMap<String, u32>,
    executed: u32,
}

struct Invocation {
    selected_edge: Option<String>,
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ExecutionError>> + Send + 'a>>;

impl ExecutionTask {
    #[tracing::instrument(skip_all, fields(execution_id = %self.execution_id, workflow_id = %self.workflow.id))]
    async fn run(self) -> ExecutionResult {
        info!("execution started");
        let outcome = self.drive().await;
        let result = match outcome {
            Ok(()) => {
                info!("execution completed");
                self.finish(ExecutionStatus::Completed, None).await
            }
            Err(ExecutionError::Cancelled) => {
                info!("execution cancelled");
                self.finish(ExecutionStatus::Cancelled, Some(ErrorRecord::from(&ExecutionError::Cancelled)))
                    .await
            }
            Err(e) => {
                error!(error = %e, "execution failed");
                self.finish(ExecutionStatus::Failed, Some(ErrorRecord::from(&e)))
                    .await
            }
        };
        // Keep the snapshot readable for the retention window, then drop it
        // together with the state slot.
        self.state.schedule_cleanup(self.execution_id);
        let executions = Arc::clone(&self.executions);
        let execution_id = self.execution_id;
        let retention = self.config.state_retention();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            executions.write().await.remove(&execution_id);
        });
        result
    }

    /// The top-level cursor loop.
    async fn drive(&self) -> Result<(), ExecutionError> {
        let mut rs = RunState::default();
        let mut cursor = 0usize;

        while cursor < self.workflow.nodes.len() {
            if self.handle.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            let node = &self.workflow.nodes[cursor];

            let iteration = if node.is_loop_node {
                let count = rs.loop_counters.entry(node.unique_id.clone()).or_insert(0);
                *count += 1;
                if *count > self.config.max_loop_iterations {
                    return Err(ExecutionError::LoopLimitExceeded {
                        node_id: node.node_id.clone(),
                        limit: self.config.max_loop_iterations,
                    });
                }
                Some(*count)
            } else {
                None
            };

            let invocation = self.invoke_node(node, iteration, &mut rs).await?;

            let next = match &invocation.selected_edge {
                None => cursor + 1,
                Some(edge_name) => {
                    debug!(node_id = %node.node_id, edge = %edge_name, "edge selected");
                    match node.edges.get(edge_name).and_then(|d| d.route.as_ref()) {
                        // No route defined: loop nodes re-enter, regular
                        // nodes fall through.
                        None if node.is_loop_node => cursor,
                        None => cursor + 1,
                        // A regular node's simple edge to a top-level node
                        // is a pure cursor jump.
                        Some(ParsedEdge::Simple { target }) if !node.is_loop_node => {
                            match self.find_top_level(target) {
                                Some(index) => index,
                                None => {
                                    self.side_call(target, 1, &mut rs).await?;
                                    cursor + 1
                                }
                            }
                        }
                        Some(route) => {
                            self.resolve_route(route, 1, &mut rs).await?;
                            if node.is_loop_node {
                                cursor
                            } else {
                                cursor + 1
                            }
                        }
                    }
                }
            };

            self.enforce_state_budget().await?;

            // Leaving a loop node's scope resets its counter.
            if next != cursor && node.is_loop_node {
                rs.loop_counters.remove(&node.unique_id);
            }
            cursor = next;
        }
        Ok(())
    }

    /// Invoke one node occurrence: build its context, call it under the
    /// per-node timeout, evaluate the returned edge map, write state back
    /// and record the result.
    async fn invoke_node(
        &self,
        node: &ParsedNode,
        iteration: Option<u32>,
        rs: &mut RunState,
    ) -> Result<Invocation, ExecutionError> {
        rs.executed += 1;
        if rs.executed > self.config.max_node_executions {
            return Err(ExecutionError::ResourceExceeded(format!(
                "node execution budget of {} exhausted",
                self.config.max_node_executions
            )));
        }

        let started_at = Utc::now();
        let instance = self
            .registry
            .instantiate(&node.node_id)
            .map_err(|_| ExecutionError::NodeNotFound(node.node_id.clone()))?;

        // Edge context is consumed by exactly one invocation.
        let edge_context = self
            .state
            .take_edge_context(self.execution_id)
            .await
            .map_err(|_| ExecutionError::ExecutionNotFound(self.execution_id))?;
        let current = self
            .state
            .get_state(self.execution_id)
            .await
            .map_err(|_| ExecutionError::ExecutionNotFound(self.execution_id))?;

        let mut inputs = current.clone();
        if let Some(edge_context) = edge_context {
            deep_merge(&mut inputs, edge_context);
        }
        inputs.insert(
            NODE_CONFIG_KEY.to_string(),
            JsonValue::Object(node.config.clone()),
        );

        let mut ctx = ExecutionContext {
            state: current,
            inputs,
            workflow_id: self.workflow.id.clone(),
            node_id: node.raw_node_id.clone(),
            execution_id: self.execution_id,
            iteration,
        };

        let config_value = JsonValue::Object(node.config.clone());
        let timeout_ms = node
            .config
            .get("timeout")
            .and_then(JsonValue::as_u64)
            .unwrap_or(self.config.default_timeout_ms);

        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            instance.execute(&mut ctx, &config_value),
        )
        .await;

        // A result arriving after cancellation is discarded.
        if self.handle.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let failure = match outcome {
            Err(_) => ExecutionError::NodeTimeout {
                node_id: node.node_id.clone(),
                timeout_ms,
            },
            Ok(Err(e)) => ExecutionError::NodeFailed {
                node_id: node.node_id.clone(),
                reason: format!("{e:#}"),
            },
            Ok(Ok(edge_map)) => {
                let mut selected: Option<(String, JsonValue)> = None;
                let mut taken = 0usize;
                for (name, value) in edge_map.into_entries() {
                    if let Some(data) = value.evaluate() {
                        taken += 1;
                        if selected.is_none() {
                            selected = Some((name, data));
                        }
                    }
                }
                if taken > 1 {
                    warn!(
                        node_id = %node.node_id,
                        taken, "node returned multiple taken edges; first wins"
                    );
                }

                if let Some((_, JsonValue::Object(data))) = &selected {
                    self.state
                        .set_edge_context(self.execution_id, data.clone())
                        .await
                        .map_err(|_| ExecutionError::ExecutionNotFound(self.execution_id))?;
                }

                self.state
                    .replace_state(self.execution_id, ctx.state.clone())
                    .await
                    .map_err(|_| ExecutionError::ExecutionNotFound(self.execution_id))?;

                let selected_edge = selected.map(|(name, _)| name);
                self.record(NodeExecution {
                    node_id: node.raw_node_id.clone(),
                    status: ExecutionStatus::Completed,
                    started_at,
                    finished_at: Some(Utc::now()),
                    selected_edge: selected_edge.clone(),
                    error: None,
                })
                .await;
                return Ok(Invocation { selected_edge });
            }
        };

        // Failure path: offer the node's `error` edge before giving up.
        // State mutations from the failed call are discarded.
        let message = failure.to_string();
        error!(node_id = %node.node_id, error = %message, "node failed");
        self.record(NodeExecution {
            node_id: node.raw_node_id.clone(),
            status: ExecutionStatus::Failed,
            started_at,
            finished_at: Some(Utc::now()),
            selected_edge: None,
            error: Some(message.clone()),
        })
        .await;

        let routable = matches!(
            node.edges.get("error"),
            Some(EdgeDefinition {
                route: Some(ParsedEdge::Simple { .. }),
                ..
            })
        );
        if routable {
            let mut data = JsonMap::new();
            data.insert("error".to_string(), JsonValue::from(message));
            self.state
                .set_edge_context(self.execution_id, data)
                .await
                .map_err(|_| ExecutionError::ExecutionNotFound(self.execution_id))?;
            return Ok(Invocation {
                selected_edge: Some("error".to_string()),
            });
        }
        Err(failure)
    }

    /// Top-level index for a node identifier reference, loop suffix
    /// stripped.
    fn find_top_level(&self, name: &str) -> Option<usize> {
        self.workflow.index_of(strip_loop_reference(name).0)
    }

    /// In-line execution of a registered node referenced by name; does not
    /// move the cursor. A loop-suffixed reference runs with loop semantics.
    async fn side_call(
        &self,
        target: &str,
        depth: usize,
        rs: &mut RunState,
    ) -> Result<(), ExecutionError> {
        let (base, is_loop) = strip_loop_reference(target);
        let mut node = ParsedNode::reference(base, 0);
        if is_loop {
            node.raw_node_id = target.to_string();
            node.is_loop_node = true;
            return self.execute_nested(&node, depth, rs).await;
        }
        self.invoke_node(&node, None, rs).await.map(|_| ())
    }

    /// Act on a resolved edge. Recursion is depth-tracked against
    /// `max_nested_depth`.
    fn resolve_route<'a>(
        &'a self,
        route: &'a ParsedEdge,
        depth: usize,
        rs: &'a mut RunState,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            if depth > self.config.max_nested_depth {
                return Err(ExecutionError::NestingLimitExceeded {
                    limit: self.config.max_nested_depth,
                });
            }
            match route {
                ParsedEdge::Simple { target } => match self.find_top_level(target) {
                    Some(index) => {
                        self.execute_nested(&self.workflow.nodes[index], depth, rs)
                            .await
                    }
                    None => self.side_call(target, depth, rs).await,
                },
                ParsedEdge::Sequence { items } => {
                    for item in items {
                        match item {
                            SequenceItem::Reference(name) => match self.find_top_level(name) {
                                Some(index) => {
                                    self.execute_nested(&self.workflow.nodes[index], depth, rs)
                                        .await?
                                }
                                None => self.side_call(name, depth, rs).await?,
                            },
                            SequenceItem::Node(nested) => {
                                self.execute_nested(nested, depth, rs).await?
                            }
                        }
                    }
                    Ok(())
                }
                ParsedEdge::Nested { node } => self.execute_nested(node, depth, rs).await,
            }
        })
    }

    /// Execute a node in-line with its own edge logic. A nested loop node
    /// runs its own loop until an iteration returns no defined edge or the
    /// iteration cap trips.
    fn execute_nested<'a>(
        &'a self,
        node: &'a ParsedNode,
        depth: usize,
        rs: &'a mut RunState,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            if depth > self.config.max_nested_depth {
                return Err(ExecutionError::NestingLimitExceeded {
                    limit: self.config.max_nested_depth,
                });
            }
            if node.is_loop_node {
                let mut iterations = 0u32;
                loop {
                    if self.handle.cancel.is_cancelled() {
                        return Err(ExecutionError::Cancelled);
                    }
                    iterations += 1;
                    if iterations > self.config.max_loop_iterations {
                        return Err(ExecutionError::LoopLimitExceeded {
                            node_id: node.node_id.clone(),
                            limit: self.config.max_loop_iterations,
                        });
                    }
                    let invocation = self.invoke_node(node, Some(iterations), rs).await?;
                    let Some(edge_name) = invocation.selected_edge else {
                        break;
                    };
                    let Some(definition) = node.edges.get(&edge_name) else {
                        break;
                    };
                    if let Some(route) = &definition.route {
                        self.resolve_route(route, depth + 1, rs).await?;
                    }
                }
                Ok(())
            } else {
                let invocation = self.invoke_node(node, None, rs).await?;
                if let Some(edge_name) = invocation.selected_edge {
                    if let Some(route) = node.edges.get(&edge_name).and_then(|d| d.route.as_ref())
                    {
                        self.resolve_route(route, depth + 1, rs).await?;
                    }
                }
                Ok(())
            }
        })
    }

    async fn record(&self, entry: NodeExecution) {
        let state = self
            .state
            .get_state(self.execution_id)
            .await
            .unwrap_or_default();
        let size = serde_json::to_vec(&state).map(|v| v.len()).unwrap_or(0);
        let mut snapshot = self.handle.snapshot.lock().await;
        snapshot.metrics.executed_nodes += 1;
        snapshot.metrics.state_size_bytes = size;
        snapshot.final_state = state;
        snapshot.node_executions.push(entry);
    }

    async fn enforce_state_budget(&self) -> Result<(), ExecutionError> {
        let size = self.handle.snapshot.lock().await.metrics.state_size_bytes;
        if size > self.config.max_state_size_bytes {
            return Err(ExecutionError::ResourceExceeded(format!(
                "serialized state is {size} bytes, budget is {}",
                self.config.max_state_size_bytes
            )));
        }
        Ok(())
    }

    async fn finish(&self, status: ExecutionStatus, error: Option<ErrorRecord>) -> ExecutionResult {
        let final_state = self
            .state
            .get_state(self.execution_id)
            .await
            .unwrap_or_default();
        let mut snapshot = self.handle.snapshot.lock().await;
        snapshot.status = status;
        snapshot.error = error;
        snapshot.final_state = final_state;
        let end = Utc::now();
        snapshot.end_time = Some(end);
        snapshot.metrics.duration_ms = (end - snapshot.start_time)
            .num_milliseconds()
            .max(0) as u64;
        snapshot.clone()
    }
}
