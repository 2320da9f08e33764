//! Workflow document parser and validator.
//!
//! Converts a raw JSON document into a [`ParsedWorkflow`] with resolved
//! references, or a [`ValidationResult`] describing why it was rejected.
//! Document key order is semantic (`serde_json` runs with
//! `preserve_order`): the first key of a node-block is the node
//! identifier, and the map form of `workflow` executes in key order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use common::types::{
    EdgeDefinition, JsonMap, JsonValue, ParsedEdge, ParsedNode, ParsedWorkflow, SequenceItem,
    ValidationCode, ValidationIssue, ValidationResult, LOOP_SUFFIX, STATE_SETTER_NODE_ID,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::nodes::{is_state_setter_key, is_valid_state_path};
use crate::registry::NodeRegistry;

lazy_static! {
    static ref DOCUMENT_ID_RE: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("document id pattern is a valid regex");
    static ref SEMVER_RE: Regex =
        Regex::new(r"^\d+\.\d+\.\d+$").expect("semver pattern is a valid regex");
}

/// Parses workflow documents against a node registry.
pub struct WorkflowParser {
    registry: Arc<NodeRegistry>,
    max_depth: usize,
}

impl WorkflowParser {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            max_depth: common::config::MAX_NESTED_DEPTH,
        }
    }

    /// Decode UTF-8 JSON text and parse it.
    pub fn parse_str(&self, text: &str) -> Result<ParsedWorkflow, ValidationResult> {
        let document: JsonValue = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                return Err(ValidationResult::from_issues(vec![ValidationIssue::error(
                    "",
                    ValidationCode::InvalidSchema,
                    format!("invalid JSON: {e}"),
                )]))
            }
        };
        self.parse(&document)
    }

    /// Parse an already-decoded document.
    pub fn parse(&self, document: &JsonValue) -> Result<ParsedWorkflow, ValidationResult> {
        let mut run = ParseRun::new(&self.registry, self.max_depth);
        let workflow = run.parse_document(document);
        let result = ValidationResult::from_issues(run.issues);
        match workflow {
            Some(workflow) if result.valid => {
                for issue in result.warnings() {
                    warn!(path = %issue.path, code = ?issue.code, "{}", issue.message);
                }
                Ok(workflow)
            }
            _ => Err(result),
        }
    }

    /// Validate without keeping the AST.
    pub fn validate(&self, document: &JsonValue) -> ValidationResult {
        let mut run = ParseRun::new(&self.registry, self.max_depth);
        run.parse_document(document);
        ValidationResult::from_issues(run.issues)
    }
}

struct ParseRun<'a> {
    registry: &'a NodeRegistry,
    issues: Vec<ValidationIssue>,
    counter: u32,
    top_level_ids: HashSet<String>,
    max_depth: usize,
}

impl<'a> ParseRun<'a> {
    fn new(registry: &'a NodeRegistry, max_depth: usize) -> Self {
        Self {
            registry,
            issues: Vec::new(),
            counter: 0,
            top_level_ids: HashSet::new(),
            max_depth,
        }
    }

    fn error(&mut self, path: &str, code: ValidationCode, message: impl Into<String>) {
        self.issues.push(ValidationIssue::error(path, code, message));
    }

    fn warning(&mut self, path: &str, code: ValidationCode, message: impl Into<String>) {
        self.issues
            .push(ValidationIssue::warning(path, code, message));
    }

    fn next_unique(&mut self, base: &str) -> String {
        self.counter += 1;
        format!("{base}_{}", self.counter)
    }

    fn parse_document(&mut self, document: &JsonValue) -> Option<ParsedWorkflow> {
        let Some(root) = document.as_object() else {
            self.error("", ValidationCode::InvalidSchema, "document must be an object");
            return None;
        };

        let id = self.parse_id(root);
        let name = self.parse_name(root);
        let version = self.parse_version(root);
        let initial_state = self.parse_initial_state(root);
        let blocks = self.collect_blocks(root)?;

        // Top-level ids must be known before edge-shape classification can
        // recognize string values that name sibling nodes.
        for (primary, _) in &blocks {
            if !is_state_setter_key(primary) {
                self.top_level_ids
                    .insert(strip_loop_suffix(primary).0.to_string());
            }
        }

        let mut nodes = Vec::new();
        for (index, (_, block)) in blocks.iter().enumerate() {
            let path = format!("workflow[{index}]");
            if let Some(node) = self.parse_block(block, 0, None, &path) {
                nodes.push(node);
            }
        }

        if nodes.is_empty() {
            self.error(
                "workflow",
                ValidationCode::EmptyWorkflow,
                "workflow must contain at least one node",
            );
        }

        self.check_references(&nodes);
        self.check_cycles(&nodes);
        self.check_configs(&nodes);

        Some(ParsedWorkflow {
            id: id?,
            name: name?,
            version,
            initial_state,
            nodes,
        })
    }

    fn parse_id(&mut self, root: &JsonMap) -> Option<String> {
        match root.get("id").and_then(JsonValue::as_str) {
            Some(id) if (1..=64).contains(&id.len()) && DOCUMENT_ID_RE.is_match(id) => {
                Some(id.to_string())
            }
            Some(id) => {
                self.error(
                    "id",
                    ValidationCode::InvalidId,
                    format!("'{id}' must match [A-Za-z0-9][A-Za-z0-9_-]* and be 1-64 chars"),
                );
                None
            }
            None => {
                self.error("id", ValidationCode::InvalidId, "missing required 'id'");
                None
            }
        }
    }

    fn parse_name(&mut self, root: &JsonMap) -> Option<String> {
        match root.get("name").and_then(JsonValue::as_str) {
            Some(name) if (1..=256).contains(&name.len()) => Some(name.to_string()),
            Some(_) => {
                self.error(
                    "name",
                    ValidationCode::InvalidName,
                    "'name' must be 1-256 chars",
                );
                None
            }
            None => {
                self.error("name", ValidationCode::InvalidName, "missing required 'name'");
                None
            }
        }
    }

    fn parse_version(&mut self, root: &JsonMap) -> Option<String> {
        let version = root.get("version")?;
        match version.as_str() {
            Some(v) if SEMVER_RE.is_match(v) => Some(v.to_string()),
            _ => {
                self.error(
                    "version",
                    ValidationCode::InvalidVersion,
                    format!("'{version}' is not MAJOR.MINOR.PATCH"),
                );
                None
            }
        }
    }

    fn parse_initial_state(&mut self, root: &JsonMap) -> Option<JsonMap> {
        match root.get("initialState") {
            None => None,
            Some(JsonValue::Object(map)) => Some(map.clone()),
            Some(_) => {
                self.error(
                    "initialState",
                    ValidationCode::InvalidSchema,
                    "'initialState' must be an object",
                );
                None
            }
        }
    }

    /// Normalize both document forms into `(primary_key, block)` pairs: the
    /// array form yields its node-blocks verbatim, the map form yields one
    /// single-entry block per key, in key order.
    fn collect_blocks(&mut self, root: &JsonMap) -> Option<Vec<(String, JsonMap)>> {
        match root.get("workflow") {
            Some(JsonValue::Array(items)) => {
                let mut blocks = Vec::new();
                for (index, item) in items.iter().enumerate() {
                    match item.as_object() {
                        Some(block) if !block.is_empty() => {
                            let primary = block.keys().next().cloned().unwrap_or_default();
                            blocks.push((primary, block.clone()));
                        }
                        _ => self.error(
                            &format!("workflow[{index}]"),
                            ValidationCode::InvalidSchema,
                            "node-block must be a non-empty object",
                        ),
                    }
                }
                Some(blocks)
            }
            Some(JsonValue::Object(map)) => Some(
                map.iter()
                    .map(|(key, value)| {
                        let mut block = JsonMap::new();
                        block.insert(key.clone(), value.clone());
                        (key.clone(), block)
                    })
                    .collect(),
            ),
            Some(_) => {
                self.error(
                    "workflow",
                    ValidationCode::InvalidSchema,
                    "'workflow' must be an array of node-blocks or a map of node-id to config",
                );
                None
            }
            None => {
                self.error(
                    "workflow",
                    ValidationCode::InvalidSchema,
                    "missing required 'workflow'",
                );
                None
            }
        }
    }

    /// Parse one node-block. The first key (document order) is the node
    /// identifier or state-setter path; any following keys must be edge
    /// declarations.
    fn parse_block(
        &mut self,
        block: &JsonMap,
        depth: usize,
        parent: Option<&str>,
        path: &str,
    ) -> Option<ParsedNode> {
        if depth > self.max_depth {
            self.error(
                path,
                ValidationCode::NestingTooDeep,
                format!("nesting exceeds the maximum depth of {}", self.max_depth),
            );
            return None;
        }

        let mut entries = block.iter();
        let (primary_key, primary_value) = entries.next()?;

        let mut node = if is_state_setter_key(primary_key) {
            self.parse_setter_node(primary_key, primary_value, depth, parent, path)?
        } else {
            self.parse_regular_node(primary_key, primary_value, depth, parent, path)?
        };

        // Keys beside the node key are edge declarations at block level
        // (e.g. `{"flaky": {}, "error?": "fallback"}`).
        let unique_id = node.unique_id.clone();
        for (key, value) in entries {
            let edge_path = format!("{path}.{key}");
            if !self.looks_like_edge(&node.node_id, key, value) {
                self.error(
                    &edge_path,
                    ValidationCode::InvalidSchema,
                    format!("unexpected key '{key}' beside node '{primary_key}'"),
                );
                continue;
            }
            self.insert_edge(&mut node, key, value, depth, &unique_id, &edge_path);
        }
        node.children = collect_children(&node.edges);
        Some(node)
    }

    fn parse_regular_node(
        &mut self,
        key: &str,
        value: &JsonValue,
        depth: usize,
        parent: Option<&str>,
        path: &str,
    ) -> Option<ParsedNode> {
        let (base, is_loop) = strip_loop_suffix(key);
        if base.is_empty() {
            self.error(
                path,
                ValidationCode::InvalidSchema,
                "node identifier must not be empty",
            );
            return None;
        }
        if base.ends_with('?') {
            self.error(
                path,
                ValidationCode::InvalidSchema,
                format!("node-block must begin with a node identifier, got edge key '{key}'"),
            );
            return None;
        }
        let unique_id = self.next_unique(base);
        let mut node = ParsedNode {
            node_id: base.to_string(),
            raw_node_id: key.to_string(),
            is_loop_node: is_loop,
            config: JsonMap::new(),
            edges: HashMap::new(),
            children: Vec::new(),
            depth,
            unique_id: unique_id.clone(),
            parent: parent.map(str::to_string),
        };

        match value {
            JsonValue::Object(body) => {
                for (k, v) in body {
                    let edge_path = format!("{path}.{k}");
                    if self.looks_like_edge(base, k, v) {
                        self.insert_edge(&mut node, k, v, depth, &unique_id, &edge_path);
                    } else {
                        node.config.insert(k.clone(), v.clone());
                    }
                }
            }
            JsonValue::Null => {}
            _ => {
                self.error(
                    path,
                    ValidationCode::InvalidSchema,
                    format!("config for node '{key}' must be an object"),
                );
                return None;
            }
        }
        Some(node)
    }

    /// Build the synthetic `__state_setter__` node for a `$.path` block.
    fn parse_setter_node(
        &mut self,
        key: &str,
        value: &JsonValue,
        depth: usize,
        parent: Option<&str>,
        path: &str,
    ) -> Option<ParsedNode> {
        if !is_valid_state_path(key) {
            self.error(
                path,
                ValidationCode::InvalidStateSetterSyntax,
                format!("'{key}' is not a valid state path"),
            );
            return None;
        }
        let unique_id = self.next_unique(STATE_SETTER_NODE_ID);
        let mut node = ParsedNode {
            node_id: STATE_SETTER_NODE_ID.to_string(),
            raw_node_id: key.to_string(),
            is_loop_node: false,
            config: JsonMap::new(),
            edges: HashMap::new(),
            children: Vec::new(),
            depth,
            unique_id: unique_id.clone(),
            parent: parent.map(str::to_string),
        };

        // Setter blocks recognize only `?`-suffixed keys and the setter's
        // declared `success` output as edges, so shorthand bodies survive
        // verbatim.
        let (payload, explicit) = match value {
            JsonValue::Object(body) => {
                let mut rest = JsonMap::new();
                for (k, v) in body {
                    if k.ends_with('?') || k == "success" {
                        let edge_path = format!("{path}.{k}");
                        self.insert_edge(&mut node, k, v, depth, &unique_id, &edge_path);
                    } else {
                        rest.insert(k.clone(), v.clone());
                    }
                }
                match rest.get("value") {
                    Some(v) => (v.clone(), true),
                    None => (JsonValue::Object(rest), false),
                }
            }
            other => (other.clone(), false),
        };

        node.config.insert("path".to_string(), JsonValue::from(key));
        node.config.insert("value".to_string(), payload);
        node.config
            .insert("explicit".to_string(), JsonValue::from(explicit));
        node.children = collect_children(&node.edges);
        Some(node)
    }

    /// A key is an edge declaration iff it ends with `?`, names a declared
    /// output of the registered node type, or its value has a routing
    /// shape.
    fn looks_like_edge(&self, node_id: &str, key: &str, value: &JsonValue) -> bool {
        if key.ends_with('?') {
            return true;
        }
        if let Ok(metadata) = self.registry.metadata(node_id) {
            if metadata.outputs.iter().any(|o| o == key) {
                return true;
            }
        }
        self.is_route_shaped(value)
    }

    fn is_route_shaped(&self, value: &JsonValue) -> bool {
        match value {
            JsonValue::String(target) => {
                self.top_level_ids
                    .contains(strip_loop_suffix(target).0)
            }
            JsonValue::Array(items) => {
                !items.is_empty() && items.iter().all(|item| self.is_route_item(item))
            }
            JsonValue::Object(map) if map.len() == 1 => {
                let key = map.keys().next().map(String::as_str).unwrap_or_default();
                is_state_setter_key(key) || self.names_known_node(key)
            }
            _ => false,
        }
    }

    fn is_route_item(&self, item: &JsonValue) -> bool {
        match item {
            JsonValue::String(name) => self.names_known_node(name),
            JsonValue::Object(map) if map.len() == 1 => {
                let key = map.keys().next().map(String::as_str).unwrap_or_default();
                is_state_setter_key(key) || self.names_known_node(key)
            }
            _ => false,
        }
    }

    fn names_known_node(&self, key: &str) -> bool {
        let (base, _) = strip_loop_suffix(key);
        self.top_level_ids.contains(base) || self.registry.has(base)
    }

    fn insert_edge(
        &mut self,
        node: &mut ParsedNode,
        key: &str,
        value: &JsonValue,
        depth: usize,
        parent_uid: &str,
        path: &str,
    ) {
        let (name, optional) = match key.strip_suffix('?') {
            Some(stripped) => (stripped, true),
            None => (key, false),
        };
        if name.ends_with(LOOP_SUFFIX) {
            self.error(
                path,
                ValidationCode::InvalidEdge,
                format!("loop suffix is not allowed on edge name '{key}'"),
            );
            return;
        }
        // Lint: an edge recognized by shape that the registered node type
        // does not declare. The conventional `error` edge is exempt.
        if name != "error" {
            if let Ok(metadata) = self.registry.metadata(&node.node_id) {
                if !metadata.outputs.is_empty() && !metadata.outputs.iter().any(|o| o == name) {
                    self.warning(
                        path,
                        ValidationCode::UndeclaredEdge,
                        format!(
                            "edge '{name}' is not a declared output of node type '{}'",
                            node.node_id
                        ),
                    );
                }
            }
        }
        let route = self.parse_route_value(value, depth, parent_uid, path);
        node.edges
            .insert(name.to_string(), EdgeDefinition { route, optional });
    }

    fn parse_route_value(
        &mut self,
        value: &JsonValue,
        depth: usize,
        parent_uid: &str,
        path: &str,
    ) -> Option<ParsedEdge> {
        match value {
            // Declared without a routing value: pure fall-through.
            JsonValue::Null | JsonValue::Bool(_) => None,
            JsonValue::Object(map) if map.is_empty() => None,
            JsonValue::String(target) => Some(ParsedEdge::Simple {
                target: target.clone(),
            }),
            JsonValue::Array(items) => {
                let mut sequence = Vec::new();
                for (index, item) in items.iter().enumerate() {
                    let item_path = format!("{path}[{index}]");
                    match item {
                        JsonValue::String(name) => {
                            sequence.push(SequenceItem::Reference(name.clone()));
                        }
                        JsonValue::Object(block) => {
                            if let Some(node) =
                                self.parse_block(block, depth + 1, Some(parent_uid), &item_path)
                            {
                                sequence.push(SequenceItem::Node(Box::new(node)));
                            }
                        }
                        other => self.error(
                            &item_path,
                            ValidationCode::InvalidEdge,
                            format!(
                                "sequence item must be a node reference or node-block, got {other}"
                            ),
                        ),
                    }
                }
                Some(ParsedEdge::Sequence { items: sequence })
            }
            JsonValue::Object(block) => self
                .parse_block(block, depth + 1, Some(parent_uid), path)
                .map(|node| ParsedEdge::Nested {
                    node: Box::new(node),
                }),
            other => {
                self.error(
                    path,
                    ValidationCode::InvalidEdge,
                    format!("edge value must be a target, sequence or node-block, got {other}"),
                );
                None
            }
        }
    }

    /// Every `Simple` target and `Sequence` reference must name a top-level
    /// node of this workflow or a registered node type.
    fn check_references(&mut self, nodes: &[ParsedNode]) {
        let mut references = Vec::new();
        for node in nodes {
            collect_references(node, &mut references);
        }
        for (owner, target) in references {
            // References may carry the loop suffix; resolution strips it.
            let (base, _) = strip_loop_suffix(&target);
            if !self.top_level_ids.contains(base) && !self.registry.has(base) {
                self.error(
                    &owner,
                    ValidationCode::UnknownReference,
                    format!("'{target}' is neither a top-level node nor a registered node type"),
                );
            }
        }
    }

    /// Cycles in the static reference graph are rejected unless they pass
    /// through a loop node.
    fn check_cycles(&mut self, nodes: &[ParsedNode]) {
        let loop_ids: HashSet<String> = nodes
            .iter()
            .filter(|n| n.is_loop_node)
            .map(|n| n.node_id.clone())
            .collect();

        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        for node in nodes {
            let mut references = Vec::new();
            collect_references(node, &mut references);
            let targets: Vec<String> = references
                .into_iter()
                .map(|(_, target)| strip_loop_suffix(&target).0.to_string())
                .filter(|t| self.top_level_ids.contains(t.as_str()))
                .collect();
            graph.entry(node.node_id.clone()).or_default().extend(targets);
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut reported: HashSet<BTreeSet<String>> = HashSet::new();
        for node in nodes {
            let mut stack = Vec::new();
            self.cycle_dfs(
                &node.node_id,
                &graph,
                &loop_ids,
                &mut stack,
                &mut visited,
                &mut reported,
            );
        }
    }

    fn cycle_dfs(
        &mut self,
        id: &str,
        graph: &HashMap<String, Vec<String>>,
        loop_ids: &HashSet<String>,
        stack: &mut Vec<String>,
        visited: &mut HashSet<String>,
        reported: &mut HashSet<BTreeSet<String>>,
    ) {
        if let Some(position) = stack.iter().position(|n| n == id) {
            let cycle: Vec<String> = stack[position..].to_vec();
            if !cycle.iter().any(|n| loop_ids.contains(n)) {
                let key: BTreeSet<String> = cycle.iter().cloned().collect();
                if reported.insert(key) {
                    self.error(
                        id,
                        ValidationCode::CircularReference,
                        format!("cycle without a loop node: {}", cycle.join(" -> ")),
                    );
                }
            }
            return;
        }
        if visited.contains(id) {
            return;
        }
        stack.push(id.to_string());
        if let Some(targets) = graph.get(id).cloned() {
            for target in targets {
                self.cycle_dfs(&target, graph, loop_ids, stack, visited, reported);
            }
        }
        stack.pop();
        visited.insert(id.to_string());
    }

    /// Run `validate_config` for every occurrence of a registered node type.
    fn check_configs(&mut self, nodes: &[ParsedNode]) {
        for node in nodes {
            self.check_config_recursive(node);
        }
    }

    fn check_config_recursive(&mut self, node: &ParsedNode) {
        if let Ok(instance) = self.registry.instantiate(&node.node_id) {
            let config = JsonValue::Object(node.config.clone());
            if let Err(e) = instance.validate_config(&config) {
                self.error(
                    &node.unique_id,
                    ValidationCode::InvalidConfig,
                    format!("invalid config for '{}': {e}", node.raw_node_id),
                );
            }
        }
        for child in &node.children {
            self.check_config_recursive(child);
        }
    }
}

/// `(base, is_loop)` for a document node identifier.
fn strip_loop_suffix(key: &str) -> (&str, bool) {
    match key.strip_suffix(LOOP_SUFFIX) {
        Some(base) => (base, true),
        None => (key, false),
    }
}

fn collect_children(edges: &HashMap<String, EdgeDefinition>) -> Vec<ParsedNode> {
    let mut children = Vec::new();
    for definition in edges.values() {
        match &definition.route {
            Some(ParsedEdge::Nested { node }) => children.push((**node).clone()),
            Some(ParsedEdge::Sequence { items }) => {
                for item in items {
                    if let SequenceItem::Node(node) = item {
                        children.push((**node).clone());
                    }
                }
            }
            _ => {}
        }
    }
    children
}

/// All `(owner_unique_id, target)` references in a node's edge tree,
/// including those of nested nodes.
fn collect_references(node: &ParsedNode, out: &mut Vec<(String, String)>) {
    for definition in node.edges.values() {
        match &definition.route {
            Some(ParsedEdge::Simple { target }) => {
                out.push((node.unique_id.clone(), target.clone()));
            }
            Some(ParsedEdge::Sequence { items }) => {
                for item in items {
                    match item {
                        SequenceItem::Reference(name) => {
                            out.push((node.unique_id.clone(), name.clone()));
                        }
                        SequenceItem::Node(nested) => collect_references(nested, out),
                    }
                }
            }
            Some(ParsedEdge::Nested { node: nested }) => collect_references(nested, out),
            None => {}
        }
    }
}
