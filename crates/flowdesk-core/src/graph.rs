// Workflow graph and document types
//
// Nodes live in an id-keyed arena and edges are plain (source, target) id
// pairs; nothing holds a reference to another node. On the wire nodes are a
// JSON list, in memory they are a BTreeMap so iteration order is stable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Identifier of a stored workflow, assigned by the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub i64);

impl WorkflowId {
    /// Next id from a process-wide sequence (used by in-memory stores)
    pub fn new() -> Self {
        static NEXT: AtomicI64 = AtomicI64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for WorkflowId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl FromStr for WorkflowId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Identifier of a node inside a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Optimistic-concurrency version counter assigned by the remote store
///
/// A write is accepted only when the submitted version equals the stored one;
/// every accepted write yields a strictly greater version.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LockVersion(pub u64);

impl LockVersion {
    /// Version the remote store assigns to a newly created document
    pub const INITIAL: LockVersion = LockVersion(1);

    pub fn get(self) -> u64 {
        self.0
    }

    /// The version that follows this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LockVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// On-canvas position of a node (presentation only)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A single configurable step of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,

    /// Step type (e.g. "agent", "tool", "condition")
    #[serde(rename = "type")]
    pub node_type: String,

    /// Opaque configuration payload edited through the config panels
    #[serde(default)]
    pub config: serde_json::Value,

    /// Canvas position; persisted but not part of the semantic graph
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    /// Rendering hints (size, selection, collapsed state...)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub view: serde_json::Value,
}

impl GraphNode {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: serde_json::Value::Null,
            position: None,
            view: serde_json::Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Position::new(x, y));
        self
    }

    pub fn with_view(mut self, view: serde_json::Value) -> Self {
        self.view = view;
        self
    }

    /// Human-readable label, taken from `config.label` when present
    pub fn label(&self) -> String {
        self.config
            .get("label")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Directed connection between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: NodeId,
    pub target: NodeId,
}

impl GraphEdge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// The semantic workflow graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default, with = "nodes_as_list")]
    nodes: BTreeMap<NodeId, GraphNode>,

    #[serde(default)]
    edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node (builder style); replaces any node with the same id
    pub fn with_node(mut self, node: GraphNode) -> Self {
        self.insert_node(node);
        self
    }

    /// Add an edge (builder style)
    pub fn with_edge(mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        self.connect(source, target);
        self
    }

    /// Insert or replace a node, returning the previous one
    pub fn insert_node(&mut self, node: GraphNode) -> Option<GraphNode> {
        self.nodes.insert(node.id.clone(), node)
    }

    /// Remove a node and every edge touching it
    pub fn remove_node(&mut self, id: &NodeId) -> Option<GraphNode> {
        let removed = self.nodes.remove(id);
        if removed.is_some() {
            self.edges.retain(|e| &e.source != id && &e.target != id);
        }
        removed
    }

    pub fn connect(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.edges.push(GraphEdge::new(source, target));
    }

    pub fn node(&self, id: &NodeId) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut GraphNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// The editor's local copy of a stored workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    /// None until the document has been stored for the first time
    pub id: Option<WorkflowId>,
    pub name: String,
    pub graph: WorkflowGraph,
    pub lock_version: LockVersion,
}

impl WorkflowDocument {
    /// A brand-new document that has never been saved
    pub fn draft(name: impl Into<String>, graph: WorkflowGraph) -> Self {
        Self {
            id: None,
            name: name.into(),
            graph,
            lock_version: LockVersion::default(),
        }
    }

    pub fn has_identity(&self) -> bool {
        self.id.is_some()
    }
}

/// A workflow as returned by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub name: String,
    #[serde(alias = "configuration")]
    pub graph: WorkflowGraph,
    pub lock_version: LockVersion,
}

impl From<WorkflowRecord> for WorkflowDocument {
    fn from(record: WorkflowRecord) -> Self {
        Self {
            id: Some(record.id),
            name: record.name,
            graph: record.graph,
            lock_version: record.lock_version,
        }
    }
}

mod nodes_as_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{GraphNode, NodeId};

    pub fn serialize<S>(nodes: &BTreeMap<NodeId, GraphNode>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(nodes.values())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<NodeId, GraphNode>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Vec::<GraphNode>::deserialize(deserializer)?;
        let mut nodes = BTreeMap::new();
        for node in list {
            let id = node.id.clone();
            if nodes.insert(id.clone(), node).is_some() {
                return Err(serde::de::Error::custom(format!("duplicate node id `{id}`")));
            }
        }
        Ok(nodes)
    }
}
