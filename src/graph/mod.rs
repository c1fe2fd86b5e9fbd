//! Workflow graph data model.
//!
//! A [`Graph`] is an immutable description of typed [`Node`]s wired together
//! by [`Edge`]s. The caller owns the graph; the scheduler only reads it.
//! Structural validation (cycles, dangling references, unknown types) lives
//! in [`topology`] and runs exactly once, before any node executes.

pub mod topology;

pub use topology::{GraphError, MissingReference, Topology};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the implicit single output slot.
pub const DEFAULT_SLOT: &str = "output";

fn default_slot() -> String {
    DEFAULT_SLOT.to_string()
}

fn default_cacheable() -> bool {
    true
}

/// A typed unit of work within a [`Graph`].
///
/// `kind` is the registry key resolving to the node's behavior. Typed
/// property literals live in `properties`; behaviors that accept unknown
/// extra fields carry them separately in `dynamic_properties`. `parent`
/// marks containment in a Loop/Group scope.
///
/// # Examples
///
/// ```
/// use loomflow::graph::Node;
/// use serde_json::json;
///
/// let node = Node::new("add_1", "test.Add").with_property("b", json!(1));
/// assert_eq!(node.properties["b"], json!(1));
/// assert!(node.cacheable);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: FxHashMap<String, Value>,
    #[serde(default)]
    pub dynamic_properties: FxHashMap<String, Value>,
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            properties: FxHashMap::default(),
            dynamic_properties: FxHashMap::default(),
            cacheable: true,
            parent: None,
        }
    }

    /// Set a property literal.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Set a dynamic (schema-less) property literal.
    #[must_use]
    pub fn with_dynamic_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.dynamic_properties.insert(name.into(), value);
        self
    }

    /// Place this node inside the scope of a Loop/Group node.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Opt this node out of result reuse.
    #[must_use]
    pub fn not_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

/// A binding from one node's output slot to another node's input field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    #[serde(default = "default_slot")]
    pub source_slot: String,
    pub target: String,
    pub target_field: String,
}

impl Edge {
    /// Edge from `source`'s default `"output"` slot.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_slot: default_slot(),
            target: target.into(),
            target_field: target_field.into(),
        }
    }

    /// Select a named output slot on the source node.
    #[must_use]
    pub fn from_slot(mut self, slot: impl Into<String>) -> Self {
        self.source_slot = slot.into();
        self
    }
}

/// Immutable description of a workflow: nodes plus edges.
///
/// Construction is additive only; validation happens in
/// [`Graph::validate`](topology) against a node registry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    #[must_use]
    pub fn add_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges targeting the given node.
    pub fn edges_into<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.target == node_id)
    }
}
