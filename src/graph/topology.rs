//! Structural validation and scope-aware topology.
//!
//! [`Graph::validate`] checks the graph against a [`NodeRegistry`] and
//! produces a [`Topology`]: per-scope membership, same-scope in-degrees and
//! dependent lists. Cycle detection considers only edges whose endpoints
//! share a scope — an interior node referencing its enclosing Loop's
//! per-iteration value is not a structural cycle.
//!
//! Validation has no side effects: on failure nothing has executed and
//! nothing was emitted.

use std::fmt;

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::registry::{NodeRegistry, NodeRole};

use super::Graph;

/// The edge reference that failed to resolve during validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MissingReference {
    Node { id: String },
    Slot { node_id: String, slot: String },
    Field { node_id: String, field: String },
}

impl fmt::Display for MissingReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node { id } => write!(f, "missing node `{id}`"),
            Self::Slot { node_id, slot } => {
                write!(f, "node `{node_id}` has no output slot `{slot}`")
            }
            Self::Field { node_id, field } => {
                write!(f, "node `{node_id}` has no input field `{field}`")
            }
        }
    }
}

/// Structural errors detected before any node executes.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("duplicate node id: {id}")]
    #[diagnostic(code(loomflow::graph::duplicate_node))]
    DuplicateNode { id: String },

    #[error("unknown node type: {kind}")]
    #[diagnostic(
        code(loomflow::graph::unknown_type),
        help("Register the node type before validating, or fix the `type` field.")
    )]
    UnknownType { kind: String },

    #[error("node {node_id} declares parent {parent}, which is not a Loop or Group node")]
    #[diagnostic(code(loomflow::graph::unknown_scope))]
    UnknownScope { node_id: String, parent: String },

    #[error("edge {edge_id}: {reference}")]
    #[diagnostic(code(loomflow::graph::dangling_edge))]
    DanglingEdge {
        edge_id: String,
        reference: MissingReference,
    },

    #[error("input field {field} on node {node_id} is bound by more than one edge")]
    #[diagnostic(code(loomflow::graph::duplicate_binding))]
    DuplicateBinding { node_id: String, field: String },

    #[error("cycle detected in {scope} scope")]
    #[diagnostic(
        code(loomflow::graph::cycle),
        help("Break the dependency cycle, or move the back-reference inside a Loop scope.")
    )]
    Cycle { scope: String },
}

/// Scope-aware adjacency derived from a validated [`Graph`].
///
/// A scope is identified by the id of its enclosing Loop/Group node; the
/// root scope is `None`. In-degrees and dependents count only edges whose
/// endpoints share a scope — cross-scope references are satisfied through
/// the result cache instead.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    members: FxHashMap<Option<String>, Vec<String>>,
    in_degree: FxHashMap<String, usize>,
    dependents: FxHashMap<String, Vec<String>>,
}

impl Topology {
    /// Node ids belonging to the given scope, in graph declaration order.
    #[must_use]
    pub fn scope_members(&self, scope: Option<&str>) -> &[String] {
        self.members
            .get(&scope.map(str::to_string))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All scope keys present in the graph (root scope included).
    pub fn scopes(&self) -> impl Iterator<Item = Option<&str>> {
        self.members.keys().map(Option::as_deref)
    }

    /// Number of distinct same-scope nodes this node waits on.
    #[must_use]
    pub fn in_degree(&self, node_id: &str) -> usize {
        self.in_degree.get(node_id).copied().unwrap_or(0)
    }

    /// Distinct same-scope nodes unblocked when this node completes.
    #[must_use]
    pub fn dependents(&self, node_id: &str) -> &[String] {
        self.dependents
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Graph {
    /// Validate structure against the registry and build the [`Topology`].
    ///
    /// Checks, in order: unique node ids, registered node types, scope
    /// containment, edge endpoint/slot/field resolution, single binding per
    /// input field, and per-scope acyclicity.
    pub fn validate(&self, registry: &NodeRegistry) -> Result<Topology, GraphError> {
        let mut ids = FxHashSet::default();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode {
                    id: node.id.clone(),
                });
            }
        }

        let mut behaviors = FxHashMap::default();
        for node in &self.nodes {
            let behavior = registry
                .get(&node.kind)
                .map_err(|_| GraphError::UnknownType {
                    kind: node.kind.clone(),
                })?;
            behaviors.insert(node.id.as_str(), behavior);
        }

        for node in &self.nodes {
            if let Some(parent) = &node.parent {
                let role = self
                    .node(parent)
                    .and_then(|p| behaviors.get(p.id.as_str()))
                    .map(|b| b.role());
                if !matches!(role, Some(NodeRole::Loop | NodeRole::Group)) {
                    return Err(GraphError::UnknownScope {
                        node_id: node.id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        let mut bound_fields = FxHashSet::default();
        for edge in &self.edges {
            let source = self.node(&edge.source).ok_or_else(|| GraphError::DanglingEdge {
                edge_id: edge.id.clone(),
                reference: MissingReference::Node {
                    id: edge.source.clone(),
                },
            })?;
            let target = self.node(&edge.target).ok_or_else(|| GraphError::DanglingEdge {
                edge_id: edge.id.clone(),
                reference: MissingReference::Node {
                    id: edge.target.clone(),
                },
            })?;

            let source_behavior = &behaviors[source.id.as_str()];
            if !source_behavior
                .outputs()
                .iter()
                .any(|slot| slot == &edge.source_slot)
            {
                return Err(GraphError::DanglingEdge {
                    edge_id: edge.id.clone(),
                    reference: MissingReference::Slot {
                        node_id: source.id.clone(),
                        slot: edge.source_slot.clone(),
                    },
                });
            }

            let target_behavior = &behaviors[target.id.as_str()];
            let declared = target_behavior
                .properties()
                .iter()
                .any(|p| p.name == edge.target_field);
            if !declared && !target_behavior.is_dynamic() {
                return Err(GraphError::DanglingEdge {
                    edge_id: edge.id.clone(),
                    reference: MissingReference::Field {
                        node_id: target.id.clone(),
                        field: edge.target_field.clone(),
                    },
                });
            }

            if !bound_fields.insert((edge.target.as_str(), edge.target_field.as_str())) {
                return Err(GraphError::DuplicateBinding {
                    node_id: edge.target.clone(),
                    field: edge.target_field.clone(),
                });
            }
        }

        let mut topology = Topology::default();
        for node in &self.nodes {
            topology
                .members
                .entry(node.parent.clone())
                .or_default()
                .push(node.id.clone());
            topology.in_degree.insert(node.id.clone(), 0);
        }

        let mut seen_pairs = FxHashSet::default();
        for edge in &self.edges {
            let source_scope = &self.node(&edge.source).expect("validated above").parent;
            let target_scope = &self.node(&edge.target).expect("validated above").parent;
            if source_scope != target_scope {
                continue;
            }
            if !seen_pairs.insert((edge.source.clone(), edge.target.clone())) {
                continue;
            }
            *topology.in_degree.get_mut(&edge.target).expect("indexed") += 1;
            topology
                .dependents
                .entry(edge.source.clone())
                .or_default()
                .push(edge.target.clone());
        }

        for (scope, members) in &topology.members {
            detect_cycle(scope.as_deref(), members, &topology)?;
        }

        Ok(topology)
    }
}

/// Kahn's algorithm over one scope's same-scope edges.
fn detect_cycle(
    scope: Option<&str>,
    members: &[String],
    topology: &Topology,
) -> Result<(), GraphError> {
    let member_set: FxHashSet<&str> = members.iter().map(String::as_str).collect();
    let mut degrees: FxHashMap<&str, usize> = members
        .iter()
        .map(|id| (id.as_str(), topology.in_degree(id)))
        .collect();
    let mut ready: Vec<&str> = members
        .iter()
        .map(String::as_str)
        .filter(|id| degrees[id] == 0)
        .collect();

    let mut processed = 0;
    while let Some(id) = ready.pop() {
        processed += 1;
        for dependent in topology.dependents(id) {
            if !member_set.contains(dependent.as_str()) {
                continue;
            }
            let degree = degrees.get_mut(dependent.as_str()).expect("member degree");
            *degree -= 1;
            if *degree == 0 {
                ready.push(dependent.as_str());
            }
        }
    }

    if processed != members.len() {
        return Err(GraphError::Cycle {
            scope: scope.unwrap_or("root").to_string(),
        });
    }
    Ok(())
}
