//! Built-in control behaviors.
//!
//! These are the only node types the engine itself ships: the scope
//! markers (`Loop`, `Group`), the per-iteration collector (`LoopOutput`)
//! and the job-result marker (`Output`). The catalogue of domain nodes is
//! registered by the hosting layer.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ProcessingContext;
use crate::graph::Node;
use crate::registry::{
    NodeBehavior, NodeError, NodeOutput, NodeRegistry, NodeRole, PropertySchema, ResolvedInputs,
};

pub const LOOP: &str = "loomflow.control.Loop";
pub const GROUP: &str = "loomflow.control.Group";
pub const LOOP_OUTPUT: &str = "loomflow.control.LoopOutput";
pub const OUTPUT: &str = "loomflow.control.Output";

/// Register the four control behaviors under their canonical type strings.
pub fn register_control_nodes(registry: &mut NodeRegistry) {
    registry.register(LOOP, LoopNode);
    registry.register(GROUP, GroupNode);
    registry.register(LOOP_OUTPUT, LoopOutputNode);
    registry.register(OUTPUT, OutputNode);
}

/// Iterates an input sequence over its interior scope; the accumulated
/// per-iteration values become its `"output"` in the outer scope.
pub struct LoopNode;

#[async_trait]
impl NodeBehavior for LoopNode {
    fn properties(&self) -> Vec<PropertySchema> {
        vec![PropertySchema::new("items").required()]
    }

    fn role(&self) -> NodeRole {
        NodeRole::Loop
    }

    async fn process(
        &self,
        node: &Node,
        _inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        // The scheduler intercepts Loop nodes; reaching process is a bug.
        Err(NodeError::Other(format!(
            "loop node {} invoked directly instead of through its scope",
            node.id
        )))
    }
}

/// Single-pass nested scope with no iteration semantics.
pub struct GroupNode;

#[async_trait]
impl NodeBehavior for GroupNode {
    fn properties(&self) -> Vec<PropertySchema> {
        Vec::new()
    }

    fn role(&self) -> NodeRole {
        NodeRole::Group
    }

    async fn process(
        &self,
        node: &Node,
        _inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        Err(NodeError::Other(format!(
            "group node {} invoked directly instead of through its scope",
            node.id
        )))
    }
}

/// Marks the value collected at the end of each Loop/Group iteration.
pub struct LoopOutputNode;

#[async_trait]
impl NodeBehavior for LoopOutputNode {
    fn properties(&self) -> Vec<PropertySchema> {
        vec![PropertySchema::new("input").required()]
    }

    fn role(&self) -> NodeRole {
        NodeRole::LoopOutput
    }

    async fn process(
        &self,
        _node: &Node,
        mut inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::Value(
            inputs.remove("input").unwrap_or(Value::Null),
        ))
    }
}

/// Designates a value as part of the job's final result.
///
/// The result key is the `name` property when set, the node id otherwise.
pub struct OutputNode;

#[async_trait]
impl NodeBehavior for OutputNode {
    fn properties(&self) -> Vec<PropertySchema> {
        vec![
            PropertySchema::new("name"),
            PropertySchema::new("value").required(),
        ]
    }

    fn role(&self) -> NodeRole {
        NodeRole::Output
    }

    async fn process(
        &self,
        _node: &Node,
        mut inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::Value(
            inputs.remove("value").unwrap_or(Value::Null),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_nodes_registered() {
        let registry = NodeRegistry::with_control_nodes();
        for kind in [LOOP, GROUP, LOOP_OUTPUT, OUTPUT] {
            assert!(registry.contains(kind), "missing {kind}");
        }
    }

    #[test]
    fn loop_declares_items() {
        let behavior = LoopNode;
        assert_eq!(behavior.required_inputs(), vec!["items".to_string()]);
        assert_eq!(
            behavior.outputs(),
            vec![crate::graph::DEFAULT_SLOT.to_string()]
        );
    }
}
