//! Shared setup helpers for integration tests.

use std::sync::Arc;

use loomflow::context::{MessageReceiver, ProcessingContext};
use loomflow::graph::Graph;
use loomflow::message::ProcessingMessage;
use loomflow::registry::NodeRegistry;
use loomflow::types::NodeStatus;

use super::nodes::{
    AddNode, ConstantNode, EchoDynamicNode, FailingNode, PanickingNode, ProgressNode, SplitNode,
};

/// Registry with the control behaviors plus the stateless test behaviors.
/// Stateful behaviors (counting, capture, cancelling) are registered per
/// test so their observers stay local.
pub fn test_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::with_control_nodes();
    registry.register("test.Constant", ConstantNode);
    registry.register("test.Add", AddNode);
    registry.register("test.Failing", FailingNode);
    registry.register("test.Panicking", PanickingNode);
    registry.register("test.Progress", ProgressNode);
    registry.register("test.Split", SplitNode);
    registry.register("test.Echo", EchoDynamicNode);
    registry
}

/// Context over the given graph with default device and isolated caches.
pub fn test_context(graph: Graph) -> ProcessingContext {
    ProcessingContext::new("job-under-test", "wf-under-test", Arc::new(graph))
}

/// Drain everything currently buffered.
pub fn drain(ctx: &ProcessingContext) -> Vec<ProcessingMessage> {
    let mut messages = Vec::new();
    while let Some(message) = ctx.try_pop_message() {
        messages.push(message);
    }
    messages
}

/// Drain a receiver handle until (and including) the terminal message.
pub fn drain_until_terminal(receiver: &MessageReceiver) -> Vec<ProcessingMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = receiver.pop() {
        let terminal = message.is_terminal();
        messages.push(message);
        if terminal {
            break;
        }
    }
    messages
}

/// Node status transitions for one node, in stream order.
pub fn statuses_for(messages: &[ProcessingMessage], node_id: &str) -> Vec<NodeStatus> {
    messages
        .iter()
        .filter_map(|message| match message {
            ProcessingMessage::NodeUpdate(update) if update.node_id == node_id => {
                Some(update.status)
            }
            _ => None,
        })
        .collect()
}

/// Ids of nodes that ever reported any status.
pub fn updated_nodes(messages: &[ProcessingMessage]) -> Vec<String> {
    let mut ids = Vec::new();
    for message in messages {
        if let ProcessingMessage::NodeUpdate(update) = message {
            if !ids.contains(&update.node_id) {
                ids.push(update.node_id.clone());
            }
        }
    }
    ids
}
