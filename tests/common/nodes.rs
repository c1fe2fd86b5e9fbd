//! Test node behaviors shared across integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use loomflow::context::{CancelToken, ProcessingContext};
use loomflow::graph::Node;
use loomflow::message::ProcessingMessage;
use loomflow::registry::{
    NodeBehavior, NodeError, NodeOutput, PropertySchema, ResolvedInputs,
};

/// Emits its `value` property.
pub struct ConstantNode;

#[async_trait]
impl NodeBehavior for ConstantNode {
    fn properties(&self) -> Vec<PropertySchema> {
        vec![PropertySchema::new("value").required()]
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

/// Adds `a + b`; `b` defaults to 1 so it doubles as an incrementer.
pub struct AddNode;

#[async_trait]
impl NodeBehavior for AddNode {
    fn properties(&self) -> Vec<PropertySchema> {
        vec![
            PropertySchema::new("a").required(),
            PropertySchema::new("b").with_default(json!(1)),
        ]
    }

    async fn process(
        &self,
        _node: &Node,
        inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        let a = inputs["a"].as_i64().ok_or_else(|| NodeError::InvalidInput {
            field: "a".to_string(),
            reason: "expected an integer".to_string(),
        })?;
        let b = inputs["b"].as_i64().unwrap_or(0);
        Ok(NodeOutput::Value(json!(a + b)))
    }
}

/// Counts how many times `process` is actually invoked.
pub struct CountingNode {
    pub invocations: Arc<AtomicUsize>,
}

impl CountingNode {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        (
            Self {
                invocations: invocations.clone(),
            },
            invocations,
        )
    }
}

#[async_trait]
impl NodeBehavior for CountingNode {
    fn properties(&self) -> Vec<PropertySchema> {
        vec![PropertySchema::new("value").with_default(json!(0))]
    }

    async fn process(
        &self,
        _node: &Node,
        mut inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(NodeOutput::Value(
            inputs.remove("value").unwrap_or(Value::Null),
        ))
    }
}

/// Always fails.
pub struct FailingNode;

#[async_trait]
impl NodeBehavior for FailingNode {
    fn properties(&self) -> Vec<PropertySchema> {
        Vec::new()
    }

    async fn process(
        &self,
        _node: &Node,
        _inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        Err(NodeError::Other("deliberate failure".to_string()))
    }
}

/// Panics instead of returning.
pub struct PanickingNode;

#[async_trait]
impl NodeBehavior for PanickingNode {
    fn properties(&self) -> Vec<PropertySchema> {
        Vec::new()
    }

    async fn process(
        &self,
        _node: &Node,
        _inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        panic!("wild panic in process");
    }
}

/// Posts `total` progress ticks before returning `"done"`.
pub struct ProgressNode;

#[async_trait]
impl NodeBehavior for ProgressNode {
    fn properties(&self) -> Vec<PropertySchema> {
        vec![PropertySchema::new("total").with_default(json!(3))]
    }

    async fn process(
        &self,
        node: &Node,
        inputs: ResolvedInputs,
        ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        let total = inputs["total"].as_u64().unwrap_or(3);
        for tick in 1..=total {
            ctx.post_message(ProcessingMessage::node_progress(&node.id, tick, total))
                .map_err(|e| NodeError::Other(e.to_string()))?;
        }
        Ok(NodeOutput::Value(json!("done")))
    }
}

/// Produces two named slots, `low` and `high`.
pub struct SplitNode;

#[async_trait]
impl NodeBehavior for SplitNode {
    fn properties(&self) -> Vec<PropertySchema> {
        vec![PropertySchema::new("value").required()]
    }

    fn outputs(&self) -> Vec<String> {
        vec!["low".to_string(), "high".to_string()]
    }

    async fn process(
        &self,
        _node: &Node,
        inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        let value = inputs["value"].as_i64().unwrap_or(0);
        let mut slots = rustc_hash::FxHashMap::default();
        slots.insert("low".to_string(), json!(value / 2));
        slots.insert("high".to_string(), json!(value - value / 2));
        Ok(NodeOutput::Slots(slots))
    }
}

/// Dynamic behavior echoing every resolved input back as an object.
pub struct EchoDynamicNode;

#[async_trait]
impl NodeBehavior for EchoDynamicNode {
    fn properties(&self) -> Vec<PropertySchema> {
        Vec::new()
    }

    fn is_dynamic(&self) -> bool {
        true
    }

    async fn process(
        &self,
        _node: &Node,
        inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        let object: serde_json::Map<String, Value> = inputs.into_iter().collect();
        Ok(NodeOutput::Value(Value::Object(object)))
    }
}

/// Captures the exact value it receives on `input`.
pub struct CaptureNode {
    pub seen: Arc<Mutex<Option<Value>>>,
}

impl CaptureNode {
    pub fn new() -> (Self, Arc<Mutex<Option<Value>>>) {
        let seen = Arc::new(Mutex::new(None));
        (Self { seen: seen.clone() }, seen)
    }
}

#[async_trait]
impl NodeBehavior for CaptureNode {
    fn properties(&self) -> Vec<PropertySchema> {
        vec![PropertySchema::new("input").required()]
    }

    async fn process(
        &self,
        _node: &Node,
        mut inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        let value = inputs.remove("input").unwrap_or(Value::Null);
        *self.seen.lock() = Some(value.clone());
        Ok(NodeOutput::Value(value))
    }
}

/// Flips the job's cancel token from inside `process`.
pub struct CancellingNode {
    pub token: CancelToken,
}

#[async_trait]
impl NodeBehavior for CancellingNode {
    fn properties(&self) -> Vec<PropertySchema> {
        Vec::new()
    }

    async fn process(
        &self,
        _node: &Node,
        _inputs: ResolvedInputs,
        _ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        self.token.cancel();
        Ok(NodeOutput::Value(json!("cancelled downstream")))
    }
}

/// Loads a handle through the model manager during `initialize` and
/// reports whether `process` found the same handle again.
pub struct ModelUsingNode {
    pub model_id: String,
}

#[async_trait]
impl NodeBehavior for ModelUsingNode {
    fn properties(&self) -> Vec<PropertySchema> {
        Vec::new()
    }

    async fn initialize(&self, node: &Node, ctx: &ProcessingContext) -> Result<(), NodeError> {
        if ctx.models().get(&self.model_id, "test", None).is_none() {
            let handle: Arc<dyn std::any::Any + Send + Sync> = Arc::new(self.model_id.clone());
            ctx.models()
                .set(&node.id, &self.model_id, "test", handle, None);
        }
        Ok(())
    }

    async fn process(
        &self,
        _node: &Node,
        _inputs: ResolvedInputs,
        ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError> {
        let loaded = ctx.models().get(&self.model_id, "test", None).is_some();
        Ok(NodeOutput::Value(json!(loaded)))
    }
}
