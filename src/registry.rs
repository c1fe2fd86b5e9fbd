//! Node behavior contract and the type registry.
//!
//! Each node type string resolves through the [`NodeRegistry`] to a
//! [`NodeBehavior`]: the scheduler is polymorphic over this capability set
//! and never inspects node internals beyond it. Concrete catalogue nodes
//! live outside the engine; only the control behaviors
//! ([`crate::nodes`]) ship with it.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::context::ProcessingContext;
use crate::graph::{Node, DEFAULT_SLOT};
use crate::types::Device;

/// Declared input field of a node type.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertySchema {
    pub name: String,
    pub required: bool,
    pub default: Option<Value>,
}

impl PropertySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Scheduler-relevant role of a node type.
///
/// `Loop`, `Group` and `LoopOutput` drive the nested-scope machinery;
/// `Output` nodes contribute to the job's final result. Everything else is
/// `Standard`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Standard,
    Loop,
    Group,
    LoopOutput,
    Output,
}

/// Value(s) returned by a node's `process`.
///
/// A plain value is stored under the implicit `"output"` slot; a slot map
/// is stored per named key.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeOutput {
    Value(Value),
    Slots(FxHashMap<String, Value>),
}

impl NodeOutput {
    /// Normalize to a slot map.
    #[must_use]
    pub fn into_slots(self) -> FxHashMap<String, Value> {
        match self {
            Self::Value(value) => {
                let mut slots = FxHashMap::default();
                slots.insert(DEFAULT_SLOT.to_string(), value);
                slots
            }
            Self::Slots(slots) => slots,
        }
    }
}

impl From<Value> for NodeOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Resolved input fields handed to `process`, field name to value.
pub type ResolvedInputs = FxHashMap<String, Value>;

/// Fatal failure inside a node's `initialize` or `process`.
///
/// Behaviors that retry transient provider failures own their retry loop
/// and surface intermediate `Booting`/`Retrying` status themselves; the
/// scheduler only ever observes success or this error.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    #[error("missing required input: {what}")]
    #[diagnostic(
        code(loomflow::node::missing_input),
        help("Wire an edge into the field or set a property literal.")
    )]
    MissingInput { what: String },

    #[error("invalid input for {field}: {reason}")]
    #[diagnostic(code(loomflow::node::invalid_input))]
    InvalidInput { field: String, reason: String },

    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(loomflow::node::provider))]
    Provider { provider: String, message: String },

    #[error(transparent)]
    #[diagnostic(code(loomflow::node::serde_json))]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    #[diagnostic(code(loomflow::node::other))]
    Other(String),
}

/// Executable contract of a node type.
///
/// The scheduler resolves inputs, calls [`initialize`](Self::initialize)
/// once per node instance before the first [`process`](Self::process), and
/// stores the returned value(s) in the run's result cache. `process` may
/// post any number of progress messages through the context before
/// returning.
#[async_trait]
pub trait NodeBehavior: Send + Sync {
    /// Declared input fields.
    fn properties(&self) -> Vec<PropertySchema>;

    /// Declared output slots; a single implicit `"output"` by default.
    fn outputs(&self) -> Vec<String> {
        vec![DEFAULT_SLOT.to_string()]
    }

    /// Fields that must resolve to a non-null value before `process` runs.
    fn required_inputs(&self) -> Vec<String> {
        self.properties()
            .into_iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect()
    }

    /// Whether input-identical invocations may reuse a cached result.
    fn is_cacheable(&self) -> bool {
        true
    }

    /// Whether unknown extra fields are accepted.
    fn is_dynamic(&self) -> bool {
        false
    }

    fn role(&self) -> NodeRole {
        NodeRole::Standard
    }

    /// One-time setup before the first `process`, typically loading
    /// heavyweight resources through the context's
    /// [`ModelManager`](crate::model_manager::ModelManager).
    async fn initialize(
        &self,
        _node: &Node,
        _ctx: &ProcessingContext,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    /// The unit of work.
    async fn process(
        &self,
        node: &Node,
        inputs: ResolvedInputs,
        ctx: &ProcessingContext,
    ) -> Result<NodeOutput, NodeError>;

    /// Relocate device-resident resources; no-op by default.
    fn move_to_device(&self, _device: &Device) {}
}

/// Registry lookup failure.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("unknown node type: {kind}")]
    #[diagnostic(
        code(loomflow::registry::unknown_type),
        help("Call NodeRegistry::register before building graphs with this type.")
    )]
    UnknownType { kind: String },
}

/// Maps node type strings to their behaviors.
///
/// Built once at startup; shared read-only across runs via `Arc`.
///
/// # Examples
///
/// ```
/// use loomflow::registry::NodeRegistry;
///
/// let registry = NodeRegistry::with_control_nodes();
/// assert!(registry.contains("loomflow.control.Loop"));
/// assert!(registry.get("no.such.Type").is_err());
/// ```
#[derive(Default)]
pub struct NodeRegistry {
    behaviors: FxHashMap<String, Arc<dyn NodeBehavior>>,
}

impl NodeRegistry {
    /// Empty registry, no types known.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the engine's control behaviors
    /// (Loop, Group, LoopOutput, Output).
    #[must_use]
    pub fn with_control_nodes() -> Self {
        let mut registry = Self::new();
        crate::nodes::register_control_nodes(&mut registry);
        registry
    }

    /// Register a behavior under a type string. Last registration wins.
    pub fn register(&mut self, kind: impl Into<String>, behavior: impl NodeBehavior + 'static) {
        self.behaviors.insert(kind.into(), Arc::new(behavior));
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.behaviors.contains_key(kind)
    }

    /// Resolve a type string to its behavior.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn NodeBehavior>, RegistryError> {
        self.behaviors
            .get(kind)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownType {
                kind: kind.to_string(),
            })
    }
}
