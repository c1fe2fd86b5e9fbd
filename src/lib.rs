//! # Loomflow: graph execution engine for typed node workflows
//!
//! Loomflow executes directed graphs of typed processing nodes, streaming
//! progress and results while heavyweight resources (in-process model
//! handles, external provider calls) are loaded and released
//! deterministically.
//!
//! ## Core concepts
//!
//! - **Graph**: immutable description of [`Node`](graph::Node)s wired by
//!   [`Edge`](graph::Edge)s, validated once before anything runs
//! - **NodeBehavior**: the executable contract a node type registers under
//!   its type string
//! - **ProcessingContext**: per-job environment carrying the outbound
//!   message queue and the write-once result cache
//! - **WorkflowRunner**: the dependency-driven scheduler, including
//!   Loop/Group nested scopes
//! - **ModelManager**: process-wide cache of loaded resources with
//!   explicit eviction
//! - **ThreadedEventLoop**: background thread running the scheduler so a
//!   synchronous caller can drain messages
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::json;
//! use loomflow::context::ProcessingContext;
//! use loomflow::graph::{Edge, Graph, Node};
//! use loomflow::registry::{
//!     NodeBehavior, NodeError, NodeOutput, NodeRegistry, PropertySchema, ResolvedInputs,
//! };
//! use loomflow::runner::WorkflowRunner;
//! use loomflow::types::JobStatus;
//!
//! struct Double;
//!
//! #[async_trait]
//! impl NodeBehavior for Double {
//!     fn properties(&self) -> Vec<PropertySchema> {
//!         vec![PropertySchema::new("value").required()]
//!     }
//!
//!     async fn process(
//!         &self,
//!         _node: &Node,
//!         inputs: ResolvedInputs,
//!         _ctx: &ProcessingContext,
//!     ) -> Result<NodeOutput, NodeError> {
//!         let value = inputs["value"].as_i64().unwrap_or(0);
//!         Ok(NodeOutput::Value(json!(value * 2)))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut registry = NodeRegistry::with_control_nodes();
//! registry.register("demo.Double", Double);
//!
//! let graph = Graph::new()
//!     .add_node(Node::new("double_1", "demo.Double").with_property("value", json!(21)))
//!     .add_node(Node::new("out", "loomflow.control.Output"))
//!     .add_edge(Edge::new("e1", "double_1", "out", "value"));
//!
//! let mut ctx = ProcessingContext::new("job-1", "wf-1", Arc::new(graph));
//! let runner = WorkflowRunner::new(Arc::new(registry));
//!
//! let outcome = runner.run(&mut ctx).await.unwrap();
//! assert_eq!(outcome.status, JobStatus::Completed);
//! assert_eq!(outcome.outputs["out"], json!(42));
//! # }
//! ```
//!
//! For synchronous callers, hand the run to a
//! [`ThreadedEventLoop`](event_loop::ThreadedEventLoop) and drain
//! [`ProcessingContext::pop_message`](context::ProcessingContext::pop_message)
//! until a terminal message arrives.
//!
//! ## Module guide
//!
//! - [`graph`] - Graph data model and structural validation
//! - [`registry`] - Node behavior contract and type registry
//! - [`nodes`] - Built-in control behaviors (Loop, Group, LoopOutput, Output)
//! - [`context`] - Per-job execution environment and message bus
//! - [`message`] - Outbound message types and wire codecs
//! - [`runner`] - The scheduler
//! - [`model_manager`] - Process-wide resource cache
//! - [`event_loop`] - Sync/async bridging on a background thread
//! - [`job`] - Job records and collaborator interfaces

pub mod config;
pub mod context;
pub mod event_loop;
pub mod graph;
pub mod job;
pub mod message;
pub mod model_manager;
pub mod nodes;
pub mod registry;
pub mod runner;
pub mod telemetry;
pub mod types;
