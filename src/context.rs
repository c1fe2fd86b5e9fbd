//! Per-job execution environment and message bus.
//!
//! A [`ProcessingContext`] is created per job and owns the outbound
//! message queue, the write-once per-node result cache, the device
//! selection and references to the injectable collaborator services
//! (model cache, asset store, provider dispatcher). The scheduler is the
//! only writer of the result cache; node behaviors see the context
//! immutably and use it to post progress and reach services.
//!
//! The queue is a thread-safe unbounded channel: the background execution
//! thread produces, the calling thread consumes — synchronously via
//! [`pop_message`](ProcessingContext::pop_message) or from async code via
//! [`pop_message_async`](ProcessingContext::pop_message_async).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::graph::{Edge, Graph, Node, DEFAULT_SLOT};
use crate::job::{AssetStore, PredictionDispatcher};
use crate::message::ProcessingMessage;
use crate::model_manager::ModelManager;
use crate::registry::ResolvedInputs;
use crate::types::Device;

/// Cooperative cancellation flag, checked by the scheduler between steps.
///
/// Cancelling does not abort in-flight provider calls; it stops further
/// nodes from being scheduled.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Failures crossing the context boundary.
#[derive(Debug, Error, Diagnostic)]
pub enum ContextError {
    #[error("message channel disconnected")]
    #[diagnostic(code(loomflow::context::channel_closed))]
    ChannelClosed,

    /// A wired input was read before its source produced the slot. This is
    /// a scheduler invariant violation, never a user error.
    #[error("missing dependency: node {node} has not produced slot {slot}")]
    #[diagnostic(
        code(loomflow::context::missing_dependency),
        help("This indicates a scheduler bug; the run is aborted.")
    )]
    MissingDependency { node: String, slot: String },
}

type SlotMap = FxHashMap<String, Value>;
type BehaviorMemo = FxHashMap<(String, String), SlotMap>;

/// Cloneable consumer handle onto a context's message queue.
///
/// Take one with [`ProcessingContext::message_receiver`] before moving the
/// context onto an execution thread; the handle keeps draining buffered
/// messages even after the context is gone.
#[derive(Clone)]
pub struct MessageReceiver {
    rx: flume::Receiver<ProcessingMessage>,
}

impl MessageReceiver {
    /// Blocking pop of the oldest buffered message.
    pub fn pop(&self) -> Result<ProcessingMessage, ContextError> {
        self.rx.recv().map_err(|_| ContextError::ChannelClosed)
    }

    /// Async pop of the oldest buffered message.
    pub async fn pop_async(&self) -> Result<ProcessingMessage, ContextError> {
        self.rx
            .recv_async()
            .await
            .map_err(|_| ContextError::ChannelClosed)
    }

    pub fn try_pop(&self) -> Option<ProcessingMessage> {
        self.rx.try_recv().ok()
    }

    pub fn has_messages(&self) -> bool {
        !self.rx.is_empty()
    }
}

/// Per-job execution environment; see the module docs.
pub struct ProcessingContext {
    job_id: String,
    workflow_id: String,
    graph: Arc<Graph>,
    device: Device,
    tx: flume::Sender<ProcessingMessage>,
    rx: flume::Receiver<ProcessingMessage>,
    incoming: Arc<FxHashMap<String, FxHashMap<String, Edge>>>,
    results: FxHashMap<String, SlotMap>,
    memo: Arc<Mutex<BehaviorMemo>>,
    models: Arc<ModelManager>,
    cancel: CancelToken,
    assets: Option<Arc<dyn AssetStore>>,
    dispatcher: Option<Arc<dyn PredictionDispatcher>>,
}

impl ProcessingContext {
    /// Context for one job over the given graph, with an isolated model
    /// cache and a fresh unbounded message queue.
    #[must_use]
    pub fn new(
        job_id: impl Into<String>,
        workflow_id: impl Into<String>,
        graph: Arc<Graph>,
    ) -> Self {
        let (tx, rx) = flume::unbounded();
        let mut incoming: FxHashMap<String, FxHashMap<String, Edge>> = FxHashMap::default();
        for edge in &graph.edges {
            incoming
                .entry(edge.target.clone())
                .or_default()
                .insert(edge.target_field.clone(), edge.clone());
        }
        Self {
            job_id: job_id.into(),
            workflow_id: workflow_id.into(),
            graph,
            device: Device::default(),
            tx,
            rx,
            incoming: Arc::new(incoming),
            results: FxHashMap::default(),
            memo: Arc::new(Mutex::new(FxHashMap::default())),
            models: Arc::new(ModelManager::new()),
            cancel: CancelToken::new(),
            assets: None,
            dispatcher: None,
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Apply config-level selections (currently the device) to this
    /// context.
    #[must_use]
    pub fn with_config(self, config: &crate::config::RunnerConfig) -> Self {
        self.with_device(config.device)
    }

    /// Share a process-wide model cache instead of the isolated default.
    #[must_use]
    pub fn with_models(mut self, models: Arc<ModelManager>) -> Self {
        self.models = models;
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_asset_store(mut self, assets: Arc<dyn AssetStore>) -> Self {
        self.assets = Some(assets);
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn PredictionDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    pub fn asset_store(&self) -> Option<&Arc<dyn AssetStore>> {
        self.assets.as_ref()
    }

    pub fn dispatcher(&self) -> Option<&Arc<dyn PredictionDispatcher>> {
        self.dispatcher.as_ref()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Message bus
    // ------------------------------------------------------------------

    /// Buffer a message for the consumer. Never blocks.
    pub fn post_message(&self, message: ProcessingMessage) -> Result<(), ContextError> {
        self.tx.send(message).map_err(|_| ContextError::ChannelClosed)
    }

    /// Remove and return the oldest buffered message, blocking until one
    /// is available. For synchronous consumers on their own thread.
    pub fn pop_message(&self) -> Result<ProcessingMessage, ContextError> {
        self.rx.recv().map_err(|_| ContextError::ChannelClosed)
    }

    /// Async variant of [`pop_message`](Self::pop_message).
    pub async fn pop_message_async(&self) -> Result<ProcessingMessage, ContextError> {
        self.rx
            .recv_async()
            .await
            .map_err(|_| ContextError::ChannelClosed)
    }

    /// Non-blocking pop.
    pub fn try_pop_message(&self) -> Option<ProcessingMessage> {
        self.rx.try_recv().ok()
    }

    /// Non-blocking check for buffered messages.
    pub fn has_messages(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Consumer handle that outlives this context.
    #[must_use]
    pub fn message_receiver(&self) -> MessageReceiver {
        MessageReceiver {
            rx: self.rx.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Result cache
    // ------------------------------------------------------------------

    /// Resolve one input field of a node.
    ///
    /// An incoming edge beats a property literal; a wired edge whose
    /// source has not produced the slot yet is a
    /// [`MissingDependency`](ContextError::MissingDependency). Fields with
    /// neither an edge nor a literal resolve to `Null` (schema defaults
    /// are applied by the scheduler).
    pub fn resolve_input(&self, node: &Node, field: &str) -> Result<Value, ContextError> {
        if let Some(edge) = self.incoming.get(&node.id).and_then(|m| m.get(field)) {
            return self
                .results
                .get(&edge.source)
                .and_then(|slots| slots.get(&edge.source_slot))
                .cloned()
                .ok_or_else(|| ContextError::MissingDependency {
                    node: edge.source.clone(),
                    slot: edge.source_slot.clone(),
                });
        }
        if let Some(value) = node.properties.get(field) {
            return Ok(value.clone());
        }
        if let Some(value) = node.dynamic_properties.get(field) {
            return Ok(value.clone());
        }
        Ok(Value::Null)
    }

    /// Cached slot value of a node, if produced.
    pub fn get_result(&self, node_id: &str, slot: &str) -> Option<&Value> {
        self.results.get(node_id).and_then(|slots| slots.get(slot))
    }

    pub fn has_result(&self, node_id: &str) -> bool {
        self.results.contains_key(node_id)
    }

    /// Store a node's output slots. Write-once per node id: a second write
    /// keeps the first value.
    pub fn cache_result(&mut self, node_id: &str, slots: SlotMap) {
        if self.results.contains_key(node_id) {
            tracing::warn!(node_id, "result cache is write-once; keeping first value");
            return;
        }
        self.results.insert(node_id.to_string(), slots);
    }

    // ------------------------------------------------------------------
    // Behavior memo (input-identical reuse for cacheable nodes)
    // ------------------------------------------------------------------

    /// Canonical fingerprint of resolved inputs, stable across map order.
    #[must_use]
    pub fn input_fingerprint(inputs: &ResolvedInputs) -> String {
        let ordered: BTreeMap<&str, &Value> =
            inputs.iter().map(|(k, v)| (k.as_str(), v)).collect();
        serde_json::to_string(&ordered).unwrap_or_default()
    }

    pub fn memo_get(&self, node_id: &str, fingerprint: &str) -> Option<SlotMap> {
        self.memo
            .lock()
            .get(&(node_id.to_string(), fingerprint.to_string()))
            .cloned()
    }

    pub fn memo_put(&self, node_id: &str, fingerprint: &str, slots: SlotMap) {
        self.memo
            .lock()
            .insert((node_id.to_string(), fingerprint.to_string()), slots);
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    /// Nested view for one Loop/Group iteration.
    ///
    /// Shares the message queue, model cache, memo and cancellation with
    /// the parent; copies the parent's results in so interior nodes can
    /// reference outer-scope outputs, and binds `binding` as the scope
    /// node's emitted value. Writes inside the view stay in the view.
    #[must_use]
    pub fn nested_scope(&self, scope_node_id: &str, binding: Value) -> Self {
        let mut results = self.results.clone();
        let mut slots = FxHashMap::default();
        slots.insert(DEFAULT_SLOT.to_string(), binding);
        results.insert(scope_node_id.to_string(), slots);

        Self {
            job_id: self.job_id.clone(),
            workflow_id: self.workflow_id.clone(),
            graph: Arc::clone(&self.graph),
            device: self.device,
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            incoming: Arc::clone(&self.incoming),
            results,
            memo: Arc::clone(&self.memo),
            models: Arc::clone(&self.models),
            cancel: self.cancel.clone(),
            assets: self.assets.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Graph, Node};
    use serde_json::json;

    fn two_node_graph() -> Arc<Graph> {
        Arc::new(
            Graph::new()
                .add_node(Node::new("a", "test.Constant").with_property("value", json!(7)))
                .add_node(Node::new("b", "test.Add").with_property("b", json!(1)))
                .add_edge(Edge::new("e1", "a", "b", "a")),
        )
    }

    #[test]
    fn queue_is_fifo_and_nonblocking_to_post() {
        let ctx = ProcessingContext::new("job", "wf", two_node_graph());
        assert!(!ctx.has_messages());
        ctx.post_message(ProcessingMessage::node_running("a", "A"))
            .unwrap();
        ctx.post_message(ProcessingMessage::node_progress("a", 1, 2))
            .unwrap();
        assert!(ctx.has_messages());
        assert_eq!(
            ctx.pop_message().unwrap(),
            ProcessingMessage::node_running("a", "A")
        );
        assert_eq!(
            ctx.pop_message().unwrap(),
            ProcessingMessage::node_progress("a", 1, 2)
        );
        assert!(!ctx.has_messages());
    }

    #[test]
    fn resolve_prefers_edge_over_literal() {
        let graph = two_node_graph();
        let mut ctx = ProcessingContext::new("job", "wf", Arc::clone(&graph));
        let b = graph.node("b").unwrap();

        // Wired but unproduced: scheduler bug surface.
        assert!(matches!(
            ctx.resolve_input(b, "a"),
            Err(ContextError::MissingDependency { .. })
        ));

        let mut slots = FxHashMap::default();
        slots.insert(DEFAULT_SLOT.to_string(), json!(7));
        ctx.cache_result("a", slots);

        assert_eq!(ctx.resolve_input(b, "a").unwrap(), json!(7));
        // Unwired field falls back to the literal.
        assert_eq!(ctx.resolve_input(b, "b").unwrap(), json!(1));
        // Unknown field resolves to Null.
        assert_eq!(ctx.resolve_input(b, "zzz").unwrap(), Value::Null);
    }

    #[test]
    fn result_cache_is_write_once() {
        let mut ctx = ProcessingContext::new("job", "wf", two_node_graph());
        let mut first = FxHashMap::default();
        first.insert(DEFAULT_SLOT.to_string(), json!(1));
        let mut second = FxHashMap::default();
        second.insert(DEFAULT_SLOT.to_string(), json!(2));

        ctx.cache_result("a", first);
        ctx.cache_result("a", second);
        assert_eq!(ctx.get_result("a", DEFAULT_SLOT), Some(&json!(1)));
    }

    #[test]
    fn nested_scope_binds_and_isolates() {
        let mut ctx = ProcessingContext::new("job", "wf", two_node_graph());
        let mut slots = FxHashMap::default();
        slots.insert(DEFAULT_SLOT.to_string(), json!("outer"));
        ctx.cache_result("a", slots);

        let mut inner = ctx.nested_scope("loop_1", json!(42));
        // Sees outer results plus the iteration binding.
        assert_eq!(inner.get_result("a", DEFAULT_SLOT), Some(&json!("outer")));
        assert_eq!(inner.get_result("loop_1", DEFAULT_SLOT), Some(&json!(42)));

        let mut slots = FxHashMap::default();
        slots.insert(DEFAULT_SLOT.to_string(), json!("inner-only"));
        inner.cache_result("body", slots);
        assert!(!ctx.has_result("body"));

        // Messages posted in the nested view land on the shared queue.
        inner
            .post_message(ProcessingMessage::node_progress("body", 1, 1))
            .unwrap();
        assert!(ctx.has_messages());
    }

    #[test]
    fn fingerprint_is_order_stable() {
        let mut x = ResolvedInputs::default();
        x.insert("a".to_string(), json!(1));
        x.insert("b".to_string(), json!([1, 2]));
        let mut y = ResolvedInputs::default();
        y.insert("b".to_string(), json!([1, 2]));
        y.insert("a".to_string(), json!(1));
        assert_eq!(
            ProcessingContext::input_fingerprint(&x),
            ProcessingContext::input_fingerprint(&y)
        );
    }
}
