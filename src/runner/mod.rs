//! The dependency-driven scheduler.
//!
//! [`WorkflowRunner`] walks a validated [`Graph`](crate::graph::Graph)
//! against a [`ProcessingContext`], invoking each node's behavior in
//! dependency order, recursing into Loop/Group scopes, and emitting
//! status/progress messages as it goes.
//!
//! Ready nodes are drained sequentially from a deterministic queue (graph
//! declaration order), so across distinct nodes the message stream follows
//! invocation order, not wall-clock completion. Within one node the order
//! is always `running`, any progress the node posts, then one terminal
//! update.
//!
//! Failure policy is job-fatal: the first node failure emits its
//! `NodeUpdate{failed}`, halts scheduling, and ends the stream with a
//! single `JobUpdate{failed}`. Nodes that only depend on the failed node
//! never start. Cancellation is cooperative and checked between steps.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::config::RunnerConfig;
use crate::context::{ContextError, ProcessingContext};
use crate::graph::{Graph, GraphError, Node, Topology, DEFAULT_SLOT};
use crate::message::ProcessingMessage;
use crate::registry::{NodeBehavior, NodeRegistry, NodeRole, ResolvedInputs};
use crate::types::JobStatus;

/// Final accounting of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    /// Values of root-scope Output nodes, keyed by their `name` property
    /// (node id when unset). Empty unless the job completed.
    pub outputs: FxHashMap<String, Value>,
    pub error: Option<String>,
}

/// Infrastructure failures of the runner itself.
///
/// Node failures are not errors at this level — they end the job through
/// the normal message stream and surface in [`JobOutcome`].
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Context(#[from] ContextError),
}

/// Outcome of one scheduled node.
enum StepRun {
    Completed,
    Failed { error: String },
    Cancelled,
}

/// Outcome of draining one scope's ready set.
enum ScopeRun {
    Finished,
    NodeFailed { node_id: String, error: String },
    Cancelled,
}

enum ResolveFailure {
    Missing(String),
    Context(ContextError),
}

#[derive(Default)]
struct RunState {
    /// Nodes whose `initialize` already ran this job (loop interiors run
    /// `process` once per iteration, `initialize` once).
    initialized: FxHashSet<String>,
}

/// The scheduler. Cheap to construct per job; the registry is shared.
pub struct WorkflowRunner {
    registry: Arc<NodeRegistry>,
    config: RunnerConfig,
}

impl WorkflowRunner {
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            config: RunnerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute the context's graph to a terminal state.
    ///
    /// Emits `JobUpdate{running}` once validation passes and exactly one
    /// terminal message. Returns `Err` only for pre-execution graph errors
    /// and internal invariant violations; node failures and cancellation
    /// are `Ok` outcomes with the corresponding status.
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job_id(), workflow_id = %ctx.workflow_id()))]
    pub async fn run(&self, ctx: &mut ProcessingContext) -> Result<JobOutcome, RunnerError> {
        let graph = Arc::clone(ctx.graph());
        let topology = match graph.validate(&self.registry) {
            Ok(topology) => topology,
            Err(error) => {
                tracing::warn!(%error, "graph validation failed; no node was invoked");
                ctx.post_message(ProcessingMessage::job_failed(error.to_string()))?;
                return Err(RunnerError::Graph(error));
            }
        };

        ctx.post_message(ProcessingMessage::job_running())?;
        let mut run = RunState::default();

        match self
            .run_scope(&graph, &topology, None, ctx, &mut run)
            .await
        {
            Err(error) => {
                // Internal bug: end the stream with a terminal Error.
                let _ = ctx.post_message(ProcessingMessage::error(error.to_string()));
                Err(error)
            }
            Ok(ScopeRun::Cancelled) => {
                tracing::info!("job cancelled");
                ctx.post_message(ProcessingMessage::job_cancelled())?;
                Ok(JobOutcome {
                    status: JobStatus::Cancelled,
                    outputs: FxHashMap::default(),
                    error: None,
                })
            }
            Ok(ScopeRun::NodeFailed { node_id, error }) => {
                let message = format!("node {node_id} failed: {error}");
                ctx.post_message(ProcessingMessage::job_failed(&message))?;
                Ok(JobOutcome {
                    status: JobStatus::Failed,
                    outputs: FxHashMap::default(),
                    error: Some(message),
                })
            }
            Ok(ScopeRun::Finished) => {
                let outputs = self.collect_outputs(&graph, &topology, ctx);
                let result = Value::Object(
                    outputs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                );
                ctx.post_message(ProcessingMessage::job_completed(Some(result)))?;
                Ok(JobOutcome {
                    status: JobStatus::Completed,
                    outputs,
                    error: None,
                })
            }
        }
    }

    /// Drain one scope's ready set to completion.
    ///
    /// Boxed for recursion: Loop/Group execution re-enters through here
    /// for each iteration's interior sub-run.
    fn run_scope<'a>(
        &'a self,
        graph: &'a Graph,
        topology: &'a Topology,
        scope: Option<&'a str>,
        ctx: &'a mut ProcessingContext,
        run: &'a mut RunState,
    ) -> BoxFuture<'a, Result<ScopeRun, RunnerError>> {
        Box::pin(async move {
            let members = topology.scope_members(scope);
            let member_set: FxHashSet<&str> = members.iter().map(String::as_str).collect();
            let mut in_degree: FxHashMap<&str, usize> = members
                .iter()
                .map(|id| (id.as_str(), topology.in_degree(id)))
                .collect();
            let mut ready: VecDeque<&str> = members
                .iter()
                .map(String::as_str)
                .filter(|id| in_degree[id] == 0)
                .collect();

            while let Some(node_id) = ready.pop_front() {
                if ctx.is_cancelled() {
                    tracing::info!(node_id, "cancellation observed between steps");
                    return Ok(ScopeRun::Cancelled);
                }

                let node = graph.node(node_id).expect("member of validated graph");
                let behavior = self
                    .registry
                    .get(&node.kind)
                    .expect("type resolved during validation");

                let step = match behavior.role() {
                    NodeRole::Loop => {
                        self.run_loop(graph, topology, node, &*behavior, ctx, run)
                            .await?
                    }
                    NodeRole::Group => self.run_group(graph, topology, node, ctx, run).await?,
                    _ => self.execute_node(node, &*behavior, ctx, run).await?,
                };

                match step {
                    StepRun::Completed => {}
                    StepRun::Failed { error } => {
                        return Ok(ScopeRun::NodeFailed {
                            node_id: node_id.to_string(),
                            error,
                        });
                    }
                    StepRun::Cancelled => return Ok(ScopeRun::Cancelled),
                }

                for dependent in topology.dependents(node_id) {
                    if !member_set.contains(dependent.as_str()) {
                        continue;
                    }
                    let degree = in_degree
                        .get_mut(dependent.as_str())
                        .expect("dependent indexed with members");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent.as_str());
                    }
                }
            }

            Ok(ScopeRun::Finished)
        })
    }

    /// Run one standard node: resolve inputs, reuse a cached result when
    /// permitted, otherwise initialize (once) and invoke `process`.
    async fn execute_node(
        &self,
        node: &Node,
        behavior: &dyn NodeBehavior,
        ctx: &mut ProcessingContext,
        run: &mut RunState,
    ) -> Result<StepRun, RunnerError> {
        ctx.post_message(ProcessingMessage::node_running(&node.id, &node.kind))?;

        let inputs = match self.resolve_inputs(node, behavior, ctx) {
            Ok(inputs) => inputs,
            Err(ResolveFailure::Missing(what)) => {
                let error = format!("missing required input: {what}");
                ctx.post_message(ProcessingMessage::node_failed(&node.id, &node.kind, &error))?;
                return Ok(StepRun::Failed { error });
            }
            Err(ResolveFailure::Context(error)) => return Err(error.into()),
        };

        let cacheable =
            self.config.result_cache_enabled && node.cacheable && behavior.is_cacheable();
        let fingerprint = cacheable.then(|| ProcessingContext::input_fingerprint(&inputs));

        if let Some(fp) = &fingerprint {
            if let Some(slots) = ctx.memo_get(&node.id, fp) {
                tracing::debug!(node_id = %node.id, "input-identical invocation; reusing result");
                let result = slots_to_value(&slots);
                ctx.cache_result(&node.id, slots);
                ctx.post_message(ProcessingMessage::node_completed(
                    &node.id,
                    &node.kind,
                    Some(result),
                ))?;
                return Ok(StepRun::Completed);
            }
        }

        if run.initialized.insert(node.id.clone()) {
            if let Err(error) = behavior.initialize(node, ctx).await {
                let error = error.to_string();
                ctx.post_message(ProcessingMessage::node_failed(&node.id, &node.kind, &error))?;
                return Ok(StepRun::Failed { error });
            }
            behavior.move_to_device(&ctx.device());
        }

        let invocation = AssertUnwindSafe(behavior.process(node, inputs, ctx)).catch_unwind();
        match invocation.await {
            Err(panic) => {
                let error = panic_message(panic.as_ref());
                tracing::error!(node_id = %node.id, %error, "node behavior panicked");
                ctx.post_message(ProcessingMessage::node_failed(&node.id, &node.kind, &error))?;
                Ok(StepRun::Failed { error })
            }
            Ok(Err(error)) => {
                let error = error.to_string();
                ctx.post_message(ProcessingMessage::node_failed(&node.id, &node.kind, &error))?;
                Ok(StepRun::Failed { error })
            }
            Ok(Ok(output)) => {
                let slots = output.into_slots();
                if let Some(fp) = &fingerprint {
                    ctx.memo_put(&node.id, fp, slots.clone());
                }
                let result = slots_to_value(&slots);
                ctx.cache_result(&node.id, slots);
                ctx.post_message(ProcessingMessage::node_completed(
                    &node.id,
                    &node.kind,
                    Some(result),
                ))?;
                Ok(StepRun::Completed)
            }
        }
    }

    /// Run a Loop node: one interior sub-run per input item, accumulating
    /// each iteration's LoopOutput value into the loop's own output.
    async fn run_loop(
        &self,
        graph: &Graph,
        topology: &Topology,
        node: &Node,
        behavior: &dyn NodeBehavior,
        ctx: &mut ProcessingContext,
        run: &mut RunState,
    ) -> Result<StepRun, RunnerError> {
        ctx.post_message(ProcessingMessage::node_running(&node.id, &node.kind))?;

        let inputs = match self.resolve_inputs(node, behavior, ctx) {
            Ok(inputs) => inputs,
            Err(ResolveFailure::Missing(what)) => {
                let error = format!("missing required input: {what}");
                ctx.post_message(ProcessingMessage::node_failed(&node.id, &node.kind, &error))?;
                return Ok(StepRun::Failed { error });
            }
            Err(ResolveFailure::Context(error)) => return Err(error.into()),
        };

        let items = match inputs.get("items") {
            Some(Value::Array(items)) => items.clone(),
            other => {
                let error = format!(
                    "loop input `items` must be an array, got {}",
                    json_kind(other)
                );
                ctx.post_message(ProcessingMessage::node_failed(&node.id, &node.kind, &error))?;
                return Ok(StepRun::Failed { error });
            }
        };

        let collector = self.scope_collector(graph, topology, &node.id);
        let mut accumulator = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            tracing::debug!(loop_id = %node.id, index, "starting loop iteration");
            let mut inner = ctx.nested_scope(&node.id, item);
            match self
                .run_scope(graph, topology, Some(node.id.as_str()), &mut inner, run)
                .await?
            {
                ScopeRun::Finished => {}
                ScopeRun::Cancelled => return Ok(StepRun::Cancelled),
                ScopeRun::NodeFailed { node_id, error } => {
                    let error = format!("iteration {index}: node {node_id} failed: {error}");
                    ctx.post_message(ProcessingMessage::node_failed(
                        &node.id, &node.kind, &error,
                    ))?;
                    return Ok(StepRun::Failed { error });
                }
            }

            accumulator.push(
                collector
                    .and_then(|id| inner.get_result(id, DEFAULT_SLOT))
                    .cloned()
                    .unwrap_or(Value::Null),
            );
        }

        let mut slots = FxHashMap::default();
        slots.insert(DEFAULT_SLOT.to_string(), Value::Array(accumulator));
        let result = slots_to_value(&slots);
        ctx.cache_result(&node.id, slots);
        ctx.post_message(ProcessingMessage::node_completed(
            &node.id,
            &node.kind,
            Some(result),
        ))?;
        Ok(StepRun::Completed)
    }

    /// Run a Group node: a single-pass nested scope with a null binding;
    /// the interior collector's value becomes the group's output, unwrapped.
    async fn run_group(
        &self,
        graph: &Graph,
        topology: &Topology,
        node: &Node,
        ctx: &mut ProcessingContext,
        run: &mut RunState,
    ) -> Result<StepRun, RunnerError> {
        ctx.post_message(ProcessingMessage::node_running(&node.id, &node.kind))?;

        let mut inner = ctx.nested_scope(&node.id, Value::Null);
        match self
            .run_scope(graph, topology, Some(node.id.as_str()), &mut inner, run)
            .await?
        {
            ScopeRun::Finished => {}
            ScopeRun::Cancelled => return Ok(StepRun::Cancelled),
            ScopeRun::NodeFailed { node_id, error } => {
                let error = format!("node {node_id} failed: {error}");
                ctx.post_message(ProcessingMessage::node_failed(&node.id, &node.kind, &error))?;
                return Ok(StepRun::Failed { error });
            }
        }

        let value = self
            .scope_collector(graph, topology, &node.id)
            .and_then(|id| inner.get_result(id, DEFAULT_SLOT))
            .cloned()
            .unwrap_or(Value::Null);

        let mut slots = FxHashMap::default();
        slots.insert(DEFAULT_SLOT.to_string(), value);
        let result = slots_to_value(&slots);
        ctx.cache_result(&node.id, slots);
        ctx.post_message(ProcessingMessage::node_completed(
            &node.id,
            &node.kind,
            Some(result),
        ))?;
        Ok(StepRun::Completed)
    }

    /// The LoopOutput node of a scope, if declared.
    fn scope_collector<'a>(
        &self,
        graph: &'a Graph,
        topology: &'a Topology,
        scope_id: &str,
    ) -> Option<&'a str> {
        topology
            .scope_members(Some(scope_id))
            .iter()
            .find(|id| {
                graph
                    .node(id)
                    .and_then(|n| self.registry.get(&n.kind).ok())
                    .is_some_and(|b| b.role() == NodeRole::LoopOutput)
            })
            .map(String::as_str)
    }

    /// Resolve every declared field (edge beats literal beats schema
    /// default), plus wired/literal extras for dynamic behaviors.
    fn resolve_inputs(
        &self,
        node: &Node,
        behavior: &dyn NodeBehavior,
        ctx: &ProcessingContext,
    ) -> Result<ResolvedInputs, ResolveFailure> {
        let mut inputs = ResolvedInputs::default();
        for schema in behavior.properties() {
            let mut value = ctx
                .resolve_input(node, &schema.name)
                .map_err(ResolveFailure::Context)?;
            if value.is_null() {
                if let Some(default) = schema.default {
                    value = default;
                }
            }
            if schema.required && value.is_null() {
                return Err(ResolveFailure::Missing(schema.name));
            }
            inputs.insert(schema.name, value);
        }

        if behavior.is_dynamic() {
            let extra_fields: Vec<String> = node
                .dynamic_properties
                .keys()
                .cloned()
                .chain(
                    ctx.graph()
                        .edges_into(&node.id)
                        .map(|edge| edge.target_field.clone()),
                )
                .collect();
            for field in extra_fields {
                if inputs.contains_key(&field) {
                    continue;
                }
                let value = ctx
                    .resolve_input(node, &field)
                    .map_err(ResolveFailure::Context)?;
                inputs.insert(field, value);
            }
        }

        Ok(inputs)
    }

    /// Values of root-scope Output nodes after a completed run.
    fn collect_outputs(
        &self,
        graph: &Graph,
        topology: &Topology,
        ctx: &ProcessingContext,
    ) -> FxHashMap<String, Value> {
        let mut outputs = FxHashMap::default();
        for id in topology.scope_members(None) {
            let Some(node) = graph.node(id) else { continue };
            let Ok(behavior) = self.registry.get(&node.kind) else {
                continue;
            };
            if behavior.role() != NodeRole::Output {
                continue;
            }
            let key = node
                .properties
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| node.id.clone());
            let value = ctx.get_result(id, DEFAULT_SLOT).cloned().unwrap_or(Value::Null);
            outputs.insert(key, value);
        }
        outputs
    }
}

/// A single `"output"` slot collapses to its value; multi-slot results
/// surface as an object keyed by slot name.
fn slots_to_value(slots: &FxHashMap<String, Value>) -> Value {
    if slots.len() == 1 {
        if let Some(value) = slots.get(DEFAULT_SLOT) {
            return value.clone();
        }
    }
    Value::Object(slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn json_kind(value: Option<&Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "a boolean",
        Some(Value::Number(_)) => "a number",
        Some(Value::String(_)) => "a string",
        Some(Value::Array(_)) => "an array",
        Some(Value::Object(_)) => "an object",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic in node behavior".to_string()
    }
}
