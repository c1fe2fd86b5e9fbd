//! Job records, run requests, and the collaborator interfaces the core
//! consumes but never implements.
//!
//! The hosting layer persists [`Job`] records around a run (create before,
//! save on every status change); the scheduler itself only reports status
//! through the message stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::graph::Graph;
use crate::types::JobStatus;

fn default_job_type() -> String {
    "workflow".to_string()
}

/// Submission payload for one workflow run.
///
/// `graph` may be omitted on the wire when the hosting layer resolves it
/// from a persisted workflow record by `workflow_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunJobRequest {
    pub workflow_id: String,
    #[serde(default = "default_job_type")]
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Seed messages forwarded to chat-oriented nodes; opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<Graph>,
    #[serde(default)]
    pub env: FxHashMap<String, String>,
    #[serde(default)]
    pub explicit_types: bool,
}

impl RunJobRequest {
    pub fn new(workflow_id: impl Into<String>, graph: Graph) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            job_type: default_job_type(),
            params: None,
            messages: None,
            graph: Some(graph),
            env: FxHashMap::default(),
            explicit_types: false,
        }
    }

    /// Per-node property overrides, an object keyed by node id.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The request's graph with `params` overlaid, if a graph is inlined.
    ///
    /// `params` is an object keyed by node id, each entry an object of
    /// property overrides replacing the node's literals before validation.
    /// Entries for unknown node ids are ignored.
    #[must_use]
    pub fn effective_graph(&self) -> Option<Graph> {
        let mut graph = self.graph.clone()?;
        if let Some(Value::Object(overrides)) = &self.params {
            for node in &mut graph.nodes {
                if let Some(Value::Object(fields)) = overrides.get(&node.id) {
                    for (field, value) in fields {
                        node.properties.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        Some(graph)
    }
}

/// Persisted record of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub workflow_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Fresh record in `Starting` with a generated id.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            status: JobStatus::Starting,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }
}

/// Failure from an external model provider, as surfaced by collaborator
/// node implementations. The scheduler never retries these; behaviors own
/// their bounded retry loops and report `Booting`/`Retrying` status while
/// they do.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider failure ({provider}): {message}")]
    Transient { provider: String, message: String },
    #[error("provider failure ({provider}): {message}")]
    Fatal { provider: String, message: String },
}

/// Byte-oriented asset access by opaque id; used by node behaviors, not
/// the scheduler.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset not found: {id}")]
    NotFound { id: String },
    #[error("asset backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Vec<u8>, AssetError>;
    async fn put(&self, id: &str, bytes: Vec<u8>) -> Result<(), AssetError>;
}

/// Dispatches a prediction to an external model provider. Called from
/// inside specific node `process` implementations.
#[async_trait]
pub trait PredictionDispatcher: Send + Sync {
    async fn run_prediction(
        &self,
        provider: &str,
        model: &str,
        params: Value,
        node_id: &str,
    ) -> Result<Value, ProviderError>;
}

/// Job record persistence, invoked by the hosting layer around a run.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError>;
    async fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError>;
    async fn save(&self, job: &Job) -> Result<(), JobStoreError>;
}
