//! Outbound message types produced by a run.
//!
//! Every observable fact about a job — node transitions, progress ticks,
//! binary outputs, the terminal job status — is a [`ProcessingMessage`]
//! copied into the per-job queue owned by
//! [`ProcessingContext`](crate::context::ProcessingContext). Consumers drain
//! the queue until they observe a terminal message.
//!
//! # Wire format
//!
//! The stream-facing encoding is newline-delimited JSON, one object per
//! message, discriminated by a `"type"` field:
//!
//! ```
//! use loomflow::message::ProcessingMessage;
//!
//! let msg = ProcessingMessage::node_progress("resize", 1, 3);
//! let line = msg.to_ndjson_line().unwrap();
//! assert!(line.starts_with("{\"type\":\"node_progress\""));
//! assert!(line.ends_with('\n'));
//! ```
//!
//! [`BinaryUpdate`] additionally has a bit-exact binary frame encoding for
//! low-level transports; see [`BinaryUpdate::to_frame_bytes`].

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{JobStatus, NodeStatus};

/// A single message on a job's outbound stream.
///
/// Internally tagged for the NDJSON wire format: the `"type"` field takes
/// one of `node_update`, `node_progress`, `binary_update`, `job_update`,
/// `error`, `prediction`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessingMessage {
    NodeUpdate(NodeUpdate),
    NodeProgress(NodeProgress),
    BinaryUpdate(BinaryUpdate),
    JobUpdate(JobUpdate),
    Error(ErrorMessage),
    Prediction(Prediction),
}

impl ProcessingMessage {
    /// Node entered `Running`.
    pub fn node_running(node_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self::NodeUpdate(NodeUpdate {
            node_id: node_id.into(),
            node_name: node_name.into(),
            status: NodeStatus::Running,
            error: None,
            logs: None,
            result: None,
        })
    }

    /// Intermediate status relay (`Booting`/`Retrying`) for behaviors that
    /// retry transient provider failures themselves.
    pub fn node_status(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        status: NodeStatus,
    ) -> Self {
        Self::NodeUpdate(NodeUpdate {
            node_id: node_id.into(),
            node_name: node_name.into(),
            status,
            error: None,
            logs: None,
            result: None,
        })
    }

    /// Node finished with a result.
    pub fn node_completed(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        result: Option<Value>,
    ) -> Self {
        Self::NodeUpdate(NodeUpdate {
            node_id: node_id.into(),
            node_name: node_name.into(),
            status: NodeStatus::Completed,
            error: None,
            logs: None,
            result,
        })
    }

    /// Node failed; the error string is user-facing.
    pub fn node_failed(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::NodeUpdate(NodeUpdate {
            node_id: node_id.into(),
            node_name: node_name.into(),
            status: NodeStatus::Failed,
            error: Some(error.into()),
            logs: None,
            result: None,
        })
    }

    /// Progress tick posted from inside a node's `process`.
    pub fn node_progress(node_id: impl Into<String>, progress: u64, total: u64) -> Self {
        Self::NodeProgress(NodeProgress {
            node_id: node_id.into(),
            progress,
            total,
        })
    }

    pub fn job_running() -> Self {
        Self::JobUpdate(JobUpdate {
            status: JobStatus::Running,
            error: None,
            result: None,
        })
    }

    pub fn job_completed(result: Option<Value>) -> Self {
        Self::JobUpdate(JobUpdate {
            status: JobStatus::Completed,
            error: None,
            result,
        })
    }

    pub fn job_failed(error: impl Into<String>) -> Self {
        Self::JobUpdate(JobUpdate {
            status: JobStatus::Failed,
            error: Some(error.into()),
            result: None,
        })
    }

    pub fn job_cancelled() -> Self {
        Self::JobUpdate(JobUpdate {
            status: JobStatus::Cancelled,
            error: None,
            result: None,
        })
    }

    /// Internal-invariant violation surfaced to the consumer.
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error(ErrorMessage {
            error: error.into(),
        })
    }

    /// Returns `true` if observing this message means the stream is over.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::JobUpdate(update) => update.status.is_terminal(),
            Self::Error(_) => true,
            _ => false,
        }
    }

    /// Encode as one NDJSON line, trailing newline included.
    pub fn to_ndjson_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Status transition of a single node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub node_id: String,
    pub node_name: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Progress tick for a node, `progress` out of `total`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProgress {
    pub node_id: String,
    pub progress: u64,
    pub total: u64,
}

/// Raw binary output of a node, for transports that bypass JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryUpdate {
    pub node_id: String,
    pub output_name: String,
    pub binary: Vec<u8>,
}

/// Error decoding a [`BinaryUpdate`] frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is missing a NUL delimiter")]
    MissingDelimiter,
    #[error("frame header is not valid UTF-8")]
    InvalidUtf8,
}

impl BinaryUpdate {
    pub fn new(
        node_id: impl Into<String>,
        output_name: impl Into<String>,
        binary: Vec<u8>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            output_name: output_name.into(),
            binary,
        }
    }

    /// Bit-exact frame encoding: UTF-8 `node_id` bytes, `0x00`, UTF-8
    /// `output_name` bytes, `0x00`, then the raw payload with no length
    /// prefix. The transport frame boundary delimits the payload.
    #[must_use]
    pub fn to_frame_bytes(&self) -> Vec<u8> {
        let mut frame =
            Vec::with_capacity(self.node_id.len() + self.output_name.len() + self.binary.len() + 2);
        frame.extend_from_slice(self.node_id.as_bytes());
        frame.push(0);
        frame.extend_from_slice(self.output_name.as_bytes());
        frame.push(0);
        frame.extend_from_slice(&self.binary);
        frame
    }

    /// Decode a complete frame produced by [`to_frame_bytes`](Self::to_frame_bytes).
    pub fn from_frame_bytes(frame: &[u8]) -> Result<Self, FrameError> {
        let first = frame
            .iter()
            .position(|b| *b == 0)
            .ok_or(FrameError::MissingDelimiter)?;
        let rest = &frame[first + 1..];
        let second = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(FrameError::MissingDelimiter)?;

        let node_id =
            std::str::from_utf8(&frame[..first]).map_err(|_| FrameError::InvalidUtf8)?;
        let output_name =
            std::str::from_utf8(&rest[..second]).map_err(|_| FrameError::InvalidUtf8)?;
        Ok(Self {
            node_id: node_id.to_string(),
            output_name: output_name.to_string(),
            binary: rest[second + 1..].to_vec(),
        })
    }
}

/// Terminal or intermediate status of the job itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Internal error relayed to the consumer; always terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}

/// Status of an external provider prediction, relayed by node behaviors
/// that dispatch through a provider; never produced by the scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub node_id: String,
    pub provider: String,
    pub model: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub metadata: FxHashMap<String, Value>,
}
