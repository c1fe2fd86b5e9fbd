//! Core identifier and status types shared across the engine.
//!
//! These are the vocabulary types every other module speaks: job and node
//! lifecycle states and the compute device a run is pinned to. Wire-visible
//! message types live in [`crate::message`]; graph structure lives in
//! [`crate::graph`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
///
/// A job starts in [`Starting`](Self::Starting), moves to
/// [`Running`](Self::Running) once the graph has validated, and ends in
/// exactly one of the three terminal states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns `true` once the job can no longer change state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a single node within a run.
///
/// `Booting` and `Retrying` are intermediate states a node's own behavior
/// may surface while it retries a transient external failure; the scheduler
/// relays them but never produces them itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Booting,
    Retrying,
    Completed,
    Failed,
}

impl NodeStatus {
    /// Returns `true` for [`Completed`](Self::Completed) and
    /// [`Failed`](Self::Failed).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Booting => "booting",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Compute device a run is pinned to.
///
/// Node behaviors that hold device-resident resources receive the context's
/// device through `NodeBehavior::move_to_device`; the engine itself only
/// carries the selection.
///
/// # Examples
///
/// ```
/// use loomflow::types::Device;
///
/// assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(1));
/// assert_eq!(Device::Cpu.to_string(), "cpu");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
    Mps,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(index) => write!(f, "cuda:{index}"),
            Self::Mps => write!(f, "mps"),
        }
    }
}

/// Error returned when a device string does not parse.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized device: {0}")]
pub struct DeviceParseError(String);

impl FromStr for Device {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "mps" => Ok(Self::Mps),
            "cuda" => Ok(Self::Cuda(0)),
            other => {
                if let Some(index) = other.strip_prefix("cuda:") {
                    index
                        .parse::<u32>()
                        .map(Self::Cuda)
                        .map_err(|_| DeviceParseError(other.to_string()))
                } else {
                    Err(DeviceParseError(other.to_string()))
                }
            }
        }
    }
}
