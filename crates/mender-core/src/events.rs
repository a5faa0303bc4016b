//! Bus channels and the typed event payloads carried on them.
//!
//! All payloads are JSON objects; UUIDs serialize as strings. Events are
//! notifications only -- the store remains authoritative, so consumers must
//! tolerate duplicates, reordering, and loss.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named pub/sub channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    WorkflowCreated,
    TaskQueued,
    TaskCompleted,
    TaskFailed,
    TaskRetry,
}

impl Channel {
    /// All channels, in the order observers usually subscribe to them.
    pub const ALL: [Channel; 5] = [
        Channel::WorkflowCreated,
        Channel::TaskQueued,
        Channel::TaskCompleted,
        Channel::TaskFailed,
        Channel::TaskRetry,
    ];

    /// The wire name of the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowCreated => "workflow.created",
            Self::TaskQueued => "task.queued",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskRetry => "task.retry",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow.created" => Ok(Self::WorkflowCreated),
            "task.queued" => Ok(Self::TaskQueued),
            "task.completed" => Ok(Self::TaskCompleted),
            "task.failed" => Ok(Self::TaskFailed),
            "task.retry" => Ok(Self::TaskRetry),
            other => Err(ChannelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an unknown channel name.
#[derive(Debug, Clone)]
pub struct ChannelParseError(pub String);

impl fmt::Display for ChannelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown channel: {:?}", self.0)
    }
}

impl std::error::Error for ChannelParseError {}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A typed event, bound to the channel it is published on.
pub trait Event: Serialize {
    const CHANNEL: Channel;
}

/// Published by the submission surface once a workflow and its tasks are
/// durably stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCreated {
    pub workflow_id: Uuid,
}

impl Event for WorkflowCreated {
    const CHANNEL: Channel = Channel::WorkflowCreated;
}

/// A task is ready for execution. Carries the descriptor a worker needs to
/// dispatch without an extra read, though workers still load the row as the
/// authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueued {
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub task_name: String,
    pub task_type: String,
    pub payload: serde_json::Value,
}

impl Event for TaskQueued {
    const CHANNEL: Channel = Channel::TaskQueued;
}

/// A worker finished a task successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub task_name: String,
}

impl Event for TaskCompleted {
    const CHANNEL: Channel = Channel::TaskCompleted;
}

/// A task attempt failed (handler failure or stale reclaim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailed {
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub error: String,
}

impl Event for TaskFailed {
    const CHANNEL: Channel = Channel::TaskFailed;
}

/// Emitted for observers after the retry engine re-queues a failed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRetry {
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub retry_count: i32,
}

impl Event for TaskRetry {
    const CHANNEL: Channel = Channel::TaskRetry;
}
