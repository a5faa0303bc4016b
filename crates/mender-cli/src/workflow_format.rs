//! TOML format types for workflow definition files.
//!
//! These types map directly to the `workflow.toml` on-disk format and are
//! deserialized via `serde` + the `toml` crate, then converted to the
//! engine's [`WorkflowSpec`].

use serde::{Deserialize, Serialize};

use mender_core::submit::{TaskSpec, WorkflowSpec};

/// Top-level structure of a `workflow.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowToml {
    /// Workflow metadata.
    pub workflow: WorkflowMeta,
    /// Tasks within the workflow.
    #[serde(default)]
    pub tasks: Vec<TaskToml>,
}

/// Workflow-level metadata in `[workflow]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMeta {
    /// Human-readable workflow name.
    pub name: String,
}

/// A single `[[tasks]]` entry in the workflow TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskToml {
    /// Unique task name within the workflow (referenced by `next_task`).
    pub name: String,
    /// Handler tag, e.g. "http_request" or "compute".
    pub task_type: String,
    /// Structured payload handed to the handler.
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    /// Name of the successor task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_task: Option<String>,
    /// Retry budget before the task is left failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

fn default_max_retries() -> i32 {
    3
}

fn empty_payload() -> serde_json::Value {
    serde_json::json!({})
}

impl WorkflowToml {
    /// Convert to the engine's submission type.
    pub fn into_spec(self) -> WorkflowSpec {
        WorkflowSpec {
            name: self.workflow.name,
            tasks: self
                .tasks
                .into_iter()
                .map(|t| TaskSpec {
                    name: t.name,
                    task_type: t.task_type,
                    payload: t.payload,
                    next_task: t.next_task,
                    max_retries: t.max_retries,
                })
                .collect(),
        }
    }
}
