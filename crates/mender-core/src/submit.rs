//! Workflow submission service.
//!
//! Validates a workflow definition, inserts the workflow row and all task
//! rows in a single transaction, and publishes `workflow.created` once the
//! rows are durable. Both the HTTP surface and the CLI go through here, so
//! neither constructs rows on its own.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

use mender_db::models::{Task, Workflow};
use mender_db::queries::{tasks as task_db, workflows as wf_db};

use crate::bus::{publish_event, EventBus};
use crate::events::WorkflowCreated;

fn default_max_retries() -> i32 {
    3
}

fn default_payload() -> serde_json::Value {
    serde_json::json!({})
}

/// A single task in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    /// Task name, unique within the workflow; `next_task` references use it.
    pub name: String,
    /// Opaque tag the worker uses to pick an execution handler.
    pub task_type: String,
    /// Opaque structured value passed to the handler.
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
    /// Name of the successor task within the same workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_task: Option<String>,
    /// Retry budget: total attempts are bounded by `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

/// A workflow definition as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// Errors that can occur validating a workflow definition.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("workflow name must not be empty")]
    EmptyWorkflowName,

    #[error("task name must not be empty")]
    EmptyTaskName,

    #[error("duplicate task name: {0:?}")]
    DuplicateTaskName(String),

    #[error("task {task:?} references unknown next_task {successor:?}")]
    UnknownSuccessor { task: String, successor: String },

    #[error("task {0:?} has a negative retry budget")]
    NegativeRetryBudget(String),
}

/// Validate a workflow definition before touching the store.
///
/// Rejects: empty workflow name, empty or duplicate task names, negative
/// retry budgets, and `next_task` references that do not name a task in
/// the same definition. Cyclic chains are accepted -- the orchestrator
/// falls back to creation order for those.
pub fn validate_spec(spec: &WorkflowSpec) -> Result<(), SpecError> {
    if spec.name.trim().is_empty() {
        return Err(SpecError::EmptyWorkflowName);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for task in &spec.tasks {
        if task.name.trim().is_empty() {
            return Err(SpecError::EmptyTaskName);
        }
        if !seen.insert(task.name.as_str()) {
            return Err(SpecError::DuplicateTaskName(task.name.clone()));
        }
        if task.max_retries < 0 {
            return Err(SpecError::NegativeRetryBudget(task.name.clone()));
        }
    }

    for task in &spec.tasks {
        if let Some(next) = &task.next_task {
            if !seen.contains(next.as_str()) {
                return Err(SpecError::UnknownSuccessor {
                    task: task.name.clone(),
                    successor: next.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Insert a workflow and all its tasks inside a single transaction.
///
/// Returns the materialized rows. If any insert fails the transaction
/// rolls back and nothing is visible to the engine.
pub async fn create_workflow_with_tasks(
    pool: &PgPool,
    spec: &WorkflowSpec,
) -> Result<(Workflow, Vec<Task>)> {
    validate_spec(spec)?;

    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows (name) VALUES ($1) RETURNING *",
    )
    .bind(&spec.name)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert workflow")?;

    let mut tasks = Vec::with_capacity(spec.tasks.len());
    for task_spec in &spec.tasks {
        let task = sqlx::query_as::<_, Task>(
            "INSERT INTO tasks (workflow_id, name, task_type, payload, next_task, max_retries) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING *",
        )
        .bind(workflow.id)
        .bind(&task_spec.name)
        .bind(&task_spec.task_type)
        .bind(&task_spec.payload)
        .bind(&task_spec.next_task)
        .bind(task_spec.max_retries)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to insert task {:?}", task_spec.name))?;

        tasks.push(task);
    }

    tx.commit().await.context("failed to commit transaction")?;

    Ok((workflow, tasks))
}

/// Create a workflow and notify the orchestrator.
///
/// The rows are committed before `workflow.created` is published; if the
/// publish is lost the workflow sits in `pending` until an operator
/// re-queues it (the store is the source of truth).
pub async fn submit_workflow(
    pool: &PgPool,
    bus: &dyn EventBus,
    spec: &WorkflowSpec,
) -> Result<(Workflow, Vec<Task>)> {
    let (workflow, tasks) = create_workflow_with_tasks(pool, spec).await?;

    publish_event(
        bus,
        &WorkflowCreated {
            workflow_id: workflow.id,
        },
    )
    .await;

    tracing::info!(
        workflow_id = %workflow.id,
        name = %workflow.name,
        tasks = tasks.len(),
        "workflow submitted"
    );

    Ok((workflow, tasks))
}

/// Fetch a workflow and all its tasks.
pub async fn get_workflow_with_tasks(
    pool: &PgPool,
    workflow_id: uuid::Uuid,
) -> Result<Option<(Workflow, Vec<Task>)>> {
    let Some(workflow) = wf_db::get_workflow(pool, workflow_id).await? else {
        return Ok(None);
    };
    let tasks = task_db::list_tasks_for_workflow(pool, workflow_id).await?;
    Ok(Some((workflow, tasks)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(tasks: Vec<TaskSpec>) -> WorkflowSpec {
        WorkflowSpec {
            name: "wf".to_string(),
            tasks,
        }
    }

    fn task(name: &str, next_task: Option<&str>) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            task_type: "noop".to_string(),
            payload: serde_json::json!({}),
            next_task: next_task.map(str::to_string),
            max_retries: 3,
        }
    }

    #[test]
    fn valid_chain_passes() {
        let s = spec(vec![task("a", Some("b")), task("b", None)]);
        assert!(validate_spec(&s).is_ok());
    }

    #[test]
    fn zero_tasks_is_valid() {
        assert!(validate_spec(&spec(vec![])).is_ok());
    }

    #[test]
    fn cycle_is_accepted() {
        // The orchestrator breaks cycles with a creation-order fallback.
        let s = spec(vec![task("a", Some("b")), task("b", Some("a"))]);
        assert!(validate_spec(&s).is_ok());
    }

    #[test]
    fn empty_workflow_name_rejected() {
        let s = WorkflowSpec {
            name: "  ".to_string(),
            tasks: vec![],
        };
        assert!(validate_spec(&s).is_err());
    }

    #[test]
    fn duplicate_task_name_rejected() {
        let s = spec(vec![task("a", None), task("a", None)]);
        let err = validate_spec(&s).unwrap_err().to_string();
        assert!(err.contains("duplicate"), "unexpected error: {err}");
    }

    #[test]
    fn unknown_next_task_rejected() {
        let s = spec(vec![task("a", Some("ghost"))]);
        let err = validate_spec(&s).unwrap_err().to_string();
        assert!(err.contains("ghost"), "unexpected error: {err}");
    }

    #[test]
    fn negative_max_retries_rejected() {
        let mut t = task("a", None);
        t.max_retries = -1;
        assert!(validate_spec(&spec(vec![t])).is_err());
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let json = serde_json::json!({
            "name": "minimal",
            "tasks": [{"name": "a", "task_type": "noop"}]
        });
        let s: WorkflowSpec = serde_json::from_value(json).unwrap();
        assert_eq!(s.tasks[0].max_retries, 3);
        assert_eq!(s.tasks[0].payload, serde_json::json!({}));
        assert!(s.tasks[0].next_task.is_none());
    }
}
