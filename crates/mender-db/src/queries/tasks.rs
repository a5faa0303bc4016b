//! Database query functions for the `tasks` table.
//!
//! Status transitions are conditional updates keyed on the expected prior
//! status. A return of 0 rows affected signals a conflict (another actor
//! already moved the row); callers treat that as a skip, not an error.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, status, retry_count, timestamps).
pub async fn insert_task(
    pool: &PgPool,
    workflow_id: Uuid,
    name: &str,
    task_type: &str,
    payload: &serde_json::Value,
    next_task: Option<&str>,
    max_retries: i32,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (workflow_id, name, task_type, payload, next_task, max_retries) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(workflow_id)
    .bind(name)
    .bind(task_type)
    .bind(payload)
    .bind(next_task)
    .bind(max_retries)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a given workflow, ordered by creation time.
pub async fn list_tasks_for_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE workflow_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for workflow")?;

    Ok(tasks)
}

/// Look up a task by name within a workflow.
///
/// Names are unique per workflow, so this returns at most one row.
pub async fn find_task_by_name(
    pool: &PgPool,
    workflow_id: Uuid,
    name: &str,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE workflow_id = $1 AND name = $2",
    )
    .bind(workflow_id)
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("failed to find task by name")?;

    Ok(task)
}

// -----------------------------------------------------------------------
// State-machine queries
// -----------------------------------------------------------------------

/// Atomically transition a task from one status to another.
///
/// Uses a conditional update: the WHERE clause includes `status = $from`,
/// so the row is only updated if the current status matches the expected
/// value. Returns the number of rows affected (0 means conflict).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, updated_at = NOW() \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Claim a task for execution: conditionally move it to `running` from
/// either `queued` or `pending`.
///
/// The accepted prior set covers both the normal queued path and a
/// directly-delivered entry task. At most one worker wins the claim; the
/// rest observe 0 rows affected and drop the message.
pub async fn claim_task(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', updated_at = NOW() \
         WHERE id = $1 AND status IN ('queued', 'pending')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected())
}

/// Mark a running task completed and record its result.
pub async fn complete_task(
    pool: &PgPool,
    task_id: Uuid,
    result_value: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', result = $1, updated_at = NOW() \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(result_value)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Mark a running task failed and record the failure reason.
pub async fn fail_task(pool: &PgPool, task_id: Uuid, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', error = $1, updated_at = NOW() \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(error)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to fail task")?;

    Ok(result.rows_affected())
}

/// Re-queue a failed task for another attempt, atomically incrementing the
/// retry counter and clearing the recorded error.
///
/// Guarded on status, the observed retry count, and the retry budget, so a
/// concurrent actor (or a duplicate `task.failed` delivery) cannot double
/// the increment or push `retry_count` past `max_retries`.
pub async fn requeue_for_retry(
    pool: &PgPool,
    task_id: Uuid,
    current_retry_count: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'queued', \
             retry_count = retry_count + 1, \
             error = NULL, \
             updated_at = NOW() \
         WHERE id = $1 \
           AND status = 'failed' \
           AND retry_count = $2 \
           AND retry_count < max_retries",
    )
    .bind(task_id)
    .bind(current_retry_count)
    .execute(pool)
    .await
    .context("failed to requeue task for retry")?;

    Ok(result.rows_affected())
}

/// List tasks stuck in `running` whose last mutation is older than `cutoff`.
///
/// These are the stale tasks the failure detector reclaims: the worker
/// that owned them has died or hung.
pub async fn list_stale_running(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'running' AND updated_at < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stale running tasks")?;

    Ok(tasks)
}

// -----------------------------------------------------------------------
// Progress
// -----------------------------------------------------------------------

/// Status counts for a workflow's tasks.
#[derive(Debug, Clone, Default)]
pub struct WorkflowProgress {
    pub pending: i64,
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// Get a summary of task counts by status for a given workflow.
pub async fn get_workflow_progress(pool: &PgPool, workflow_id: Uuid) -> Result<WorkflowProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM tasks \
         WHERE workflow_id = $1 \
         GROUP BY status",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to get workflow progress")?;

    let mut progress = WorkflowProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "queued" => progress.queued = *count,
            "running" => progress.running = *count,
            "completed" => progress.completed = *count,
            "failed" => progress.failed = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}
