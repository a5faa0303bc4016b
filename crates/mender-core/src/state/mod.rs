//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks. The allowed graph
//! is enforced here; atomicity is enforced by the store's conditional
//! updates, so concurrent actors in separate processes race safely: the
//! loser of a transition observes a conflict and drops its message.

use anyhow::{bail, Result};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use mender_db::models::{Task, TaskStatus};
use mender_db::queries::tasks as db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending -> queued     (orchestrator, chain advance)
/// pending -> running    (worker claims an entry task directly)
/// queued  -> running    (worker claim)
/// running -> completed  (handler success)
/// running -> failed     (handler failure, stale reclaim)
/// failed  -> queued     (retry within budget)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Queued)
                | (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Queued)
        )
    }

    /// Execute a single-edge transition with a conditional update.
    ///
    /// Returns `Ok(true)` if the row was moved, `Ok(false)` on conflict
    /// (the current status did not match `from` -- another actor advanced
    /// the task first). Invalid edges are an error: they indicate a bug in
    /// the caller, not a race.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid state transition: {} -> {} for task {}",
                from,
                to,
                task_id
            );
        }

        let rows = db::transition_task_status(pool, task_id, from, to).await?;
        if rows == 0 {
            debug!(task_id = %task_id, from = %from, to = %to, "transition conflict");
        }
        Ok(rows > 0)
    }
}

/// Queue a pending task for execution: `pending -> queued`.
pub async fn queue_task(pool: &PgPool, task_id: Uuid) -> Result<bool> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Pending, TaskStatus::Queued).await
}

/// Claim a task for execution: `{queued, pending} -> running`.
///
/// At most one claimant wins; the rest observe `false` and drop.
pub async fn claim_task(pool: &PgPool, task_id: Uuid) -> Result<bool> {
    let rows = db::claim_task(pool, task_id).await?;
    if rows == 0 {
        debug!(task_id = %task_id, "claim conflict");
    }
    Ok(rows > 0)
}

/// Record a successful execution: `running -> completed` plus the result.
pub async fn complete_task(
    pool: &PgPool,
    task_id: Uuid,
    result: &serde_json::Value,
) -> Result<bool> {
    let rows = db::complete_task(pool, task_id, result).await?;
    if rows == 0 {
        debug!(task_id = %task_id, "complete conflict");
    }
    Ok(rows > 0)
}

/// Record a failed execution: `running -> failed` plus the reason.
pub async fn fail_task(pool: &PgPool, task_id: Uuid, error: &str) -> Result<bool> {
    let rows = db::fail_task(pool, task_id, error).await?;
    if rows == 0 {
        debug!(task_id = %task_id, "fail conflict");
    }
    Ok(rows > 0)
}

/// Re-queue a failed task for another attempt: `failed -> queued` with the
/// retry counter incremented and the error cleared.
///
/// Guarded on the retry count the caller observed, so duplicate failure
/// deliveries cannot double-increment, and on the budget
/// (`retry_count < max_retries`) so the counter never exceeds it.
pub async fn requeue_task(pool: &PgPool, task: &Task) -> Result<bool> {
    let rows = db::requeue_for_retry(pool, task.id, task.retry_count).await?;
    if rows == 0 {
        debug!(task_id = %task.id, retry_count = task.retry_count, "requeue conflict");
    }
    Ok(rows > 0)
}
