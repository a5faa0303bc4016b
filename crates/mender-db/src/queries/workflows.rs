//! Database query functions for the `workflows` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Workflow, WorkflowStatus};

/// Insert a new workflow row. Returns the inserted workflow with
/// server-generated defaults (id, status, timestamps).
pub async fn insert_workflow(pool: &PgPool, name: &str) -> Result<Workflow> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows (name) VALUES ($1) RETURNING *",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow")?;

    Ok(workflow)
}

/// Fetch a single workflow by ID.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow")?;

    Ok(workflow)
}

/// List workflows ordered by creation time, with offset/limit paging.
pub async fn list_workflows(pool: &PgPool, skip: i64, limit: i64) -> Result<Vec<Workflow>> {
    let workflows = sqlx::query_as::<_, Workflow>(
        "SELECT * FROM workflows ORDER BY created_at ASC OFFSET $1 LIMIT $2",
    )
    .bind(skip)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list workflows")?;

    Ok(workflows)
}

/// Atomically transition a workflow from one status to another.
///
/// The UPDATE's WHERE clause includes `status = $from`, so the row is only
/// updated when the current status matches. Returns the number of rows
/// affected (0 means the status did not match -- a conflict, not an error).
pub async fn transition_workflow_status(
    pool: &PgPool,
    id: Uuid,
    from: WorkflowStatus,
    to: WorkflowStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflows \
         SET status = $1, updated_at = NOW() \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition workflow status")?;

    Ok(result.rows_affected())
}

/// Delete a workflow. Tasks are removed by the ON DELETE CASCADE constraint.
pub async fn delete_workflow(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete workflow")?;

    Ok(result.rows_affected())
}
