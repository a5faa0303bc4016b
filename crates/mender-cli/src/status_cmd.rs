//! `mender status` command: show workflow progress and per-task status.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use mender_db::queries::tasks as task_db;
use mender_db::queries::workflows as wf_db;

/// Run the status command.
///
/// When `workflow_id_str` is `Some`, shows detailed status for that
/// workflow. When `None`, lists recent workflows with a progress summary.
pub async fn run_status(pool: &PgPool, workflow_id_str: Option<&str>) -> Result<()> {
    match workflow_id_str {
        Some(id_str) => run_workflow_status(pool, id_str).await,
        None => run_overview(pool).await,
    }
}

/// Show detailed status for a single workflow.
async fn run_workflow_status(pool: &PgPool, workflow_id_str: &str) -> Result<()> {
    let workflow_id = Uuid::parse_str(workflow_id_str)
        .with_context(|| format!("invalid workflow ID: {workflow_id_str}"))?;

    let workflow = wf_db::get_workflow(pool, workflow_id)
        .await?
        .with_context(|| format!("workflow {workflow_id} not found"))?;

    println!("Workflow: {} ({})", workflow.name, workflow.id);
    println!("Status: {}", workflow.status);
    println!(
        "Created: {}",
        workflow.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "Updated: {}",
        workflow.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();

    // Progress summary.
    let progress = task_db::get_workflow_progress(pool, workflow_id).await?;
    println!("Progress: {}/{} completed", progress.completed, progress.total);
    println!(
        "  pending={} queued={} running={} completed={} failed={}",
        progress.pending, progress.queued, progress.running, progress.completed, progress.failed,
    );
    println!();

    // Per-task listing.
    let tasks = task_db::list_tasks_for_workflow(pool, workflow_id).await?;
    println!("Tasks:");
    for task in &tasks {
        let status_icon = match task.status.to_string().as_str() {
            "pending" => ".",
            "queued" => ">",
            "running" => "*",
            "completed" => "+",
            "failed" => "!",
            _ => " ",
        };
        let chain = task
            .next_task
            .as_deref()
            .map(|n| format!(" -> {n}"))
            .unwrap_or_default();
        println!(
            "  [{}] {} ({}, retries {}/{}){}",
            status_icon, task.name, task.status, task.retry_count, task.max_retries, chain
        );
        if let Some(error) = &task.error {
            println!("      error: {error}");
        }
    }

    Ok(())
}

/// List recent workflows with a progress summary.
async fn run_overview(pool: &PgPool) -> Result<()> {
    let workflows = wf_db::list_workflows(pool, 0, 50).await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<30} {:<12} {:>10}",
        "ID", "NAME", "STATUS", "PROGRESS"
    );
    println!("{}", "-".repeat(92));

    for workflow in &workflows {
        let progress = task_db::get_workflow_progress(pool, workflow.id).await?;
        let progress_str = format!("{}/{}", progress.completed, progress.total);
        let name_display = if workflow.name.len() > 28 {
            format!("{}...", &workflow.name[..25])
        } else {
            workflow.name.clone()
        };
        println!(
            "{:<38} {:<30} {:<12} {:>10}",
            workflow.id, name_display, workflow.status, progress_str
        );
    }

    Ok(())
}
