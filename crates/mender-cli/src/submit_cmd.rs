//! `mender submit` command: create a workflow from a TOML definition file
//! and notify the orchestrator.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;

use mender_core::bus::EventBus;
use mender_core::submit::{submit_workflow, validate_spec};

use crate::workflow_format::WorkflowToml;

/// Parse, validate, and submit a workflow definition file.
pub async fn run_submit(pool: &PgPool, bus: Arc<dyn EventBus>, file: &str) -> Result<()> {
    let path = Path::new(file);
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file {}", path.display()))?;

    let parsed: WorkflowToml = toml::from_str(&contents)
        .with_context(|| format!("failed to parse workflow file {}", path.display()))?;
    let spec = parsed.into_spec();
    validate_spec(&spec)?;

    let (workflow, tasks) = submit_workflow(pool, bus.as_ref(), &spec).await?;

    println!("Workflow submitted: {} ({})", workflow.name, workflow.id);
    for task in &tasks {
        let chain = task
            .next_task
            .as_deref()
            .map(|n| format!(" -> {n}"))
            .unwrap_or_default();
        println!("  {} [{}]{}", task.name, task.task_type, chain);
    }
    println!();
    println!("Track it with: mender status {}", workflow.id);

    Ok(())
}
