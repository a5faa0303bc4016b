//! Workflow orchestrator: turns a freshly created workflow into queued
//! entry tasks.
//!
//! Subscribes to `workflow.created`. Entry tasks are those whose name is
//! not the `next_task` of any other task in the workflow; on a cyclic or
//! ambiguous chain the first task in creation order is the fallback. All
//! transitions are conditional, so redelivery of `workflow.created` is a
//! no-op: the entry tasks are already past `pending`.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mender_db::models::{Task, WorkflowStatus};
use mender_db::queries::{tasks as task_db, workflows as wf_db};

use crate::bus::{decode_message, publish_event, EventBus};
use crate::events::{Channel, TaskQueued, WorkflowCreated};
use crate::state;

/// The orchestrator process.
pub struct Orchestrator {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
}

impl Orchestrator {
    pub fn new(pool: PgPool, bus: Arc<dyn EventBus>) -> Self {
        Self { pool, bus }
    }

    /// Run the subscription loop until `shutdown` is cancelled or the bus
    /// stream ends.
    ///
    /// Handler errors (store unavailability) are logged and the message is
    /// lost to this actor; the failure detector and operator re-queue are
    /// the recovery paths. Nothing here aborts the process.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut stream = self.bus.subscribe(&[Channel::WorkflowCreated]).await?;
        info!("orchestrator started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("orchestrator shutting down");
                    return Ok(());
                }
                message = stream.next() => {
                    let Some(message) = message else {
                        warn!("bus stream ended, orchestrator stopping");
                        return Ok(());
                    };
                    let Some(event) = decode_message::<WorkflowCreated>(&message) else {
                        continue;
                    };
                    if let Err(e) = self.handle_workflow_created(event.workflow_id).await {
                        error!(
                            workflow_id = %event.workflow_id,
                            error = %e,
                            "failed to process workflow.created"
                        );
                    }
                }
            }
        }
    }

    /// Process one `workflow.created` notification: queue the entry tasks
    /// and move the workflow to `running`.
    pub async fn handle_workflow_created(&self, workflow_id: Uuid) -> Result<()> {
        let Some(workflow) = wf_db::get_workflow(&self.pool, workflow_id).await? else {
            warn!(workflow_id = %workflow_id, "workflow not found, dropping message");
            return Ok(());
        };

        let tasks = task_db::list_tasks_for_workflow(&self.pool, workflow_id).await?;

        if tasks.is_empty() {
            warn!(workflow_id = %workflow_id, "workflow has no tasks");
            let moved = wf_db::transition_workflow_status(
                &self.pool,
                workflow_id,
                WorkflowStatus::Pending,
                WorkflowStatus::Completed,
            )
            .await?;
            if moved > 0 {
                info!(workflow_id = %workflow_id, "empty workflow completed");
            }
            return Ok(());
        }

        for task in entry_tasks(&tasks) {
            if !state::queue_task(&self.pool, task.id).await? {
                // Another actor already advanced it (redelivery).
                debug!(task_id = %task.id, "entry task already past pending, skipping");
                continue;
            }
            publish_event(
                self.bus.as_ref(),
                &TaskQueued {
                    workflow_id,
                    task_id: task.id,
                    task_name: task.name.clone(),
                    task_type: task.task_type.clone(),
                    payload: task.payload.clone(),
                },
            )
            .await;
            info!(
                workflow_id = %workflow_id,
                task_id = %task.id,
                task_name = %task.name,
                "queued entry task"
            );
        }

        let moved = wf_db::transition_workflow_status(
            &self.pool,
            workflow_id,
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
        )
        .await?;
        if moved > 0 {
            info!(workflow_id = %workflow_id, name = %workflow.name, "workflow running");
        }

        Ok(())
    }
}

/// Select the entry tasks of a workflow: tasks whose `name` does not appear
/// in any other task's `next_task`.
///
/// If the computed set is empty (cyclic chain), fall back to the first task
/// in creation order so the workflow still makes progress. Callers must
/// pass a non-empty slice.
pub fn entry_tasks(tasks: &[Task]) -> Vec<&Task> {
    let successors: std::collections::HashSet<&str> = tasks
        .iter()
        .filter_map(|t| t.next_task.as_deref())
        .collect();

    let entries: Vec<&Task> = tasks
        .iter()
        .filter(|t| !successors.contains(t.name.as_str()))
        .collect();

    if entries.is_empty() {
        tasks.first().into_iter().collect()
    } else {
        entries
    }
}
