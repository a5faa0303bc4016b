//! Worker pool: consumes queued tasks, executes them, and advances the
//! chain.
//!
//! Workers are interchangeable; any worker may react to any `task.queued`
//! message. Each message is handled in a freshly spawned activation so a
//! slow handler never head-of-line-blocks the subscriber stream, bounded
//! by a semaphore. The claim transition (`{queued, pending} -> running`)
//! is a conditional update, so at most one worker executes a given
//! attempt; everyone else drops the message.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mender_db::models::{Task, TaskStatus, WorkflowStatus};
use mender_db::queries::{tasks as task_db, workflows as wf_db};

use crate::bus::{decode_message, publish_event, EventBus};
use crate::events::{Channel, TaskCompleted, TaskFailed, TaskQueued};
use crate::handler::{HandlerRegistry, TaskOutcome};
use crate::state;

/// A worker process.
pub struct Worker {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    handlers: Arc<HandlerRegistry>,
    concurrency: usize,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        bus: Arc<dyn EventBus>,
        handlers: Arc<HandlerRegistry>,
        concurrency: usize,
    ) -> Self {
        Self {
            pool,
            bus,
            handlers,
            concurrency,
        }
    }

    /// Run the subscription loop until `shutdown` is cancelled or the bus
    /// stream ends.
    ///
    /// In-flight handler activations are abandoned on shutdown; the
    /// failure detector reclaims their tasks on its next sweep.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut stream = self.bus.subscribe(&[Channel::TaskQueued]).await?;
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        info!(
            handlers = ?self.handlers.list(),
            concurrency = self.concurrency,
            "worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                message = stream.next() => {
                    let Some(message) = message else {
                        warn!("bus stream ended, worker stopping");
                        return Ok(());
                    };
                    let Some(event) = decode_message::<TaskQueued>(&message) else {
                        continue;
                    };

                    let permit = semaphore.clone().acquire_owned().await?;
                    let pool = self.pool.clone();
                    let bus = Arc::clone(&self.bus);
                    let handlers = Arc::clone(&self.handlers);

                    tokio::spawn(async move {
                        if let Err(e) = process_task(&pool, bus.as_ref(), &handlers, &event).await {
                            error!(
                                task_id = %event.task_id,
                                error = %e,
                                "failed to process task.queued"
                            );
                        }
                        drop(permit);
                    });
                }
            }
        }
    }
}

/// Process one `task.queued` notification end to end.
pub async fn process_task(
    pool: &PgPool,
    bus: &dyn EventBus,
    handlers: &HandlerRegistry,
    event: &TaskQueued,
) -> Result<()> {
    let Some(task) = task_db::get_task(pool, event.task_id).await? else {
        warn!(task_id = %event.task_id, "task not found, dropping message");
        return Ok(());
    };

    // Guard before claiming: anything past queued/pending means another
    // worker owns the attempt or the task is already terminal.
    if !matches!(task.status, TaskStatus::Queued | TaskStatus::Pending) {
        info!(
            task_id = %task.id,
            status = %task.status,
            "task not claimable, dropping message"
        );
        return Ok(());
    }

    if !state::claim_task(pool, task.id).await? {
        debug!(task_id = %task.id, "lost claim race, dropping message");
        return Ok(());
    }

    info!(task_id = %task.id, task_name = %task.name, retry_count = task.retry_count, "executing task");

    let outcome = match handlers.get(&task.task_type) {
        Some(handler) => handler.execute(&task).await,
        None => TaskOutcome::Failure(format!(
            "no handler registered for task type {:?}",
            task.task_type
        )),
    };

    match outcome {
        TaskOutcome::Success(result) => {
            if !state::complete_task(pool, task.id, &result).await? {
                // The stale sweep reclaimed the attempt while the handler
                // ran; the retry pipeline owns the task now.
                warn!(task_id = %task.id, "task no longer running at completion, result discarded");
                return Ok(());
            }
            publish_event(
                bus,
                &TaskCompleted {
                    workflow_id: task.workflow_id,
                    task_id: task.id,
                    task_name: task.name.clone(),
                },
            )
            .await;
            info!(task_id = %task.id, task_name = %task.name, "task completed");

            advance_chain(pool, bus, &task).await?;
        }
        TaskOutcome::Failure(reason) => {
            if !state::fail_task(pool, task.id, &reason).await? {
                warn!(task_id = %task.id, "task no longer running at failure, dropping");
                return Ok(());
            }
            publish_event(
                bus,
                &TaskFailed {
                    workflow_id: task.workflow_id,
                    task_id: task.id,
                    error: reason.clone(),
                },
            )
            .await;
            warn!(task_id = %task.id, task_name = %task.name, error = %reason, "task failed");
        }
    }

    Ok(())
}

/// After a successful task, queue its successor or complete the workflow.
async fn advance_chain(pool: &PgPool, bus: &dyn EventBus, task: &Task) -> Result<()> {
    let Some(next_name) = task.next_task.as_deref() else {
        // End of the chain: the workflow is done.
        let moved = wf_db::transition_workflow_status(
            pool,
            task.workflow_id,
            WorkflowStatus::Running,
            WorkflowStatus::Completed,
        )
        .await?;
        if moved > 0 {
            info!(workflow_id = %task.workflow_id, "workflow completed");
        }
        return Ok(());
    };

    let Some(next) = task_db::find_task_by_name(pool, task.workflow_id, next_name).await? else {
        // The chain names a task that does not exist. The workflow stays
        // running; surfacing this is an operator concern.
        error!(
            workflow_id = %task.workflow_id,
            next_task = next_name,
            "successor task not found, chain ends here"
        );
        return Ok(());
    };

    if !state::queue_task(pool, next.id).await? {
        debug!(task_id = %next.id, "successor already past pending, skipping");
        return Ok(());
    }

    publish_event(
        bus,
        &TaskQueued {
            workflow_id: next.workflow_id,
            task_id: next.id,
            task_name: next.name.clone(),
            task_type: next.task_type.clone(),
            payload: next.payload.clone(),
        },
    )
    .await;
    info!(
        workflow_id = %next.workflow_id,
        task_id = %next.id,
        task_name = %next.name,
        "queued successor task"
    );

    Ok(())
}
