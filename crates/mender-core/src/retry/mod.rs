//! Retry engine: reschedules failed tasks with exponential backoff until
//! the per-task budget is exhausted.
//!
//! Subscribes to `task.failed`. Each failure is handled in a freshly
//! spawned activation so one long backoff sleep never blocks other
//! failures. The requeue transition is guarded on the observed retry
//! count, so duplicate deliveries and concurrent engines cannot
//! double-spend the budget.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use rand::Rng;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mender_db::models::{TaskStatus, WorkflowStatus};
use mender_db::queries::{tasks as task_db, workflows as wf_db};

use crate::bus::{decode_message, publish_event, EventBus};
use crate::config::EngineConfig;
use crate::events::{Channel, TaskFailed, TaskQueued, TaskRetry};
use crate::state;

/// The retry engine process.
pub struct RetryEngine {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: EngineConfig,
}

impl RetryEngine {
    pub fn new(pool: PgPool, bus: Arc<dyn EventBus>, config: EngineConfig) -> Self {
        Self { pool, bus, config }
    }

    /// Run the subscription loop until `shutdown` is cancelled or the bus
    /// stream ends.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut stream = self.bus.subscribe(&[Channel::TaskFailed]).await?;
        info!("retry engine started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("retry engine shutting down");
                    return Ok(());
                }
                message = stream.next() => {
                    let Some(message) = message else {
                        warn!("bus stream ended, retry engine stopping");
                        return Ok(());
                    };
                    let Some(event) = decode_message::<TaskFailed>(&message) else {
                        continue;
                    };

                    let pool = self.pool.clone();
                    let bus = Arc::clone(&self.bus);
                    let config = self.config.clone();
                    // Spawned so the backoff sleep does not block the
                    // subscriber stream.
                    tokio::spawn(async move {
                        if let Err(e) = process_failure(&pool, bus.as_ref(), &config, &event).await {
                            error!(
                                task_id = %event.task_id,
                                error = %e,
                                "failed to process task.failed"
                            );
                        }
                    });
                }
            }
        }
    }
}

/// Process one `task.failed` notification: wait out the backoff and
/// re-queue the task, or log budget exhaustion.
pub async fn process_failure(
    pool: &PgPool,
    bus: &dyn EventBus,
    config: &EngineConfig,
    event: &TaskFailed,
) -> Result<()> {
    let Some(task) = task_db::get_task(pool, event.task_id).await? else {
        warn!(task_id = %event.task_id, "task not found, dropping message");
        return Ok(());
    };

    if task.status != TaskStatus::Failed {
        // Duplicate delivery, or another engine already requeued it.
        debug!(task_id = %task.id, status = %task.status, "task not failed, dropping message");
        return Ok(());
    }

    if task.retry_count >= task.max_retries {
        error!(
            task_id = %task.id,
            task_name = %task.name,
            retry_count = task.retry_count,
            max_retries = task.max_retries,
            "retry budget exhausted, task stays failed"
        );
        // The containing workflow cannot make progress past this task.
        let moved = wf_db::transition_workflow_status(
            pool,
            task.workflow_id,
            WorkflowStatus::Running,
            WorkflowStatus::Failed,
        )
        .await?;
        if moved > 0 {
            warn!(workflow_id = %task.workflow_id, "workflow failed");
        }
        return Ok(());
    }

    let wait = jittered(backoff_delay(
        config.backoff_base,
        config.backoff_cap,
        task.retry_count,
    ));
    info!(
        task_id = %task.id,
        task_name = %task.name,
        wait_secs = wait.as_secs_f64(),
        attempt = task.retry_count + 1,
        max_retries = task.max_retries,
        "scheduling retry"
    );
    tokio::time::sleep(wait).await;

    if !state::requeue_task(pool, &task).await? {
        debug!(task_id = %task.id, "requeue conflict, dropping message");
        return Ok(());
    }

    publish_event(
        bus,
        &TaskQueued {
            workflow_id: task.workflow_id,
            task_id: task.id,
            task_name: task.name.clone(),
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
        },
    )
    .await;
    publish_event(
        bus,
        &TaskRetry {
            workflow_id: task.workflow_id,
            task_id: task.id,
            retry_count: task.retry_count + 1,
        },
    )
    .await;

    Ok(())
}

/// Compute the backoff delay for a retry: `base * 2^retry_count`, capped.
pub fn backoff_delay(base: Duration, cap: Duration, retry_count: i32) -> Duration {
    // 2^30 already saturates any reasonable cap.
    let exp = retry_count.clamp(0, 30) as u32;
    let delay = base.saturating_mul(1u32 << exp.min(30));
    cmp::min(delay, cap)
}

/// Add up to 10% random jitter so simultaneous failures do not retry in
/// lock step.
fn jittered(delay: Duration) -> Duration {
    let max_jitter = delay.as_millis() as u64 / 10;
    if max_jitter == 0 {
        return delay;
    }
    let jitter = rand::rng().random_range(0..=max_jitter);
    delay + Duration::from_millis(jitter)
}
