//! Failure detector: periodic sweep that reclaims tasks stuck in
//! `running`.
//!
//! A task whose worker died or hung keeps its `running` status forever on
//! its own; nothing else in the pipeline will touch it. The sweep moves
//! such tasks to `failed` with a distinguishing error so they enter the
//! normal retry pipeline. This is what makes the engine self-healing
//! against worker crashes, lost `task.completed` messages, and hangs.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mender_db::queries::tasks as task_db;

use crate::bus::{publish_event, EventBus};
use crate::config::EngineConfig;
use crate::events::TaskFailed;
use crate::state;

/// Error recorded on tasks reclaimed by the stale sweep.
pub const STALE_ERROR: &str = "Task execution timed out (Stale)";

/// The failure detector process.
pub struct FailureDetector {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: EngineConfig,
}

impl FailureDetector {
    pub fn new(pool: PgPool, bus: Arc<dyn EventBus>, config: EngineConfig) -> Self {
        Self { pool, bus, config }
    }

    /// Run the periodic sweep until `shutdown` is cancelled.
    ///
    /// A failed sweep (store unavailable) is logged and retried on the
    /// next tick; the detector never aborts.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            stale_timeout_secs = self.config.stale_timeout.as_secs(),
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "failure detector started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("failure detector shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "stale sweep failed");
                    }
                }
            }
        }
    }

    /// Run one sweep: fail every stale running task and publish
    /// `task.failed` for each. Returns the number of tasks reclaimed.
    pub async fn sweep(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_timeout)
                .context("stale timeout out of range")?;

        let stale = task_db::list_stale_running(&self.pool, cutoff).await?;
        let mut reclaimed = 0;

        for task in stale {
            if !state::fail_task(&self.pool, task.id, STALE_ERROR).await? {
                // The worker finished between the query and the update.
                debug!(task_id = %task.id, "stale candidate resolved itself, skipping");
                continue;
            }
            warn!(
                task_id = %task.id,
                task_name = %task.name,
                "stale task reclaimed, marked failed"
            );
            publish_event(
                self.bus.as_ref(),
                &TaskFailed {
                    workflow_id: task.workflow_id,
                    task_id: task.id,
                    error: STALE_ERROR.to_string(),
                },
            )
            .await;
            reclaimed += 1;
        }

        Ok(reclaimed)
    }
}
