//! `mender serve` command: the HTTP submission API.
//!
//! `POST /workflows` persists a workflow and its tasks, then publishes
//! `workflow.created`; the engine processes take it from there. The read
//! side returns workflows with their tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use mender_core::bus::EventBus;
use mender_core::submit::{self, WorkflowSpec};
use mender_db::models::{Task, Workflow};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State and response types
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub bus: Arc<dyn EventBus>,
}

/// A workflow plus its tasks, as returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct WorkflowDetailResponse {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    10
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    bind: &str,
    port: u16,
) -> Result<()> {
    let app = build_router(AppState { pool, bus });
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("mender serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("mender serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_workflow(
    State(state): State<AppState>,
    Json(spec): Json<WorkflowSpec>,
) -> Result<axum::response::Response, AppError> {
    submit::validate_spec(&spec).map_err(|e| AppError::bad_request(format!("{e:#}")))?;

    let (workflow, tasks) = submit::submit_workflow(&state.pool, state.bus.as_ref(), &spec)
        .await
        .map_err(AppError::internal)?;

    Ok((
        StatusCode::CREATED,
        Json(WorkflowDetailResponse { workflow, tasks }),
    )
        .into_response())
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let (workflow, tasks) = submit::get_workflow_with_tasks(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;

    Ok(Json(WorkflowDetailResponse { workflow, tasks }).into_response())
}

async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<axum::response::Response, AppError> {
    let workflows =
        mender_db::queries::workflows::list_workflows(&state.pool, params.skip, params.limit)
            .await
            .map_err(AppError::internal)?;

    let mut results = Vec::with_capacity(workflows.len());
    for workflow in workflows {
        let tasks = mender_db::queries::tasks::list_tasks_for_workflow(&state.pool, workflow.id)
            .await
            .map_err(AppError::internal)?;
        results.push(WorkflowDetailResponse { workflow, tasks });
    }

    Ok(Json(results).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
