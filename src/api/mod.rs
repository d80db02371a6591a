/// HTTP API Layer
///
/// REST endpoints over the engine. It handles:
/// - Workflow CRUD with hot-reload into the registry
/// - Starting, resuming, cancelling and inspecting runs
/// - Approval decisions and inbound webhooks
/// - Cron schedule management

// Workflow management endpoints (POST/GET/PUT/DELETE)
pub mod workflows;

// Run lifecycle and approval endpoints
pub mod runs;

// Cron schedule endpoints
pub mod schedules;

// Inbound webhook endpoint (start or resume)
pub mod webhooks;

use crate::error::EngineError;
use crate::persistence::ScheduleStore;
use crate::runtime::engine::{ExecutionEngine, RunResult};
use crate::runtime::state::RunStatus;
use crate::workflow::{registry::WorkflowRegistry, storage::WorkflowStorage};
use axum::{http::StatusCode, response::Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Workflow storage for persistence
    pub storage: WorkflowStorage,
    /// Hot-reload registry for in-memory workflows
    pub registry: Arc<WorkflowRegistry>,
    /// Execution engine shared by every entry point
    pub engine: Arc<ExecutionEngine>,
    /// Cron schedules
    pub schedules: ScheduleStore,
}

/// Error half of every handler: a status plus `{ "error": ... }`
pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Map an engine error to its HTTP status
///
/// 404 for unknown targets, 409 for a busy thread, 422 for run-level failures
/// and 500 for storage failures.
pub fn engine_error(err: EngineError) -> ApiError {
    let status = match &err {
        EngineError::WorkflowNotFound { .. } | EngineError::ResumeTargetMissing { .. } => StatusCode::NOT_FOUND,
        EngineError::ThreadBusy { .. } => StatusCode::CONFLICT,
        e if e.is_infrastructure() => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("❌ Engine infrastructure failure: {}", err);
    } else {
        tracing::debug!("🔍 Engine refused request: {}", err);
    }
    (status, Json(json!({ "error": err })))
}

/// Storage or other infrastructure failure outside the engine
pub fn internal_error(context: &str, err: anyhow::Error) -> ApiError {
    tracing::error!("❌ {}: {:#}", context, err);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{}: {}", context, err))
}

/// A failed run is answered with 422 and the full result as body
pub fn run_response(result: RunResult) -> ApiResult<RunResult> {
    if result.status == RunStatus::Failed {
        let body = serde_json::to_value(&result).unwrap_or_else(|_| json!({ "status": "failed" }));
        return Err((StatusCode::UNPROCESSABLE_ENTITY, Json(body)));
    }
    Ok(Json(result))
}

/// All API routes; state is attached by the caller
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .merge(workflows::create_workflow_routes())
        .merge(runs::create_run_routes())
        .merge(schedules::create_schedule_routes())
        .merge(webhooks::create_webhook_routes())
}

pub use runs::create_run_routes;
pub use schedules::create_schedule_routes;
pub use webhooks::create_webhook_routes;
pub use workflows::create_workflow_routes;
