/// Run lifecycle endpoints
///
/// Thin adapters over the engine entry points. A run that ends `failed` is
/// answered with 422; protocol errors map through `engine_error`.
use crate::api::{api_error, engine_error, run_response, ApiResult, AppState};
use crate::persistence::{Checkpoint, Suspension};
use crate::runtime::engine::RunResult;
use crate::runtime::events::{ApprovalDecision, ResumeEvent};
use crate::runtime::state::RunState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub workflow_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Latest state of a thread plus what it is parked on
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadView {
    pub state: RunState,
    pub suspension: Option<Suspension>,
}

pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route("/api/runs", post(start_run))
        .route("/api/runs/{thread_id}", get(get_run))
        .route("/api/runs/{thread_id}/resume", post(resume_run))
        .route("/api/runs/{thread_id}/cancel", post(cancel_run))
        .route("/api/runs/{thread_id}/checkpoints", get(list_checkpoints))
        .route("/api/approvals/{approval_id}", post(decide_approval))
}

/// POST /api/runs
/// Body: { "workflowId": "...", "input": {...}, "threadId": "optional" }
async fn start_run(State(state): State<AppState>, Json(request): Json<StartRunRequest>) -> ApiResult<RunResult> {
    tracing::info!("🚀 Run requested for workflow {}", request.workflow_id);
    let result = state
        .engine
        .start_run(&request.workflow_id, request.input, request.thread_id)
        .await
        .map_err(engine_error)?;
    run_response(result)
}

/// POST /api/runs/{thread_id}/resume
/// Body: { "kind": "webhook" | "approval" | "timer" | "timed_out", ... }
async fn resume_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(event): Json<ResumeEvent>,
) -> ApiResult<RunResult> {
    tracing::info!("▶️ Resume requested for thread {} ({})", thread_id, event.kind());
    let result = state.engine.resume_run(&thread_id, event).await.map_err(engine_error)?;
    run_response(result)
}

/// POST /api/runs/{thread_id}/cancel
async fn cancel_run(State(state): State<AppState>, Path(thread_id): Path<String>) -> ApiResult<Value> {
    if state.engine.cancel(&thread_id).await.map_err(engine_error)? {
        Ok(Json(json!({ "threadId": thread_id, "cancelled": true })))
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            format!("thread '{}' has nothing to cancel", thread_id),
        ))
    }
}

/// GET /api/runs/{thread_id}
async fn get_run(State(state): State<AppState>, Path(thread_id): Path<String>) -> ApiResult<ThreadView> {
    let run_state = state
        .engine
        .state(&thread_id)
        .await
        .map_err(engine_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("thread '{}' not found", thread_id)))?;
    let suspension = state.engine.suspension(&thread_id).await.map_err(engine_error)?;
    Ok(Json(ThreadView {
        state: run_state,
        suspension,
    }))
}

/// GET /api/runs/{thread_id}/checkpoints?limit=N
///
/// Most recent first.
async fn list_checkpoints(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<Checkpoint>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let history = state.engine.history(&thread_id, limit).await.map_err(engine_error)?;
    if history.is_empty() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("thread '{}' not found", thread_id)));
    }
    Ok(Json(history))
}

/// POST /api/approvals/{approval_id}
/// Body: { "decision": "approve" | "reject", "comment": "optional" }
async fn decide_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Json(request): Json<ApprovalRequest>,
) -> ApiResult<RunResult> {
    tracing::info!("✋ Approval {} decided: {}", approval_id, request.decision.as_str());
    let result = state
        .engine
        .resume_approval(&approval_id, request.decision, request.comment)
        .await
        .map_err(engine_error)?;
    run_response(result)
}
