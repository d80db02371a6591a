/// Cron schedule endpoints
use crate::api::{api_error, internal_error, ApiResult, AppState};
use crate::persistence::schedule::next_fire;
use crate::persistence::Schedule;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleRequest {
    pub workflow_id: String,
    pub cron_expression: String,
}

#[derive(Debug, Deserialize)]
pub struct EnableRequest {
    pub enabled: bool,
}

pub fn create_schedule_routes() -> Router<AppState> {
    Router::new()
        .route("/api/schedules", get(list_schedules).post(create_schedule))
        .route("/api/schedules/{id}", get(get_schedule).delete(delete_schedule))
        .route("/api/schedules/{id}/enabled", post(set_enabled))
}

/// POST /api/schedules
/// Body: { "workflowId": "...", "cronExpression": "0 9 * * 1-5" }
async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<CreateScheduleRequest>,
) -> ApiResult<Schedule> {
    if state.registry.get_workflow(&request.workflow_id).is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("workflow '{}' not found", request.workflow_id),
        ));
    }
    if let Err(e) = next_fire(&request.cron_expression, Utc::now()) {
        return Err(api_error(StatusCode::BAD_REQUEST, e.to_string()));
    }

    let schedule = state
        .schedules
        .create(&request.workflow_id, &request.cron_expression)
        .await
        .map_err(|e| internal_error("Failed to create schedule", e))?;
    Ok(Json(schedule))
}

/// GET /api/schedules
async fn list_schedules(State(state): State<AppState>) -> ApiResult<Value> {
    let schedules = state
        .schedules
        .list()
        .await
        .map_err(|e| internal_error("Failed to list schedules", e))?;
    Ok(Json(json!({ "schedules": schedules })))
}

/// GET /api/schedules/{id}
async fn get_schedule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Schedule> {
    match state.schedules.get(&id).await {
        Ok(Some(schedule)) => Ok(Json(schedule)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("schedule '{}' not found", id))),
        Err(e) => Err(internal_error("Failed to get schedule", e)),
    }
}

/// POST /api/schedules/{id}/enabled
/// Body: { "enabled": true }
async fn set_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EnableRequest>,
) -> ApiResult<Schedule> {
    match state.schedules.set_enabled(&id, request.enabled).await {
        Ok(Some(schedule)) => Ok(Json(schedule)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("schedule '{}' not found", id))),
        Err(e) => Err(internal_error("Failed to update schedule", e)),
    }
}

/// DELETE /api/schedules/{id}
async fn delete_schedule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    match state.schedules.delete(&id).await {
        Ok(true) => Ok(Json(json!({ "message": "Schedule deleted successfully" }))),
        Ok(false) => Err(api_error(StatusCode::NOT_FOUND, format!("schedule '{}' not found", id))),
        Err(e) => Err(internal_error("Failed to delete schedule", e)),
    }
}
