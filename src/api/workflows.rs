/// Workflow management REST API endpoints
///
/// CRUD over workflow definitions. Every write is validated by compiling the
/// definition first, then persisted and published to the registry, so a
/// definition that would not run is never stored.
use crate::api::{api_error, internal_error, ApiResult, AppState};
use crate::workflow::{registry::CompiledWorkflow, types::Workflow};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
}

/// Request body for workflow creation
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub workflow: Workflow,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
}

/// Compile, persist and publish a definition
async fn save_and_publish(state: &AppState, workflow: Workflow) -> ApiResult<WorkflowResponse> {
    if let Err(e) = CompiledWorkflow::compile(workflow.clone()) {
        tracing::warn!("❌ Rejected workflow {}: {:#}", workflow.id, e);
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()));
    }

    state
        .storage
        .save_workflow(&workflow)
        .await
        .map_err(|e| internal_error("Failed to save workflow", e))?;

    state
        .registry
        .insert(workflow.clone())
        .map_err(|e| internal_error("Failed to publish workflow", e))?;

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: format!("Workflow '{}' saved", workflow.name),
    }))
}

/// POST /api/workflows
/// Body: { "workflow": { "id": "...", "name": "...", "nodes": [...], "edges": [...] } }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> ApiResult<WorkflowResponse> {
    let workflow = payload.workflow;
    if workflow.id.is_empty() || workflow.name.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "workflow id and name are required"));
    }

    match state.storage.get_workflow(&workflow.id).await {
        Ok(Some(_)) => {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!("workflow '{}' already exists", workflow.id),
            ))
        }
        Ok(None) => {}
        Err(e) => return Err(internal_error("Failed to look up workflow", e)),
    }

    let response = save_and_publish(&state, workflow).await?;
    tracing::info!("🔥 Created workflow: {}", response.0.id);
    Ok(response)
}

/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> ApiResult<Value> {
    let workflows = state
        .storage
        .list_workflows()
        .await
        .map_err(|e| internal_error("Failed to list workflows", e))?;
    Ok(Json(json!({ "workflows": workflows })))
}

/// GET /api/workflows/{id}
async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Workflow> {
    match state.storage.get_workflow(&id).await {
        Ok(Some(workflow)) => Ok(Json(workflow)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", id))),
        Err(e) => Err(internal_error("Failed to get workflow", e)),
    }
}

/// PUT /api/workflows/{id}
///
/// Runs already in flight keep the version they started with.
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> ApiResult<WorkflowResponse> {
    let mut workflow = payload.workflow;
    workflow.id = id.clone();
    if workflow.name.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "workflow name is required"));
    }

    match state.storage.get_workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", id))),
        Err(e) => return Err(internal_error("Failed to look up workflow", e)),
    }

    let response = save_and_publish(&state, workflow).await?;
    tracing::info!("🔥 Hot-reloaded workflow: {}", id);
    Ok(response)
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    state.registry.remove_workflow(&id);

    match state.storage.delete_workflow(&id).await {
        Ok(true) => {
            tracing::info!("🗑️ Deleted workflow: {}", id);
            Ok(Json(json!({ "message": "Workflow deleted successfully" })))
        }
        Ok(false) => Err(api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", id))),
        Err(e) => Err(internal_error("Failed to delete workflow", e)),
    }
}
