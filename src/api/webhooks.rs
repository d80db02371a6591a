/// Inbound webhook endpoint
///
/// `ANY /webhook/{webhook_id}` either resumes the thread parked on that id or,
/// when nothing is parked there, starts a new run of the workflow whose start
/// node declares it as a trigger.
use crate::api::{api_error, engine_error, run_response, ApiResult, AppState};
use crate::runtime::engine::RunResult;
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode},
    routing::{any, Router},
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook/{webhook_id}", any(handle_webhook))
}

/// JSON when the body parses as JSON, the raw text otherwise
fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

fn headers_json(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.insert(name.as_str().to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(out)
}

/// Secret presented as `Authorization: Bearer <secret>` or `?token=<secret>`
fn presented_token<'a>(headers: &'a HeaderMap, query: &'a HashMap<String, String>) -> Option<&'a str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .or_else(|| query.get("token").map(String::as_str))
}

/// ANY /webhook/{webhook_id}
async fn handle_webhook(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<RunResult> {
    tracing::info!("📥 Webhook {} request received ({})", webhook_id, method);
    tracing::debug!("📄 Request body: {}", body);
    let payload = parse_body(&body);

    if let Some(result) = state
        .engine
        .deliver_webhook(&webhook_id, payload.clone())
        .await
        .map_err(engine_error)?
    {
        tracing::info!("▶️ Webhook {} resumed thread {}", webhook_id, result.thread_id);
        return run_response(result);
    }

    let Some((compiled, trigger)) = state.registry.find_webhook_trigger(&webhook_id) else {
        tracing::warn!("❌ Webhook called for unknown id: {}", webhook_id);
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no workflow or parked thread listens on webhook '{}'", webhook_id),
        ));
    };

    if let Some(secret) = trigger.secret.as_deref() {
        if presented_token(&headers, &query) != Some(secret) {
            tracing::warn!("🔒 Webhook {} rejected: bad or missing token", webhook_id);
            return Err(api_error(StatusCode::UNAUTHORIZED, "invalid webhook token"));
        }
    }

    let input = json!({
        "body": payload,
        "query": query,
        "headers": headers_json(&headers),
        "method": method.as_str(),
        "webhookId": webhook_id,
        "timestamp": Utc::now().to_rfc3339(),
    });

    tracing::info!("🚀 Webhook {} starting workflow {}", webhook_id, compiled.workflow.id);
    let result = state.engine.run(&compiled, input, None).await.map_err(engine_error)?;
    run_response(result)
}
