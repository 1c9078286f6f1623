//! REST handlers over the task router.
//!
//! Task results use the `{success, data, meta}` envelope with the HTTP status
//! derived from the task status; registry views return plain JSON.

use super::AppState;
use crate::coordination::{AgentRegistration, RouterError, TaskRequest, TaskResponse};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

// ── Request bodies ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RouteTaskBody {
    pub task_type: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub priority: Option<u8>,
    pub deadline_ms: Option<u64>,
    /// Bypass task-type resolution and target this pool directly.
    pub supervisor_type: Option<String>,
    pub task_id: Option<String>,
}

impl RouteTaskBody {
    fn into_parts(self) -> (TaskRequest, Option<String>) {
        let mut request = TaskRequest::new(self.task_type, self.parameters);
        request.metadata = self.metadata;
        request.priority = self.priority;
        request.deadline_ms = self.deadline_ms;
        if let Some(task_id) = self.task_id {
            request = request.with_task_id(task_id);
        }
        (request, self.supervisor_type)
    }
}

// ── Envelope helpers ─────────────────────────────────────────────

fn status_for(response: &TaskResponse) -> StatusCode {
    StatusCode::from_u16(response.status.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Wrap a task response in the caller-facing envelope.
pub fn task_envelope(response: &TaskResponse) -> (StatusCode, Value) {
    let status = status_for(response);
    let mut meta = json!({
        "task_id": response.task_id,
        "status": response.status.as_str(),
        "processing_time_ms": response.metrics.processing_time_ms,
        "queue_time_ms": response.metrics.queue_time_ms,
        "retry_count": response.metrics.retry_count,
        "tokens_used": response.metrics.tokens_used,
        "cost_usd": response.metrics.cost_usd,
    });
    if !response.warnings.is_empty() {
        meta["warnings"] = json!(response.warnings);
    }

    let body = if response.status.is_success() {
        json!({
            "success": true,
            "data": response.result.clone().unwrap_or(Value::Null),
            "meta": meta,
        })
    } else {
        json!({
            "success": false,
            "error": {
                "code": response.error_code.as_deref().unwrap_or("TASK_FAILED"),
                "message": response.error_message.as_deref().unwrap_or("task failed"),
            },
            "meta": meta,
        })
    };
    (status, body)
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": { "code": code, "message": message.into() },
        })),
    )
        .into_response()
}

fn validation_response(err: &RouterError) -> Response {
    let violations: Vec<Value> = match err {
        RouterError::Validation(validation) => validation
            .violations
            .iter()
            .map(|v| json!({ "field": v.field, "message": v.message }))
            .collect(),
        _ => Vec::new(),
    };
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "success": false,
            "error": {
                "code": err.error_code(),
                "message": err.to_string(),
                "violations": violations,
            },
        })),
    )
        .into_response()
}

fn rejection_response(rejection: &JsonRejection) -> Response {
    error_response(rejection.status(), "INVALID_BODY", rejection.body_text())
}

// ── Tasks ────────────────────────────────────────────────────────

/// POST /api/tasks — route a task and wait for its result
pub async fn handle_route_task(
    State(state): State<AppState>,
    body: Result<Json<RouteTaskBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_response(&rejection),
    };
    let (request, supervisor_type) = body.into_parts();
    let task_id = request.task_id.clone();

    let response = match state
        .router
        .route_task(request, supervisor_type.as_deref())
        .await
    {
        Ok(response) => response,
        Err(err @ RouterError::Validation(_)) => return validation_response(&err),
        Err(err) => err.to_task_response(&task_id),
    };

    let (status, body) = task_envelope(&response);
    (status, Json(body)).into_response()
}

/// DELETE /api/tasks/{id} — cancel an in-flight task
pub async fn handle_cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    if state.router.cancel_task(&id) {
        Json(json!({ "task_id": id, "cancelled": true })).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "UNKNOWN_TASK",
            format!("task `{id}` is not in flight"),
        )
    }
}

// ── Registry ─────────────────────────────────────────────────────

/// GET /api/supervisors
pub async fn handle_list_supervisors(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "supervisors": state.router.get_supervisors() }))
}

/// GET /api/agents
pub async fn handle_list_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "agents": state.router.get_registered_agents() }))
}

/// GET /api/agents/{id}
pub async fn handle_agent_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.router.get_agent_status(&id) {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.error_code(), err.to_string()),
    }
}

/// POST /api/agents — register an agent or supervisor
pub async fn handle_register_agent(
    State(state): State<AppState>,
    body: Result<Json<AgentRegistration>, JsonRejection>,
) -> Response {
    let Json(registration) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_response(&rejection),
    };
    match state.router.register_agent(registration).await {
        Ok(registration) => (StatusCode::CREATED, Json(registration)).into_response(),
        Err(err) => validation_response(&err),
    }
}

/// GET /api/stats
pub async fn handle_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.get_stats())
}
