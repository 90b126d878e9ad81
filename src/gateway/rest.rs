//! REST inspection surface: health, metrics, tasks, sessions, config.

use super::AppState;
use crate::store::TaskStatus;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db_ok = state.store.ping();
    let replay_backlog = state.store.total_events().unwrap_or(0);
    Json(json!({
        "healthy": db_ok,
        "db_ok": db_ok,
        "policy_version": state.policy.version(),
        "skill_runtime": "none",
        "replay_backlog_events": replay_backlog,
        "agent_count": state.registry.list_running_agents().len(),
    }))
}

pub async fn version() -> Json<serde_json::Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn metrics_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut snapshot = state.metrics.snapshot(state.bus.dropped_events());
    if let Ok((queued, running)) = state.store.task_counts() {
        snapshot["tasks_queued"] = json!(queued);
        snapshot["tasks_running"] = json!(running);
    }
    Json(snapshot)
}

pub async fn metrics_prometheus(State(state): State<AppState>) -> Response {
    let body = state.metrics.prometheus(state.bus.dropped_events());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct TasksQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TasksQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        Some(label) => match TaskStatus::from_label(label) {
            Some(status) => Some(status),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("unknown status filter: {label}"),
                )
            }
        },
        None => None,
    };
    let limit = query.limit.unwrap_or(50).min(500);
    let offset = query.offset.unwrap_or(0);
    match state.store.list_tasks(status, limit, offset) {
        Ok(tasks) => Json(json!({ "tasks": tasks, "limit": limit, "offset": offset }))
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.store.get_task(&task_id) {
        Ok(Some(task)) => Json(json!({ "task": task })).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("task not found: {task_id}")),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct SessionsQuery {
    pub limit: Option<u32>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Response {
    match state.store.list_sessions(query.limit.unwrap_or(50).min(500)) {
        Ok(sessions) => Json(json!({ "sessions": sessions })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn session_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.store.history(&session_id) {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Skill execution is delegated to an external runtime; the catalog here is
/// whatever that runtime reported (none by default).
pub async fn skills() -> Json<serde_json::Value> {
    Json(json!({ "skills": [] }))
}

/// Config fingerprint and policy version only. Never any secret material.
pub async fn api_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "config_hash": state.config.fingerprint(),
        "policy_version": state.policy.version(),
    }))
}

pub async fn plans(State(state): State<AppState>) -> Response {
    match state.store.list_subtasks(None) {
        Ok(subtasks) => {
            let plans: Vec<serde_json::Value> = subtasks
                .iter()
                .map(|s| {
                    json!({
                        "plan_id": s.subtask_id,
                        "parent_task_id": s.parent_task_id,
                        "agent_id": s.agent_id,
                        "summary": s.content,
                        "created_at": s.created_at,
                    })
                })
                .collect();
            Json(json!({ "plans": plans })).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
