//! OpenAI-compatible chat surface.
//!
//! `POST /v1/chat/completions` routes `agent:<id>` models to the named
//! agent, seeds prior messages into session history, and answers either as
//! one completion object or as an SSE stream of `delta` chunks. `GET
//! /v1/models` lists the synthetic `goclaw-v1` model plus one entry per
//! running agent.

use super::AppState;
use crate::engine::{ChunkSink, Engine, EngineError};
use crate::processor::approx_tokens;
use crate::registry::DEFAULT_AGENT_ID;
use crate::store::{HistoryRole, TaskRecord, TaskStatus};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    pub user: Option<String>,
    /// Accepted and ignored: the runtime drives tools autonomously.
    #[allow(dead_code)]
    pub tools: Option<Value>,
    #[allow(dead_code)]
    pub temperature: Option<f64>,
    #[allow(dead_code)]
    pub top_p: Option<f64>,
    #[allow(dead_code)]
    pub top_k: Option<u32>,
    #[allow(dead_code)]
    pub max_tokens: Option<u32>,
    #[allow(dead_code)]
    pub stop: Option<Value>,
    #[allow(dead_code)]
    pub response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| "goclaw-v1".to_string());
    let agent_id = model
        .strip_prefix("agent:")
        .map_or_else(|| DEFAULT_AGENT_ID.to_string(), str::to_string);

    let engine = match state.registry.engine(&agent_id) {
        Ok(engine) => engine,
        Err(_) => {
            return openai_error(
                StatusCode::NOT_FOUND,
                format!("model not found: {model}"),
            )
        }
    };

    let Some(last) = request.messages.last() else {
        return openai_error(StatusCode::BAD_REQUEST, "messages must not be empty");
    };
    if last.role != "user" {
        return openai_error(
            StatusCode::BAD_REQUEST,
            "last message must have role 'user'",
        );
    }
    let prompt = content_text(&last.content);
    if prompt.is_empty() {
        return openai_error(StatusCode::BAD_REQUEST, "last user message is empty");
    }

    // Deterministic session per (user, agent); anonymous requests get a
    // fresh session.
    let session_id = session_for(request.user.as_deref(), &agent_id);
    if let Err(e) = state.store.ensure_session(&session_id) {
        return openai_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    // Seed prior messages into history under their declared role.
    for message in &request.messages[..request.messages.len() - 1] {
        let Some(role) = HistoryRole::from_label(&message.role) else {
            return openai_error(
                StatusCode::BAD_REQUEST,
                format!("unknown message role: {}", message.role),
            );
        };
        let text = content_text(&message.content);
        if let Err(e) =
            state
                .store
                .append_history(&session_id, &agent_id, role, &text, approx_tokens(&text))
        {
            return openai_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    let prompt_tokens: u32 = request
        .messages
        .iter()
        .map(|m| approx_tokens(&content_text(&m.content)))
        .sum();
    let trace_id = uuid::Uuid::new_v4().to_string();

    if request.stream {
        stream_completion(state, engine, session_id, prompt, model, trace_id, prompt_tokens)
    } else {
        poll_completion(state, engine, &session_id, &prompt, &model, &trace_id, prompt_tokens)
            .await
    }
}

/// UUIDv5 over `goclaw:user:<user>:agent:<agent_id>` in the URL namespace.
pub fn session_for(user: Option<&str>, agent_id: &str) -> String {
    match user {
        Some(user) => uuid::Uuid::new_v5(
            &uuid::Uuid::NAMESPACE_URL,
            format!("goclaw:user:{user}:agent:{agent_id}").as_bytes(),
        )
        .to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    }
}

async fn poll_completion(
    state: AppState,
    engine: Engine,
    session_id: &str,
    prompt: &str,
    model: &str,
    trace_id: &str,
    prompt_tokens: u32,
) -> Response {
    let task_id = match engine.create_chat_task(session_id, prompt, trace_id) {
        Ok(id) => id,
        Err(e) => return engine_error(&e),
    };

    // Poll to terminal state. Client disconnect drops this future; no
    // artificial server timeout beyond the engine's task timeout.
    loop {
        match state.store.get_task(&task_id) {
            Ok(Some(task)) if task.status.is_terminal() => {
                return match task.status {
                    TaskStatus::Succeeded => {
                        let reply = reply_of(&task);
                        let completion_tokens = approx_tokens(&reply);
                        Json(json!({
                            "id": format!("chatcmpl-{task_id}"),
                            "object": "chat.completion",
                            "created": Utc::now().timestamp(),
                            "model": model,
                            "choices": [{
                                "index": 0,
                                "message": { "role": "assistant", "content": reply },
                                "finish_reason": "stop",
                            }],
                            "usage": usage(prompt_tokens, completion_tokens),
                        }))
                        .into_response()
                    }
                    _ => openai_error(
                        StatusCode::BAD_GATEWAY,
                        task.error
                            .unwrap_or_else(|| format!("task ended {}", task.status)),
                    ),
                };
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            Err(e) => return openai_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

fn stream_completion(
    state: AppState,
    engine: Engine,
    session_id: String,
    prompt: String,
    model: String,
    trace_id: String,
    prompt_tokens: u32,
) -> Response {
    // Subscribe first so the earliest tokens are not lost, then admit the
    // task while errors can still surface as plain HTTP.
    let mut sub = engine.subscribe_stream();
    let task_id = match engine.create_chat_task(&session_id, &prompt, &trace_id) {
        Ok(id) => id,
        Err(e) => return engine_error(&e),
    };

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let chat_id = format!("chatcmpl-{task_id}");
    let created = Utc::now().timestamp();

    tokio::spawn(async move {
        let _ = tx.send(chunk(&chat_id, created, &model, json!({ "role": "assistant" }), None, None));

        let chunk_tx = tx.clone();
        let (chat_id2, model2) = (chat_id.clone(), model.clone());
        let mut sink: ChunkSink = Box::new(move |token: String| {
            chunk_tx
                .send(chunk(
                    &chat_id2,
                    created,
                    &model2,
                    json!({ "content": token }),
                    None,
                    None,
                ))
                .map_err(|e| e.to_string())
        });
        engine
            .follow_stream(&mut sub, &task_id, &CancellationToken::new(), &mut sink)
            .await;

        let completion_tokens = state
            .store
            .get_task(&task_id)
            .ok()
            .flatten()
            .map_or(0, |task| approx_tokens(&reply_of(&task)));
        let _ = tx.send(chunk(
            &chat_id,
            created,
            &model,
            json!({}),
            Some("stop"),
            Some(usage(prompt_tokens, completion_tokens)),
        ));
        let _ = tx.send("[DONE]".to_string());
    });

    Sse::new(
        UnboundedReceiverStream::new(rx)
            .map(|data| Ok::<Event, Infallible>(Event::default().data(data))),
    )
    .into_response()
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let created = Utc::now().timestamp();
    let mut data = vec![json!({
        "id": "goclaw-v1",
        "object": "model",
        "created": created,
        "owned_by": "goclaw",
    })];
    for record in state.registry.list_running_agents() {
        data.push(json!({
            "id": format!("agent:{}", record.agent_id),
            "object": "model",
            "created": created,
            "owned_by": "goclaw",
        }));
    }
    Json(json!({ "object": "list", "data": data }))
}

/// OpenAI streamed chunk in the `delta` schema.
fn chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
    usage: Option<Value>,
) -> String {
    let mut frame = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
    });
    if let Some(usage) = usage {
        frame["usage"] = usage;
    }
    frame.to_string()
}

fn usage(prompt_tokens: u32, completion_tokens: u32) -> Value {
    json!({
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
        "total_tokens": prompt_tokens + completion_tokens,
    })
}

/// Extract the assistant text from a finished task's result payload.
fn reply_of(task: &TaskRecord) -> String {
    let raw = task.result.clone().unwrap_or_default();
    serde_json::from_str::<Value>(&raw)
        .ok()
        .and_then(|v| v.get("reply").and_then(|r| r.as_str()).map(String::from))
        .unwrap_or(raw)
}

/// OpenAI message content: a plain string or an array of text parts.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn engine_error(error: &EngineError) -> Response {
    match error {
        EngineError::QueueSaturated(_) => {
            openai_error(StatusCode::TOO_MANY_REQUESTS, error.to_string())
        }
        EngineError::Validation(message) => openai_error(StatusCode::BAD_REQUEST, message.clone()),
        EngineError::Store(e) => openai_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Errors in OpenAI shape, with `type` derived from the HTTP status.
fn openai_error(status: StatusCode, message: impl Into<String>) -> Response {
    let error_type = match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        _ => "api_error",
    };
    (
        status,
        Json(json!({
            "error": {
                "message": message.into(),
                "type": error_type,
                "param": null,
                "code": null,
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_identity_is_deterministic_per_user_agent() {
        let a = session_for(Some("U"), "default");
        let b = session_for(Some("U"), "default");
        assert_eq!(a, b);
        assert_ne!(a, session_for(Some("U"), "other"));
        assert_ne!(a, session_for(Some("V"), "default"));

        // Anonymous sessions are always fresh.
        assert_ne!(session_for(None, "default"), session_for(None, "default"));
    }

    #[test]
    fn test_content_text_shapes() {
        assert_eq!(content_text(&json!("hi")), "hi");
        assert_eq!(
            content_text(&json!([
                { "type": "text", "text": "a" },
                { "type": "text", "text": "b" },
            ])),
            "ab"
        );
        assert_eq!(content_text(&json!(42)), "");
    }

    #[test]
    fn test_chunk_uses_delta_schema() {
        let frame: Value =
            serde_json::from_str(&chunk("c1", 0, "m", json!({ "content": "x" }), None, None))
                .unwrap();
        assert_eq!(frame["object"], "chat.completion.chunk");
        assert_eq!(frame["choices"][0]["delta"]["content"], "x");
        assert!(frame["choices"][0].get("message").is_none());
        assert!(frame["choices"][0]["finish_reason"].is_null());

        let last: Value = serde_json::from_str(&chunk(
            "c1",
            0,
            "m",
            json!({}),
            Some("stop"),
            Some(usage(4, 2)),
        ))
        .unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(last["usage"]["total_tokens"], 6);
    }
}
