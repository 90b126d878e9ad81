//! SSE bridge for per-task token streams.

use super::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

#[derive(Deserialize)]
pub struct StreamQuery {
    pub task_id: Option<String>,
}

/// `GET /api/v1/task/stream?task_id=…` — stream `{type, token|tool_name}`
/// events for one task; closes after `done`.
pub async fn task_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let Some(task_id) = query.task_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "task_id is required" })),
        )
            .into_response();
    };
    Sse::new(bridge(state, task_id))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("ping"),
        )
        .into_response()
}

/// Pump matching bus events into a channel the SSE stream drains. The bridge
/// task ends (and unsubscribes) when `done` arrives or the client goes away.
fn bridge(state: AppState, task_id: String) -> impl Stream<Item = Result<Event, Infallible>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<serde_json::Value>(32);
    let mut sub = state.bus.subscribe("stream.");

    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            if event.payload.get("task_id").and_then(|v| v.as_str()) != Some(task_id.as_str()) {
                continue;
            }
            let frame = match event.topic.as_str() {
                "stream.token" => json!({ "type": "token", "token": event.payload["token"] }),
                "stream.tool_call" => {
                    json!({ "type": "tool_call", "tool_name": event.payload["tool_name"] })
                }
                "stream.done" => json!({ "type": "done" }),
                _ => continue,
            };
            let done = frame["type"] == "done";
            if tx.send(frame).await.is_err() || done {
                break;
            }
        }
    });

    ReceiverStream::new(rx).map(|frame| Ok(Event::default().data(frame.to_string())))
}
