//! JSON-RPC 2.0 over WebSocket.
//!
//! One read loop per client; outbound frames (responses and
//! server-originated notifications) serialize through the client's write
//! mutex. Every connection must open with `system.hello`; every method after
//! that passes the capability gate before dispatch.

use super::rpc::{
    self, capability_for, notification, response_err, response_ok, RpcError, RpcRequest,
    DOWNSTREAM_FAILURE, QUEUE_SATURATED,
};
use super::AppState;
use crate::engine::{ChunkSink, EngineError};
use crate::registry::{RegistryError, DEFAULT_AGENT_ID};
use crate::store::TaskStatus;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Most events one `session.events.subscribe` may replay.
const REPLAY_CAP: u64 = 64;

/// Page size for live event forwarding.
const LIVE_PAGE: u32 = 100;

/// Protocol version range answered by `system.hello`.
const PROTOCOL_MIN: u32 = 1;
const PROTOCOL_MAX: u32 = 1;

pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Same-origin requests carry no Origin header and always pass. When an
    // allowlist is configured, a presented Origin must match it. The gate
    // runs before the upgrade itself is examined.
    if let Some(origin) = headers.get(header::ORIGIN) {
        if !state.config.allowed_origins.is_empty() {
            let origin = origin.to_str().unwrap_or_default();
            let allowed = state
                .config
                .allowed_origins
                .iter()
                .any(|o| o == "*" || o == origin);
            if !allowed {
                return (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "error": "origin not allowed" })),
                )
                    .into_response();
            }
        }
    }
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| client_loop(state, socket)),
        Err(rejection) => rejection.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Per-client state
// ---------------------------------------------------------------------------

enum Writer {
    Socket(tokio::sync::Mutex<SplitSink<WebSocket, Message>>),
    #[cfg(test)]
    Channel(tokio::sync::mpsc::UnboundedSender<String>),
}

pub(super) struct Client {
    writer: Writer,
    handshaken: AtomicBool,
    /// Subscribed sessions and their high-water-mark event ids.
    sessions: Mutex<HashMap<String, i64>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl Client {
    fn new(sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self {
            writer: Writer::Socket(tokio::sync::Mutex::new(sink)),
            handshaken: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            forwarder: Mutex::new(None),
            closed: CancellationToken::new(),
        })
    }

    #[cfg(test)]
    fn test_pair() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Arc::new(Self {
                writer: Writer::Channel(tx),
                handshaken: AtomicBool::new(false),
                sessions: Mutex::new(HashMap::new()),
                forwarder: Mutex::new(None),
                closed: CancellationToken::new(),
            }),
            rx,
        )
    }

    async fn send_json(&self, frame: &Value) -> bool {
        match &self.writer {
            Writer::Socket(sink) => sink
                .lock()
                .await
                .send(Message::Text(frame.to_string()))
                .await
                .is_ok(),
            #[cfg(test)]
            Writer::Channel(tx) => tx.send(frame.to_string()).is_ok(),
        }
    }

    /// Close the connection with a policy-violation status.
    async fn close_policy_violation(&self, reason: &str) {
        match &self.writer {
            Writer::Socket(sink) => {
                let _ = sink
                    .lock()
                    .await
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: reason.to_string().into(),
                    })))
                    .await;
            }
            #[cfg(test)]
            Writer::Channel(tx) => {
                let _ = tx.send(format!("<close:{}:{reason}>", close_code::POLICY));
            }
        }
        self.closed.cancel();
    }

    fn shutdown(&self) {
        self.closed.cancel();
        if let Some(forwarder) = self.forwarder.lock().unwrap().take() {
            forwarder.abort();
        }
    }
}

async fn client_loop(state: AppState, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let client = Client::new(sink);
    state.metrics.ws_connections.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("WebSocket client connected");

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if !handle_frame(&state, &client, &text).await {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    client.shutdown();
    state.metrics.ws_connections.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!("WebSocket client disconnected");
}

/// Process one inbound frame. Returns `false` when the connection must
/// close.
async fn handle_frame(state: &AppState, client: &Arc<Client>, text: &str) -> bool {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            let err = RpcError::new(rpc::PARSE_ERROR, "parse error");
            return client.send_json(&response_err(&Value::Null, &err)).await;
        }
    };
    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(_) => {
            let err = RpcError::invalid_request("not a JSON-RPC request");
            return client.send_json(&response_err(&Value::Null, &err)).await;
        }
    };

    // A panicking handler must never tear the read loop down with it.
    let handle = tokio::spawn(dispatch(state.clone(), Arc::clone(client), request));
    match handle.await {
        Ok(Outcome::Reply(frame)) => client.send_json(&frame).await,
        Ok(Outcome::Silent) => true,
        Ok(Outcome::Close) => false,
        Err(join_error) => {
            tracing::error!(error = %join_error, "RPC handler panicked");
            let err = RpcError::internal("internal error");
            client.send_json(&response_err(&Value::Null, &err)).await
        }
    }
}

enum Outcome {
    Reply(Value),
    /// Notification input, or a deferred response owned by a spawned task.
    Silent,
    Close,
}

async fn dispatch(state: AppState, client: Arc<Client>, request: RpcRequest) -> Outcome {
    let id = request.id.clone().unwrap_or(Value::Null);
    let reply = |result: Result<Value, RpcError>| {
        if request.is_notification() {
            Outcome::Silent
        } else {
            match result {
                Ok(value) => Outcome::Reply(response_ok(&id, value)),
                Err(err) => Outcome::Reply(response_err(&id, &err)),
            }
        }
    };

    if request.jsonrpc.as_deref() != Some("2.0") {
        return reply(Err(RpcError::invalid_request("jsonrpc must be \"2.0\"")));
    }

    // Handshake gate: system.hello must come first on every connection.
    if request.method == "system.hello" {
        client.handshaken.store(true, Ordering::SeqCst);
        return reply(Ok(json!({
            "protocol": { "min": PROTOCOL_MIN, "max": PROTOCOL_MAX },
            "server": "goclaw",
            "version": env!("CARGO_PKG_VERSION"),
        })));
    }
    if !client.handshaken.load(Ordering::SeqCst) {
        return reply(Err(RpcError::invalid_request(
            "handshake required: call system.hello first",
        )));
    }

    // Capability gate. Unknown methods fail closed as method-not-found;
    // known methods are audited both ways.
    let Some(capability) = capability_for(&request.method) else {
        return reply(Err(RpcError::method_not_found(&request.method)));
    };
    let allowed = state.policy.allow_capability(capability);
    tracing::info!(
        target: "audit",
        method = %request.method,
        capability,
        allowed,
        "Capability decision"
    );
    if !allowed {
        return reply(Err(RpcError::invalid_params(format!(
            "capability denied: {capability}"
        ))));
    }

    match request.method.as_str() {
        "session.events.subscribe" => match subscribe_session(&state, &client, &request.params).await
        {
            Ok(SubscribeOutcome::Subscribed(result)) => reply(Ok(result)),
            Ok(SubscribeOutcome::ReplayTooLarge) => Outcome::Close,
            Err(err) => reply(Err(err)),
        },
        "agent.chat.stream" => {
            match chat_params(&request.params) {
                Ok((session_id, content, agent_id)) => {
                    spawn_chat_stream(state, client, id.clone(), session_id, content, agent_id);
                    Outcome::Silent
                }
                Err(err) => reply(Err(err)),
            }
        }
        method => reply(handle_method(&state, method, &request.params).await),
    }
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

async fn handle_method(state: &AppState, method: &str, params: &Value) -> Result<Value, RpcError> {
    match method {
        "system.status" => system_status(state),
        "agent.chat" => {
            let (session_id, content, agent_id) = chat_params(params)?;
            let trace_id = uuid::Uuid::new_v4().to_string();
            let task_id = state
                .registry
                .create_chat_task(&agent_id, &session_id, &content, &trace_id)
                .map_err(|e| map_registry_error(&e))?;
            Ok(json!({ "task_id": task_id }))
        }
        "agent.abort" => {
            let task_id = param_str(params, "task_id")?;
            let aborted = state
                .registry
                .abort_task(task_id)
                .await
                .map_err(|e| map_registry_error(&e))?;
            Ok(json!({ "aborted": aborted }))
        }
        "agent.create" => {
            let cfg = serde_json::from_value(params.clone())
                .map_err(|e| RpcError::invalid_params(format!("invalid agent config: {e}")))?;
            let record = state
                .registry
                .create_agent(cfg)
                .await
                .map_err(|e| map_registry_error(&e))?;
            Ok(json!({ "agent_id": record.agent_id, "status": "active" }))
        }
        "agent.remove" => {
            let agent_id = param_str(params, "agent_id")?;
            let timeout = params
                .get("drain_timeout_seconds")
                .and_then(Value::as_u64)
                .unwrap_or(5);
            state
                .registry
                .remove_agent(agent_id, std::time::Duration::from_secs(timeout))
                .await
                .map_err(|e| map_registry_error(&e))?;
            Ok(json!({ "removed": true }))
        }
        "agent.list" => {
            let agents = state
                .registry
                .list_agents()
                .map_err(|e| map_registry_error(&e))?;
            Ok(json!({ "agents": agents }))
        }
        "agent.status" => {
            let agent_id = param_str(params, "agent_id")?;
            let status = state
                .registry
                .agent_status(agent_id)
                .map_err(|e| map_registry_error(&e))?;
            Ok(serde_json::to_value(status).unwrap_or(Value::Null))
        }
        "session.list" => {
            let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(50);
            let sessions = state
                .store
                .list_sessions(u32::try_from(limit.min(500)).unwrap_or(50))
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(json!({ "sessions": sessions }))
        }
        "session.history" => {
            let session_id = param_str(params, "session_id")?;
            let history = state
                .store
                .history(session_id)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(json!({ "history": history }))
        }
        "session.purge" => {
            let session_id = param_str(params, "session_id")?;
            let up_to = params.get("up_to_event_id").and_then(Value::as_i64);
            let purged = state
                .store
                .purge_events(session_id, up_to)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            tracing::info!(target: "audit", session_id, purged, "Session events purged");
            Ok(json!({ "purged": purged }))
        }
        "approval.request" => {
            let action = param_str(params, "action")?;
            let details = params
                .get("details")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let record = state.approvals.request(action, details);
            Ok(json!({ "approval_id": record.approval_id, "status": "PENDING" }))
        }
        "approval.respond" => {
            let approval_id = param_str(params, "approval_id")?;
            let approve = params
                .get("approve")
                .and_then(Value::as_bool)
                .ok_or_else(|| RpcError::invalid_params("approve must be a boolean"))?;
            let status = state
                .approvals
                .respond(approval_id, approve)
                .map_err(|e| RpcError::invalid_params(e.to_string()))?;
            Ok(json!({ "status": status.to_string() }))
        }
        "approval.list" => Ok(json!({ "approvals": state.approvals.list() })),
        "incident.export" => {
            let task_id = param_str(params, "task_id")?;
            let task = state
                .store
                .get_task(task_id)
                .map_err(|e| RpcError::internal(e.to_string()))?
                .ok_or_else(|| RpcError::invalid_params(format!("task not found: {task_id}")))?;
            let events = state
                .store
                .events_for_task(&task.session_id, task_id)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(json!({
                "task": task,
                "events": events,
                "config_hash": state.config.fingerprint(),
                "exported_at": Utc::now(),
            }))
        }
        "cron.add" => {
            let record = crate::store::ScheduleRecord {
                schedule_id: uuid::Uuid::new_v4().to_string(),
                name: param_str(params, "name")?.to_string(),
                schedule: param_str(params, "schedule")?.to_string(),
                agent_id: params
                    .get("agent_id")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_AGENT_ID)
                    .to_string(),
                content: param_str(params, "content")?.to_string(),
                enabled: true,
                created_at: Utc::now(),
            };
            state
                .store
                .add_schedule(&record)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(json!({ "schedule_id": record.schedule_id }))
        }
        "cron.remove" => {
            let schedule_id = param_str(params, "schedule_id")?;
            let removed = state
                .store
                .remove_schedule(schedule_id)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            if !removed {
                return Err(RpcError::invalid_params(format!(
                    "schedule not found: {schedule_id}"
                )));
            }
            Ok(json!({ "removed": true }))
        }
        "cron.enable" | "cron.disable" => {
            let schedule_id = param_str(params, "schedule_id")?;
            let enabled = method == "cron.enable";
            let changed = state
                .store
                .set_schedule_enabled(schedule_id, enabled)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            if !changed {
                return Err(RpcError::invalid_params(format!(
                    "schedule not found: {schedule_id}"
                )));
            }
            Ok(json!({ "enabled": enabled }))
        }
        "cron.list" => {
            let schedules = state
                .store
                .list_schedules()
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(json!({ "schedules": schedules }))
        }
        "subtask.create" => {
            let parent_task_id = param_str(params, "parent_task_id")?;
            let content = param_str(params, "content")?;
            let parent = state
                .store
                .get_task(parent_task_id)
                .map_err(|e| RpcError::internal(e.to_string()))?
                .ok_or_else(|| {
                    RpcError::invalid_params(format!("task not found: {parent_task_id}"))
                })?;
            let agent_id = params
                .get("agent_id")
                .and_then(Value::as_str)
                .unwrap_or(&parent.agent_id);
            let trace_id = uuid::Uuid::new_v4().to_string();
            let task_id = state
                .registry
                .create_chat_task(agent_id, &parent.session_id, content, &trace_id)
                .map_err(|e| map_registry_error(&e))?;
            let record = crate::store::SubtaskRecord {
                subtask_id: uuid::Uuid::new_v4().to_string(),
                parent_task_id: parent_task_id.to_string(),
                task_id: task_id.clone(),
                agent_id: agent_id.to_string(),
                content: content.to_string(),
                created_at: Utc::now(),
            };
            state
                .store
                .add_subtask(&record)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(json!({ "subtask_id": record.subtask_id, "task_id": task_id }))
        }
        "subtask.list" => {
            let parent = params.get("parent_task_id").and_then(Value::as_str);
            let subtasks = state
                .store
                .list_subtasks(parent)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(json!({ "subtasks": subtasks }))
        }
        "config.list" => {
            let overrides = state.overrides.lock().unwrap();
            let visible: serde_json::Map<String, Value> = overrides
                .iter()
                .filter(|(key, _)| !is_secret_key(key))
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect();
            Ok(json!({
                "config": visible,
                "config_hash": state.config.fingerprint(),
                "policy_version": state.policy.version(),
            }))
        }
        "config.set" => {
            let key = param_str(params, "key")?;
            let value = params
                .get("value")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .ok_or_else(|| RpcError::invalid_params("value is required"))?;
            state
                .overrides
                .lock()
                .unwrap()
                .insert(key.to_string(), value);
            tracing::info!(target: "audit", key, "Config override set");
            Ok(json!({ "updated": true }))
        }
        "config.model.set" => {
            let agent_id = param_str(params, "agent_id")?;
            let model = param_str(params, "model")?;
            state
                .registry
                .set_agent_model(agent_id, model)
                .map_err(|e| map_registry_error(&e))?;
            Ok(json!({ "updated": true }))
        }
        "policy.domain.add" => {
            let domain = param_str(params, "domain")?;
            state.policy.add_domain(domain);
            tracing::info!(target: "audit", domain, "Policy domain added");
            Ok(json!({ "added": true }))
        }
        other => Err(RpcError::method_not_found(other)),
    }
}

fn system_status(state: &AppState) -> Result<Value, RpcError> {
    let (queued, running) = state
        .store
        .task_counts()
        .map_err(|e| RpcError::internal(e.to_string()))?;
    let statuses = state.registry.statuses();
    let active_tasks: u64 = statuses.iter().map(|s| s.active_tasks).sum();
    let worker_count: u32 = statuses.iter().map(|s| s.worker_count).sum();
    let last_error = statuses.iter().find_map(|s| s.last_error.clone());
    Ok(json!({
        "policy_version": state.policy.version(),
        "config_hash": state.config.fingerprint(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "tasks": { "queued": queued, "running": running },
        "agent_count": statuses.len(),
        "active_tasks": active_tasks,
        "worker_count": worker_count,
        "last_error": last_error,
        "memory": { "rss_bytes": rss_bytes() },
        "agents": statuses,
    }))
}

// ---------------------------------------------------------------------------
// Event subscription + live forwarding
// ---------------------------------------------------------------------------

enum SubscribeOutcome {
    Subscribed(Value),
    ReplayTooLarge,
}

async fn subscribe_session(
    state: &AppState,
    client: &Arc<Client>,
    params: &Value,
) -> Result<SubscribeOutcome, RpcError> {
    let session_id = param_str(params, "session_id")?.to_string();
    let from_event_id = params
        .get("from_event_id")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let (min_id, max_id) = state
        .store
        .event_id_bounds(&session_id)
        .map_err(|e| RpcError::internal(e.to_string()))?;

    // Events before the earliest survivor are gone (purged); the caller must
    // resync from scratch.
    if from_event_id > 0 && min_id > 0 && from_event_id < min_id - 1 {
        return Err(RpcError::invalid_params("replay_gap"));
    }

    let pending = state
        .store
        .count_events_after(&session_id, from_event_id)
        .map_err(|e| RpcError::internal(e.to_string()))?;
    if pending > REPLAY_CAP {
        let note = notification(
            "system.backpressure",
            json!({
                "session_id": session_id,
                "reason": "replay_window_too_large",
                "max_events": REPLAY_CAP,
                "replayed": 0,
            }),
        );
        client.send_json(&note).await;
        client.close_policy_violation("replay window too large").await;
        return Ok(SubscribeOutcome::ReplayTooLarge);
    }

    let events = state
        .store
        .events_after(&session_id, from_event_id, u32::try_from(REPLAY_CAP).unwrap_or(64))
        .map_err(|e| RpcError::internal(e.to_string()))?;
    let replayed = events.len();
    for event in &events {
        client
            .send_json(&notification("session.event", json!({ "event": event })))
            .await;
    }

    let high_water_mark = events.last().map_or(from_event_id.max(0), |e| e.event_id);
    client
        .sessions
        .lock()
        .unwrap()
        .insert(session_id, high_water_mark);
    ensure_forwarder(state, client);

    Ok(SubscribeOutcome::Subscribed(json!({
        "subscribed": true,
        "replayed": replayed,
        "latest_event_id": max_id.max(high_water_mark),
    })))
}

/// Start the client's live forwarder on first subscription: one bus
/// subscription on the `task.` prefix; each signal pages any events past the
/// per-session high-water mark out of the store. This closes the gap between
/// bus signals and events written by workers in between.
fn ensure_forwarder(state: &AppState, client: &Arc<Client>) {
    let mut guard = client.forwarder.lock().unwrap();
    if guard.is_some() {
        return;
    }
    // Acquired synchronously so no event published after the subscribe call
    // returns can be missed.
    let mut sub = state.bus.subscribe("task.");
    let state = state.clone();
    let client = Arc::clone(client);
    *guard = Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                () = client.closed.cancelled() => break,
                event = sub.recv() => {
                    let Some(event) = event else { break };
                    let Some(session_id) = event
                        .payload
                        .get("session_id")
                        .and_then(Value::as_str)
                        .map(String::from)
                    else {
                        continue;
                    };
                    let mark = client.sessions.lock().unwrap().get(&session_id).copied();
                    let Some(mut mark) = mark else { continue };

                    let Ok(events) = state.store.events_after(&session_id, mark, LIVE_PAGE)
                    else {
                        continue;
                    };
                    for event in events {
                        mark = event.event_id;
                        if !client
                            .send_json(&notification("session.event", json!({ "event": event })))
                            .await
                        {
                            return;
                        }
                        client
                            .sessions
                            .lock()
                            .unwrap()
                            .insert(session_id.clone(), mark);
                    }
                }
            }
        }
    }));
}

// ---------------------------------------------------------------------------
// Chat streaming
// ---------------------------------------------------------------------------

fn spawn_chat_stream(
    state: AppState,
    client: Arc<Client>,
    id: Value,
    session_id: String,
    content: String,
    agent_id: String,
) {
    tokio::spawn(async move {
        // Chunks flow through a channel so the engine's forward loop never
        // awaits the socket write mutex.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let writer = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    let note = notification("agent.chat.stream", json!({ "content": chunk }));
                    if !client.send_json(&note).await {
                        break;
                    }
                }
            })
        };

        let sink: ChunkSink = Box::new(move |chunk: String| {
            tx.send(chunk).map_err(|e| e.to_string())
        });
        let trace_id = uuid::Uuid::new_v4().to_string();
        let result = state
            .registry
            .stream_chat_task(
                &agent_id,
                &session_id,
                &content,
                &trace_id,
                client.closed.child_token(),
                sink,
            )
            .await;
        let _ = writer.await;

        let frame = match result {
            Ok(task_id) => match state.store.get_task(&task_id) {
                Ok(Some(task))
                    if task.status == TaskStatus::Failed
                        || task.status == TaskStatus::DeadLetter =>
                {
                    response_err(
                        &id,
                        &RpcError::new(
                            DOWNSTREAM_FAILURE,
                            task.error.unwrap_or_else(|| "processor failure".to_string()),
                        ),
                    )
                }
                _ => response_ok(&id, json!({ "task_id": task_id })),
            },
            Err(e) => response_err(&id, &map_registry_error(&e)),
        };
        client.send_json(&frame).await;
    });
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Shared parameter shape for `agent.chat` and `agent.chat.stream`.
fn chat_params(params: &Value) -> Result<(String, String, String), RpcError> {
    let session_id = param_str(params, "session_id")?;
    uuid::Uuid::parse_str(session_id)
        .map_err(|_| RpcError::invalid_params("session_id must be a UUID"))?;
    let content = params
        .get("content")
        .or_else(|| params.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if content.is_empty() {
        return Err(RpcError::invalid_params("content must not be empty"));
    }
    let agent_id = params
        .get("agent_id")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_AGENT_ID);
    Ok((
        session_id.to_string(),
        content.to_string(),
        agent_id.to_string(),
    ))
}

fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RpcError::invalid_params(format!("{key} is required")))
}

fn map_registry_error(error: &RegistryError) -> RpcError {
    match error {
        RegistryError::Engine(e) => map_engine_error(e),
        RegistryError::Validation(_)
        | RegistryError::AlreadyExists(_)
        | RegistryError::ReservedAgent
        | RegistryError::AgentNotFound(_)
        | RegistryError::TaskNotFound(_) => RpcError::invalid_params(error.to_string()),
        RegistryError::Store(_) | RegistryError::Restore(_) => {
            RpcError::internal(error.to_string())
        }
    }
}

fn map_engine_error(error: &EngineError) -> RpcError {
    match error {
        EngineError::QueueSaturated(_) => RpcError::new(QUEUE_SATURATED, error.to_string()),
        EngineError::Validation(_) => RpcError::invalid_params(error.to_string()),
        EngineError::Store(_) => RpcError::new(DOWNSTREAM_FAILURE, error.to_string()),
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ["secret", "key", "password", "token", "bearer"]
        .iter()
        .any(|marker| key.contains(marker))
}

/// Resident set size, when the platform exposes it.
fn rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(rss_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalBroker;
    use crate::bus::Bus;
    use crate::config::Config;
    use crate::metrics::Metrics;
    use crate::policy::{Policy, StaticPolicy};
    use crate::registry::{chat_processor_factory, AgentConfig, Registry};
    use crate::store::Store;
    use std::time::Duration;

    async fn state_with(policy: Arc<dyn Policy>) -> AppState {
        let store = Store::open_in_memory().unwrap();
        let bus = Bus::new();
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(Registry::new(
            store.clone(),
            bus.clone(),
            Arc::clone(&metrics),
            chat_processor_factory(),
            Duration::from_millis(20),
            3,
        ));
        registry
            .create_agent(AgentConfig {
                agent_id: DEFAULT_AGENT_ID.to_string(),
                ..AgentConfig::default()
            })
            .await
            .unwrap();
        let approvals = Arc::new(ApprovalBroker::new(bus.clone(), Duration::from_secs(60)));
        AppState::new(
            store,
            bus,
            registry,
            approvals,
            policy,
            metrics,
            Arc::new(Config::default()),
        )
    }

    async fn fixture() -> (AppState, Arc<Client>, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let state = state_with(Arc::new(StaticPolicy::allow_all())).await;
        let (client, rx) = Client::test_pair();
        (state, client, rx)
    }

    async fn call(state: &AppState, client: &Arc<Client>, method: &str, params: Value) -> Outcome {
        dispatch(
            state.clone(),
            Arc::clone(client),
            RpcRequest {
                jsonrpc: Some("2.0".to_string()),
                id: Some(json!(1)),
                method: method.to_string(),
                params,
            },
        )
        .await
    }

    fn reply(outcome: &Outcome) -> &Value {
        match outcome {
            Outcome::Reply(frame) => frame,
            Outcome::Silent => panic!("expected a reply, got silence"),
            Outcome::Close => panic!("expected a reply, got close"),
        }
    }

    async fn hello(state: &AppState, client: &Arc<Client>) {
        let outcome = call(state, client, "system.hello", json!({})).await;
        let frame = reply(&outcome);
        assert_eq!(frame["result"]["protocol"]["min"], 1);
    }

    // Seeded tasks target an agent with no running engine so event counts
    // stay deterministic (nothing claims them mid-test).
    fn seed_events(state: &AppState, session_id: &str, count: usize) {
        state.store.ensure_session(session_id).unwrap();
        for i in 0..count {
            state
                .store
                .create_task(
                    &format!("seed-{session_id}-{i}"),
                    session_id,
                    "ghost",
                    &json!({ "type": "chat", "content": "x" }),
                    None,
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_methods_require_handshake_first() {
        let (state, client, _rx) = fixture().await;

        // Even read-only methods are rejected before system.hello.
        let outcome = call(&state, &client, "agent.list", json!({})).await;
        let frame = reply(&outcome);
        assert_eq!(frame["error"]["code"], rpc::INVALID_REQUEST);

        hello(&state, &client).await;
        let outcome = call(&state, &client, "agent.list", json!({})).await;
        assert!(reply(&outcome)["result"]["agents"].is_array());
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let (state, client, _rx) = fixture().await;
        hello(&state, &client).await;
        let outcome = call(&state, &client, "system.shutdown", json!({})).await;
        assert_eq!(reply(&outcome)["error"]["code"], rpc::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_capability_gate_denies_mutation_under_read_only_policy() {
        let state = state_with(Arc::new(StaticPolicy::read_only())).await;
        let (client, _rx) = Client::test_pair();
        hello(&state, &client).await;

        let session = uuid::Uuid::new_v4().to_string();
        let outcome = call(
            &state,
            &client,
            "agent.chat",
            json!({ "session_id": session, "content": "hi" }),
        )
        .await;
        let frame = reply(&outcome);
        assert_eq!(frame["error"]["code"], rpc::INVALID_PARAMS);
        assert!(frame["error"]["message"]
            .as_str()
            .unwrap()
            .contains("capability denied: acp.mutate"));

        // Reads still pass.
        let outcome = call(&state, &client, "session.list", json!({})).await;
        assert!(reply(&outcome)["result"]["sessions"].is_array());
    }

    #[tokio::test]
    async fn test_chat_validates_params_and_returns_task_id() {
        let (state, client, _rx) = fixture().await;
        hello(&state, &client).await;

        let outcome = call(
            &state,
            &client,
            "agent.chat",
            json!({ "session_id": "not-a-uuid", "content": "hi" }),
        )
        .await;
        assert_eq!(reply(&outcome)["error"]["code"], rpc::INVALID_PARAMS);

        let session = uuid::Uuid::new_v4().to_string();
        let outcome = call(
            &state,
            &client,
            "agent.chat",
            json!({ "session_id": session, "content": "" }),
        )
        .await;
        assert_eq!(reply(&outcome)["error"]["code"], rpc::INVALID_PARAMS);

        let outcome = call(
            &state,
            &client,
            "agent.chat",
            json!({ "session_id": session, "content": "hi" }),
        )
        .await;
        let frame = reply(&outcome);
        let task_id = frame["result"]["task_id"].as_str().unwrap();
        let task = state.store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.agent_id, DEFAULT_AGENT_ID);
        state.registry.drain_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_replay_gap_is_reported() {
        let (state, client, _rx) = fixture().await;
        hello(&state, &client).await;

        let session = uuid::Uuid::new_v4().to_string();
        seed_events(&state, &session, 3);
        state.store.purge_events(&session, Some(2)).unwrap();

        let outcome = call(
            &state,
            &client,
            "session.events.subscribe",
            json!({ "session_id": session, "from_event_id": 1 }),
        )
        .await;
        let frame = reply(&outcome);
        assert!(frame["error"]["message"]
            .as_str()
            .unwrap()
            .contains("replay_gap"));
    }

    #[tokio::test]
    async fn test_oversized_replay_backpressures_and_closes() {
        let (state, client, mut rx) = fixture().await;
        hello(&state, &client).await;

        let session = uuid::Uuid::new_v4().to_string();
        seed_events(&state, &session, 80);

        let outcome = call(
            &state,
            &client,
            "session.events.subscribe",
            json!({ "session_id": session, "from_event_id": 0 }),
        )
        .await;
        assert!(matches!(outcome, Outcome::Close));

        let note: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(note["method"], "system.backpressure");
        assert_eq!(note["params"]["reason"], "replay_window_too_large");
        assert_eq!(note["params"]["max_events"], 64);

        // The close frame carries the policy-violation status.
        let close = rx.recv().await.unwrap();
        assert!(close.starts_with("<close:1008"));

        // No live subscription was registered.
        assert!(client.sessions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_forwards_live_events() {
        let (state, client, mut rx) = fixture().await;
        hello(&state, &client).await;

        let session = uuid::Uuid::new_v4().to_string();
        seed_events(&state, &session, 2);

        let outcome = call(
            &state,
            &client,
            "session.events.subscribe",
            json!({ "session_id": session, "from_event_id": 0 }),
        )
        .await;
        let frame = reply(&outcome);
        assert_eq!(frame["result"]["subscribed"], true);
        assert_eq!(frame["result"]["replayed"], 2);

        // Both historical events were pushed, in order.
        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["method"], "session.event");
        assert!(
            first["params"]["event"]["event_id"].as_i64().unwrap()
                < second["params"]["event"]["event_id"].as_i64().unwrap()
        );

        // A new durable event plus a bus signal reaches the subscriber.
        seed_events(&state, &session, 1);
        state
            .bus
            .publish("task.succeeded", json!({ "session_id": session }));
        let live = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let live: Value = serde_json::from_str(&live).unwrap();
        assert_eq!(live["method"], "session.event");
        assert_eq!(live["params"]["event"]["event_type"], "task.enqueued");
    }

    #[tokio::test]
    async fn test_chat_stream_notifies_chunks_then_replies() {
        let (state, client, mut rx) = fixture().await;
        hello(&state, &client).await;

        let session = uuid::Uuid::new_v4().to_string();
        let outcome = call(
            &state,
            &client,
            "agent.chat.stream",
            json!({ "session_id": session, "content": "hello world" }),
        )
        .await;
        assert!(matches!(outcome, Outcome::Silent));

        let mut streamed = String::new();
        let mut task_id = None;
        while task_id.is_none() {
            let frame = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let frame: Value = serde_json::from_str(&frame).unwrap();
            if frame["method"] == "agent.chat.stream" {
                streamed.push_str(frame["params"]["content"].as_str().unwrap());
            } else if let Some(result) = frame.get("result") {
                task_id = result["task_id"].as_str().map(String::from);
            }
        }
        assert_eq!(streamed, "hello world");
        let task = state.store.get_task(&task_id.unwrap()).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        state.registry.drain_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_approval_round_trip_over_rpc() {
        let (state, client, _rx) = fixture().await;
        hello(&state, &client).await;

        let outcome = call(
            &state,
            &client,
            "approval.request",
            json!({ "action": "deploy", "details": "ship" }),
        )
        .await;
        let frame = reply(&outcome);
        assert_eq!(frame["result"]["status"], "PENDING");
        let approval_id = frame["result"]["approval_id"].as_str().unwrap().to_string();

        let outcome = call(
            &state,
            &client,
            "approval.respond",
            json!({ "approval_id": approval_id, "approve": true }),
        )
        .await;
        assert_eq!(reply(&outcome)["result"]["status"], "APPROVED");

        // Responding again fails: the record is no longer pending.
        let outcome = call(
            &state,
            &client,
            "approval.respond",
            json!({ "approval_id": approval_id, "approve": false }),
        )
        .await;
        assert_eq!(reply(&outcome)["error"]["code"], rpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_incident_export_bundles_task_and_events() {
        let (state, client, _rx) = fixture().await;
        hello(&state, &client).await;

        let session = uuid::Uuid::new_v4().to_string();
        let outcome = call(
            &state,
            &client,
            "agent.chat",
            json!({ "session_id": session, "content": "hi" }),
        )
        .await;
        let task_id = reply(&outcome)["result"]["task_id"]
            .as_str()
            .unwrap()
            .to_string();
        crate::engine::testing::wait_for_status(
            &state.store,
            &task_id,
            TaskStatus::Succeeded,
            3,
        )
        .await;

        let outcome = call(&state, &client, "incident.export", json!({ "task_id": task_id })).await;
        let frame = reply(&outcome);
        let bundle = &frame["result"];
        assert_eq!(bundle["task"]["task_id"], task_id.as_str());
        assert!(bundle["events"].as_array().unwrap().len() >= 3);
        assert!(bundle["config_hash"].is_string());
        assert!(bundle["exported_at"].is_string());
        state.registry.drain_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_config_list_never_leaks_secret_overrides() {
        let (state, client, _rx) = fixture().await;
        hello(&state, &client).await;

        for (key, value) in [
            ("api_key", "sk-hidden"),
            ("shared_secret", "hidden"),
            ("display_name", "visible"),
        ] {
            let outcome = call(
                &state,
                &client,
                "config.set",
                json!({ "key": key, "value": value }),
            )
            .await;
            assert_eq!(reply(&outcome)["result"]["updated"], true);
        }

        let outcome = call(&state, &client, "config.list", json!({})).await;
        let listing = reply(&outcome).to_string();
        assert!(listing.contains("display_name"));
        assert!(!listing.contains("sk-hidden"));
        assert!(!listing.contains("shared_secret"));
    }

    #[tokio::test]
    async fn test_system_status_aggregates() {
        let (state, client, _rx) = fixture().await;
        hello(&state, &client).await;

        let outcome = call(&state, &client, "system.status", json!({})).await;
        let status = &reply(&outcome)["result"];
        assert_eq!(status["agent_count"], 1);
        assert_eq!(status["worker_count"], 4);
        assert_eq!(status["policy_version"], "static-v1");
        assert!(status["config_hash"].is_string());
        assert!(status["agents"].is_array());
    }
}
