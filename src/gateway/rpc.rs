//! JSON-RPC 2.0 framing: request/response shapes, the error-code taxonomy,
//! and the method-to-capability map the gateway gates every call through.

use crate::policy::{CAP_MUTATE, CAP_READ};
use serde::Deserialize;
use serde_json::{json, Value};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
/// Validation failure / invalid params / capability denied / not found.
pub const INVALID_PARAMS: i64 = 1000;
/// Downstream LLM / processor failure.
pub const DOWNSTREAM_FAILURE: i64 = 4000;
/// Queue saturated; caller should back off and retry.
pub const QUEUE_SATURATED: i64 = 4290;

/// One inbound frame: a Request (with `id`) or a Notification (without).
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

pub fn response_ok(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn response_err(id: &Value, err: &RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": err.code, "message": err.message },
    })
}

/// Server-originated notification frame (no `id`).
pub fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

/// The capability each method requires. `None` means the method does not
/// exist; `system.hello` is the only ungated method.
pub fn capability_for(method: &str) -> Option<&'static str> {
    match method {
        "system.hello" => Some(""),
        "session.history" | "session.list" | "session.events.subscribe" | "system.status"
        | "approval.list" | "cron.list" | "subtask.list" | "agent.list" | "agent.status"
        | "incident.export" | "config.list" => Some(CAP_READ),
        "agent.chat" | "agent.chat.stream" | "agent.abort" | "approval.request"
        | "approval.respond" | "session.purge" | "cron.add" | "cron.remove" | "cron.enable"
        | "cron.disable" | "subtask.create" | "agent.create" | "agent.remove" | "config.set"
        | "config.model.set" | "policy.domain.add" => Some(CAP_MUTATE),
        _ => None,
    }
}
