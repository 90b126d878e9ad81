//! The processor seam: the pluggable hook that turns a claimed task into a
//! result.
//!
//! LLM provider adapters live behind this trait and are external to the
//! core; the registry picks an implementation per agent via its processor
//! factory. The in-tree `ChatProcessor` is the default brain: it streams the
//! reply token-by-token over the bus and records the assistant turn in
//! history.

use crate::bus::Bus;
use crate::store::{AgentRecord, HistoryRole, Store, TaskRecord};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Everything a processor may touch while running one task.
pub struct TaskContext {
    /// Cancelled on abort, timeout, or drain. Processors should check it at
    /// their own suspension points; the engine also races the whole call
    /// against it.
    pub cancel: CancellationToken,
    pub bus: Bus,
    pub store: Store,
    pub agent: AgentRecord,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessorError {
    pub kind: ProcessorErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorErrorKind {
    /// The task context was cancelled mid-flight.
    Canceled,
    /// Downstream failure; subject to the retry budget.
    Failed,
}

impl ProcessorError {
    pub fn canceled(message: impl Into<String>) -> Self {
        Self {
            kind: ProcessorErrorKind::Canceled,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: ProcessorErrorKind::Failed,
            message: message.into(),
        }
    }
}

/// One-method capability: run a task to completion.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: &TaskContext, task: &TaskRecord) -> Result<String, ProcessorError>;
}

#[async_trait]
impl<T: Processor + ?Sized> Processor for Arc<T> {
    async fn process(&self, ctx: &TaskContext, task: &TaskRecord) -> Result<String, ProcessorError> {
        (**self).process(ctx, task).await
    }
}

/// Rough token estimate (chars / 4). The runtime does not tokenize; this
/// feeds history bookkeeping and OpenAI `usage` blocks.
pub fn approx_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
}

/// Default chat brain: echoes the prompt back as the assistant reply,
/// streaming it chunk-by-chunk over `stream.token` and closing with
/// `stream.done`.
pub struct ChatProcessor;

#[async_trait]
impl Processor for ChatProcessor {
    async fn process(&self, ctx: &TaskContext, task: &TaskRecord) -> Result<String, ProcessorError> {
        let content = task
            .payload
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProcessorError::failed("task payload has no content"))?;

        let reply = content.to_string();
        for chunk in split_chunks(&reply) {
            if ctx.cancel.is_cancelled() {
                return Err(ProcessorError::canceled("canceled mid-stream"));
            }
            ctx.bus.publish(
                "stream.token",
                serde_json::json!({
                    "task_id": task.task_id,
                    "agent_id": ctx.agent.agent_id,
                    "token": chunk,
                }),
            );
        }
        ctx.bus.publish(
            "stream.done",
            serde_json::json!({
                "task_id": task.task_id,
                "agent_id": ctx.agent.agent_id,
            }),
        );

        ctx.store
            .append_history(
                &task.session_id,
                &ctx.agent.agent_id,
                HistoryRole::Assistant,
                &reply,
                approx_tokens(&reply),
            )
            .map_err(|e| ProcessorError::failed(format!("history write failed: {e}")))?;

        Ok(serde_json::json!({ "reply": reply }).to_string())
    }
}

/// Word-boundary chunks that reassemble to the original text.
fn split_chunks(text: &str) -> Vec<&str> {
    text.split_inclusive(' ').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AgentStatus, TaskStatus};
    use chrono::Utc;

    fn agent() -> AgentRecord {
        AgentRecord {
            agent_id: "a".to_string(),
            display_name: "a".to_string(),
            provider: "echo".to_string(),
            model: "goclaw-v1".to_string(),
            soul: String::new(),
            worker_count: 1,
            task_timeout_seconds: 600,
            max_queue_depth: 0,
            api_key_env: None,
            agent_emoji: None,
            preferred_search: None,
            status: AgentStatus::Active,
        }
    }

    fn task(content: &str) -> TaskRecord {
        TaskRecord {
            task_id: "t1".to_string(),
            session_id: "s1".to_string(),
            agent_id: "a".to_string(),
            payload: serde_json::json!({ "type": "chat", "content": content }),
            status: TaskStatus::Running,
            result: None,
            error: None,
            lease_owner: Some("a-w0".to_string()),
            retry_count: 0,
            created_at: Utc::now(),
            claimed_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_chat_processor_streams_and_records_history() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_session("s1").unwrap();
        let bus = Bus::new();
        let mut sub = bus.subscribe("stream.");

        let ctx = TaskContext {
            cancel: CancellationToken::new(),
            bus: bus.clone(),
            store: store.clone(),
            agent: agent(),
        };
        let result = ChatProcessor.process(&ctx, &task("hello world")).await.unwrap();
        assert_eq!(result, r#"{"reply":"hello world"}"#);

        let mut tokens = String::new();
        loop {
            let event = sub.recv().await.unwrap();
            if event.topic == "stream.done" {
                break;
            }
            tokens.push_str(event.payload["token"].as_str().unwrap());
        }
        assert_eq!(tokens, "hello world");

        let history = store.history("s1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, HistoryRole::Assistant);
        assert_eq!(history[0].content, "hello world");
    }

    #[tokio::test]
    async fn test_chat_processor_respects_cancellation() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_session("s1").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ctx = TaskContext {
            cancel,
            bus: Bus::new(),
            store,
            agent: agent(),
        };
        let err = ChatProcessor.process(&ctx, &task("hi")).await.unwrap_err();
        assert_eq!(err.kind, ProcessorErrorKind::Canceled);
    }

    #[test]
    fn test_approx_tokens() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }
}
