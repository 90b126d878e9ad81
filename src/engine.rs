//! Per-agent task engine: a worker pool over the durable queue.
//!
//! Workers race on the store's atomic claim, run the processor under a
//! per-task deadline and cancellation token, and write terminal transitions
//! back. Every transition lands in `task_events`; terminal ones are also
//! announced on the bus so the gateway can fan out without the engine
//! knowing who listens.

#[cfg(test)]
pub mod testing;

use crate::bus::Bus;
use crate::metrics::Metrics;
use crate::processor::{approx_tokens, Processor, ProcessorErrorKind, TaskContext};
use crate::store::{AgentRecord, HistoryRole, Store, StoreError, TaskRecord, TaskStatus};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Retry budget before a failing task is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Backoff ceiling for retry scheduling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("queue saturated for agent {0}")]
    QueueSaturated(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Snapshot of one engine's health
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub agent_id: String,
    pub active_tasks: u64,
    pub worker_count: u32,
    pub last_error: Option<String>,
}

/// Chunk sink for streamed chat tasks. Errors are logged, never fatal.
pub type ChunkSink = Box<dyn FnMut(String) -> Result<(), String> + Send>;

/// Cheap-clone engine handle
#[derive(Clone)]
pub struct Engine {
    core: Arc<Core>,
}

struct Core {
    store: Store,
    bus: Bus,
    metrics: Arc<Metrics>,
    processor: Arc<dyn Processor>,
    record: AgentRecord,
    poll_interval: Duration,
    max_retries: u32,
    started: AtomicBool,
    active_tasks: AtomicU64,
    last_error: Mutex<Option<String>>,
    shutdown: CancellationToken,
    wake: Arc<Notify>,
    inflight: Mutex<HashMap<String, CancellationToken>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        store: Store,
        bus: Bus,
        metrics: Arc<Metrics>,
        processor: Arc<dyn Processor>,
        record: AgentRecord,
        poll_interval: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                store,
                bus,
                metrics,
                processor,
                record,
                poll_interval,
                max_retries,
                started: AtomicBool::new(false),
                active_tasks: AtomicU64::new(0),
                last_error: Mutex::new(None),
                shutdown: CancellationToken::new(),
                wake: Arc::new(Notify::new()),
                inflight: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn record(&self) -> &AgentRecord {
        &self.core.record
    }

    /// Spawn the worker claim loops and the poll dispatcher. Idempotent.
    pub fn start(&self) {
        let core = &self.core;
        if core.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = core.workers.lock().unwrap();
        for index in 0..core.record.worker_count {
            let core = Arc::clone(core);
            let worker_id = format!("{}-w{index}", core.record.agent_id);
            workers.push(tokio::spawn(async move {
                core.worker_loop(&worker_id).await;
            }));
        }

        // Dispatcher: wakes workers on each poll tick so a queued task is
        // never stranded waiting for an explicit wakeup.
        let dispatcher = Arc::clone(core);
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = dispatcher.shutdown.cancelled() => break,
                    () = tokio::time::sleep(dispatcher.poll_interval) => {
                        dispatcher.wake.notify_waiters();
                    }
                }
            }
        }));
        tracing::info!(
            agent_id = %core.record.agent_id,
            workers = core.record.worker_count,
            "Engine started"
        );
    }

    /// Validate and enqueue a chat task. Fails with `QueueSaturated` when the
    /// agent's QUEUED backlog is at `max_queue_depth` (0 = unbounded).
    pub fn create_chat_task(
        &self,
        session_id: &str,
        content: &str,
        trace_id: &str,
    ) -> Result<String, EngineError> {
        self.core
            .enqueue(session_id, HistoryRole::User, content, trace_id, "chat")
    }

    /// Enqueue a task carrying an arbitrary-role message.
    pub fn create_message_task(
        &self,
        session_id: &str,
        role: HistoryRole,
        content: &str,
        trace_id: &str,
    ) -> Result<String, EngineError> {
        self.core.enqueue(session_id, role, content, trace_id, "message")
    }

    /// Subscribe to the token stream topic. Call before enqueueing the task
    /// whose stream will be followed, so no early token is missed.
    pub fn subscribe_stream(&self) -> crate::bus::Subscription {
        self.core.bus.subscribe("stream.")
    }

    /// Forward `stream.token` events for `task_id` into `on_chunk` until the
    /// stream closes, the task terminates, or the caller goes away. Sink
    /// errors are logged and never fail the task.
    pub async fn follow_stream(
        &self,
        sub: &mut crate::bus::Subscription,
        task_id: &str,
        caller: &CancellationToken,
        on_chunk: &mut ChunkSink,
    ) {
        let mut poll = tokio::time::interval(Duration::from_millis(200));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = caller.cancelled() => break,
                event = sub.recv() => {
                    let Some(event) = event else { break };
                    if event.payload.get("task_id").and_then(|v| v.as_str()) != Some(task_id) {
                        continue;
                    }
                    match event.topic.as_str() {
                        "stream.token" => {
                            let token = event.payload["token"].as_str().unwrap_or_default();
                            if let Err(e) = on_chunk(token.to_string()) {
                                tracing::warn!(task_id, error = %e, "Chunk sink error");
                            }
                        }
                        "stream.done" => break,
                        _ => {}
                    }
                }
                _ = poll.tick() => {
                    // The processor may terminate without a stream.done (e.g.
                    // failure before streaming started).
                    if let Ok(Some(task)) = self.core.store.get_task(task_id) {
                        if task.status.is_terminal() || task.status == TaskStatus::Failed {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Enqueue a chat task and forward its streamed tokens to `on_chunk`
    /// until the stream closes or the task terminates. Returns the task id.
    pub async fn stream_chat_task(
        &self,
        session_id: &str,
        content: &str,
        trace_id: &str,
        caller: CancellationToken,
        mut on_chunk: ChunkSink,
    ) -> Result<String, EngineError> {
        let mut sub = self.subscribe_stream();
        let task_id = self.create_chat_task(session_id, content, trace_id)?;
        self.follow_stream(&mut sub, &task_id, &caller, &mut on_chunk)
            .await;
        Ok(task_id)
    }

    /// Abort a task owned by this engine. Running: cancel the worker's
    /// per-task context and report `true` immediately (terminal persistence
    /// follows when the worker observes the cancel). Queued: atomic
    /// store-side cancel. Another agent's task or an already-terminal task:
    /// `false`.
    pub fn abort_task(&self, task_id: &str) -> Result<bool, EngineError> {
        let core = &self.core;
        let Some(task) = core.store.get_task(task_id)? else {
            return Ok(false);
        };
        if task.agent_id != core.record.agent_id || task.status.is_terminal() {
            return Ok(false);
        }

        if let Some(token) = core.inflight.lock().unwrap().get(task_id) {
            token.cancel();
            return Ok(true);
        }

        let applied = core.store.cancel_task(task_id, "aborted before claim")?;
        if applied {
            core.metrics.tasks_canceled.fetch_add(1, Ordering::Relaxed);
            core.publish_lifecycle("task.canceled", &task);
        }
        Ok(applied)
    }

    /// Stop claiming, give in-flight workers up to `timeout` to finish, then
    /// cancel whatever is left. Never blocks past the timeout.
    pub async fn drain(&self, timeout: Duration) {
        let core = &self.core;
        core.shutdown.cancel();
        core.wake.notify_waiters();

        let deadline = tokio::time::Instant::now() + timeout;
        while core.active_tasks.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stragglers: Vec<CancellationToken> =
            core.inflight.lock().unwrap().values().cloned().collect();
        if !stragglers.is_empty() {
            tracing::warn!(
                agent_id = %core.record.agent_id,
                count = stragglers.len(),
                "Drain timeout, cancelling in-flight tasks"
            );
            for token in stragglers {
                token.cancel();
            }
        }
        tracing::info!(agent_id = %core.record.agent_id, "Engine drained");
    }

    pub fn status(&self) -> EngineStatus {
        let core = &self.core;
        EngineStatus {
            agent_id: core.record.agent_id.clone(),
            active_tasks: core.active_tasks.load(Ordering::SeqCst),
            worker_count: core.record.worker_count,
            last_error: core.last_error.lock().unwrap().clone(),
        }
    }
}

impl Core {
    async fn worker_loop(self: Arc<Self>, worker_id: &str) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.wake.notified() => {}
            }
            while !self.shutdown.is_cancelled() {
                match self.store.claim_task(&self.record.agent_id, worker_id) {
                    Ok(Some(task)) => self.run_claimed(task).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(worker_id, error = %e, "Claim failed");
                        *self.last_error.lock().unwrap() = Some(e.to_string());
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker_id, "Worker stopped");
    }

    async fn run_claimed(&self, task: TaskRecord) {
        let token = CancellationToken::new();
        self.inflight
            .lock()
            .unwrap()
            .insert(task.task_id.clone(), token.clone());
        self.active_tasks.fetch_add(1, Ordering::SeqCst);

        let ctx = TaskContext {
            cancel: token.clone(),
            bus: self.bus.clone(),
            store: self.store.clone(),
            agent: self.record.clone(),
        };
        let deadline = Duration::from_secs(self.record.task_timeout_seconds);

        enum Outcome {
            Done(String),
            Canceled(String),
            Failed(String),
        }

        let outcome = tokio::select! {
            () = token.cancelled() => Outcome::Canceled("aborted".to_string()),
            res = tokio::time::timeout(deadline, self.processor.process(&ctx, &task)) => {
                match res {
                    Err(_) => {
                        token.cancel();
                        Outcome::Canceled("task timeout".to_string())
                    }
                    Ok(Ok(result)) => Outcome::Done(result),
                    Ok(Err(e)) if e.kind == ProcessorErrorKind::Canceled => {
                        Outcome::Canceled(e.message)
                    }
                    Ok(Err(e)) => Outcome::Failed(e.message),
                }
            }
        };

        match outcome {
            Outcome::Done(result) => {
                self.store_transition(|s| s.complete_task(&task.task_id, &result));
                self.metrics.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
                self.publish_lifecycle("task.succeeded", &task);
            }
            Outcome::Canceled(reason) => {
                tracing::info!(task_id = %task.task_id, %reason, "Task canceled");
                self.store_transition(|s| s.cancel_task(&task.task_id, &reason));
                self.metrics.tasks_canceled.fetch_add(1, Ordering::Relaxed);
                self.publish_lifecycle("task.canceled", &task);
            }
            Outcome::Failed(error) => {
                tracing::warn!(task_id = %task.task_id, %error, "Task failed");
                *self.last_error.lock().unwrap() = Some(error.clone());
                self.handle_failure(&task, &error);
            }
        }

        self.inflight.lock().unwrap().remove(&task.task_id);
        self.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    fn handle_failure(&self, task: &TaskRecord, error: &str) {
        let retries = match self.store.fail_task(&task.task_id, error) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(task_id = %task.task_id, error = %e, "Failure transition lost");
                return;
            }
        };

        if retries <= self.max_retries {
            self.store_transition(|s| s.schedule_retry(&task.task_id));
            self.metrics.tasks_retried.fetch_add(1, Ordering::Relaxed);
            let store = self.store.clone();
            let wake = Arc::clone(&self.wake);
            let task_id = task.task_id.clone();
            let delay = backoff(retries);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match store.requeue_task(&task_id) {
                    Ok(true) => wake.notify_one(),
                    Ok(false) => {} // canceled while waiting
                    Err(e) => tracing::error!(task_id, error = %e, "Requeue failed"),
                }
            });
        } else {
            self.store_transition(|s| s.dead_letter_task(&task.task_id, error));
            self.metrics.tasks_dead_letter.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.publish_lifecycle("task.failed", task);
    }

    fn enqueue(
        &self,
        session_id: &str,
        role: HistoryRole,
        content: &str,
        trace_id: &str,
        kind: &str,
    ) -> Result<String, EngineError> {
        if content.is_empty() {
            return Err(EngineError::Validation(
                "content must not be empty".to_string(),
            ));
        }
        self.store.ensure_session(session_id)?;

        // RETRY_WAIT tasks are parked on a timer, not claimable, and do not
        // count against admission.
        if self.record.max_queue_depth > 0
            && self.store.queued_count(&self.record.agent_id)? >= self.record.max_queue_depth
        {
            return Err(EngineError::QueueSaturated(self.record.agent_id.clone()));
        }

        self.store.append_history(
            session_id,
            &self.record.agent_id,
            role,
            content,
            approx_tokens(content),
        )?;

        let task_id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::json!({
            "type": kind,
            "role": role.to_string(),
            "content": content,
            "trace_id": trace_id,
        });
        self.store.create_task(
            &task_id,
            session_id,
            &self.record.agent_id,
            &payload,
            Some(trace_id),
        )?;
        self.wake.notify_one();
        Ok(task_id)
    }

    fn store_transition(&self, op: impl FnOnce(&Store) -> Result<bool, StoreError>) {
        if let Err(e) = op(&self.store) {
            tracing::error!(agent_id = %self.record.agent_id, error = %e, "Transition failed");
            *self.last_error.lock().unwrap() = Some(e.to_string());
        }
    }

    fn publish_lifecycle(&self, topic: &str, task: &TaskRecord) {
        self.bus.publish(
            topic,
            serde_json::json!({
                "task_id": task.task_id,
                "session_id": task.session_id,
            }),
        );
    }
}

/// Bounded exponential backoff with ±25% jitter.
fn backoff(retry: u32) -> Duration {
    let base = Duration::from_secs(1)
        .saturating_mul(1u32 << (retry.saturating_sub(1)).min(8))
        .min(MAX_BACKOFF);
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    base.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::testing::{wait_for_status, BlockingProcessor, FlakyProcessor};
    use super::*;
    use crate::processor::ChatProcessor;
    use crate::store::AgentStatus;

    fn record(agent_id: &str) -> AgentRecord {
        AgentRecord {
            agent_id: agent_id.to_string(),
            display_name: agent_id.to_string(),
            provider: "echo".to_string(),
            model: "goclaw-v1".to_string(),
            soul: String::new(),
            worker_count: 2,
            task_timeout_seconds: 600,
            max_queue_depth: 0,
            api_key_env: None,
            agent_emoji: None,
            preferred_search: None,
            status: AgentStatus::Active,
        }
    }

    fn engine_with(
        store: &Store,
        bus: &Bus,
        processor: Arc<dyn Processor>,
        rec: AgentRecord,
        max_retries: u32,
    ) -> Engine {
        store.insert_agent(&rec).unwrap();
        Engine::new(
            store.clone(),
            bus.clone(),
            Arc::new(Metrics::new()),
            processor,
            rec,
            Duration::from_millis(20),
            max_retries,
        )
    }

    #[tokio::test]
    async fn test_chat_task_runs_to_success() {
        let store = Store::open_in_memory().unwrap();
        let bus = Bus::new();
        let engine = engine_with(&store, &bus, Arc::new(ChatProcessor), record("a"), 3);
        engine.start();
        engine.start(); // idempotent

        let session = uuid::Uuid::new_v4().to_string();
        let task_id = engine.create_chat_task(&session, "hi", "trace-1").unwrap();

        let task = wait_for_status(&store, &task_id, TaskStatus::Succeeded, 3).await;
        assert_eq!(task.agent_id, "a");
        assert_eq!(task.result.as_deref(), Some(r#"{"reply":"hi"}"#));
        engine.drain(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_abort_running_task() {
        let store = Store::open_in_memory().unwrap();
        let bus = Bus::new();
        let mut lifecycle = bus.subscribe("task.");
        let blocking = Arc::new(BlockingProcessor::new());
        let engine = engine_with(&store, &bus, blocking.clone(), record("a"), 3);
        engine.start();

        let session = uuid::Uuid::new_v4().to_string();
        let task_id = engine.create_chat_task(&session, "hang", "t").unwrap();
        blocking.wait_started().await;

        assert!(engine.abort_task(&task_id).unwrap());
        let task = wait_for_status(&store, &task_id, TaskStatus::Canceled, 3).await;
        assert_eq!(task.status, TaskStatus::Canceled);

        let event = lifecycle.recv().await.unwrap();
        assert_eq!(event.topic, "task.canceled");
        assert_eq!(event.payload["task_id"], task_id.as_str());
        engine.drain(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_abort_queued_task_without_workers() {
        let store = Store::open_in_memory().unwrap();
        let bus = Bus::new();
        let engine = engine_with(&store, &bus, Arc::new(ChatProcessor), record("a"), 3);
        // Engine not started: the task stays QUEUED.

        let session = uuid::Uuid::new_v4().to_string();
        let task_id = engine.create_chat_task(&session, "hi", "t").unwrap();
        assert!(engine.abort_task(&task_id).unwrap());

        let task = store.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);

        // Terminal task aborts report false.
        assert!(!engine.abort_task(&task_id).unwrap());
    }

    #[tokio::test]
    async fn test_queue_saturation() {
        let store = Store::open_in_memory().unwrap();
        let bus = Bus::new();
        let mut rec = record("a");
        rec.max_queue_depth = 1;
        let engine = engine_with(&store, &bus, Arc::new(ChatProcessor), rec, 3);
        // Not started, so admitted tasks stay QUEUED.

        let session = uuid::Uuid::new_v4().to_string();
        engine.create_chat_task(&session, "one", "t").unwrap();
        let err = engine.create_chat_task(&session, "two", "t").unwrap_err();
        assert!(matches!(err, EngineError::QueueSaturated(_)));
    }

    #[tokio::test]
    async fn test_failure_exhausts_budget_to_dead_letter() {
        let store = Store::open_in_memory().unwrap();
        let bus = Bus::new();
        let flaky = Arc::new(FlakyProcessor::failing_forever());
        let engine = engine_with(&store, &bus, flaky, record("a"), 0);
        engine.start();

        let session = uuid::Uuid::new_v4().to_string();
        let task_id = engine.create_chat_task(&session, "boom", "t").unwrap();

        let task = wait_for_status(&store, &task_id, TaskStatus::DeadLetter, 3).await;
        assert_eq!(task.error.as_deref(), Some("synthetic failure"));
        assert_eq!(task.retry_count, 1);
        assert!(engine.status().last_error.is_some());
        engine.drain(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let store = Store::open_in_memory().unwrap();
        let bus = Bus::new();
        let flaky = Arc::new(FlakyProcessor::failing(1));
        let engine = engine_with(&store, &bus, flaky, record("a"), 2);
        engine.start();

        let session = uuid::Uuid::new_v4().to_string();
        let task_id = engine.create_chat_task(&session, "flaky", "t").unwrap();

        // One failure, one backoff (~1s), then success.
        let task = wait_for_status(&store, &task_id, TaskStatus::Succeeded, 8).await;
        assert_eq!(task.retry_count, 1);

        let events = store.events_for_task(&session, &task_id).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"task.failed"));
        assert!(types.contains(&"task.retry_wait"));
        assert!(types.contains(&"task.requeued"));
        assert_eq!(types.last(), Some(&"task.succeeded"));
        engine.drain(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_task_timeout_cancels() {
        let store = Store::open_in_memory().unwrap();
        let bus = Bus::new();
        let mut rec = record("a");
        rec.task_timeout_seconds = 0;
        let blocking = Arc::new(BlockingProcessor::new());
        let engine = engine_with(&store, &bus, blocking, rec, 3);
        engine.start();

        let session = uuid::Uuid::new_v4().to_string();
        let task_id = engine.create_chat_task(&session, "slow", "t").unwrap();
        let task = wait_for_status(&store, &task_id, TaskStatus::Canceled, 3).await;
        assert_eq!(task.error.as_deref(), Some("task timeout"));
        engine.drain(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_stream_chat_task_forwards_chunks() {
        let store = Store::open_in_memory().unwrap();
        let bus = Bus::new();
        let engine = engine_with(&store, &bus, Arc::new(ChatProcessor), record("a"), 3);
        engine.start();

        let collected = Arc::new(Mutex::new(String::new()));
        let sink: ChunkSink = {
            let collected = Arc::clone(&collected);
            Box::new(move |chunk: String| {
                collected.lock().unwrap().push_str(&chunk);
                Ok(())
            })
        };

        let session = uuid::Uuid::new_v4().to_string();
        let task_id = engine
            .stream_chat_task(&session, "hello stream", "t", CancellationToken::new(), sink)
            .await
            .unwrap();

        assert_eq!(collected.lock().unwrap().as_str(), "hello stream");
        let task = wait_for_status(&store, &task_id, TaskStatus::Succeeded, 3).await;
        assert!(task.status.is_terminal());
        engine.drain(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_drain_cancels_stragglers() {
        let store = Store::open_in_memory().unwrap();
        let bus = Bus::new();
        let blocking = Arc::new(BlockingProcessor::new());
        let engine = engine_with(&store, &bus, blocking.clone(), record("a"), 3);
        engine.start();

        let session = uuid::Uuid::new_v4().to_string();
        let task_id = engine.create_chat_task(&session, "hang", "t").unwrap();
        blocking.wait_started().await;

        engine.drain(Duration::from_millis(100)).await;
        let task = wait_for_status(&store, &task_id, TaskStatus::Canceled, 3).await;
        assert_eq!(task.status, TaskStatus::Canceled);
    }
}
