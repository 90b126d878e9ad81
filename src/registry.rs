//! Agent registry: the per-process map from agent identity to a running
//! engine, with lifecycle (create, restore, drain, remove) and routing of
//! chat/abort requests.

use crate::bus::Bus;
use crate::engine::{Engine, EngineError, EngineStatus};
use crate::metrics::Metrics;
use crate::processor::{ChatProcessor, Processor};
use crate::store::{AgentRecord, AgentStatus, Store, StoreError};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Reserved agent id; always present and never removable.
pub const DEFAULT_AGENT_ID: &str = "default";

const DEFAULT_WORKER_COUNT: u32 = 4;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("agent '{0}' already exists")]
    AlreadyExists(String),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("the '{DEFAULT_AGENT_ID}' agent is reserved and cannot be removed")]
    ReservedAgent,
    #[error("invalid agent config: {0}")]
    Validation(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("restore failed for: {0}")]
    Restore(String),
}

/// Requested agent configuration; unset fields take defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub display_name: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub soul: Option<String>,
    pub worker_count: Option<u32>,
    pub task_timeout_seconds: Option<u64>,
    pub max_queue_depth: Option<u32>,
    /// Explicit API key. Takes precedence over `api_key_env`; never persisted.
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    pub agent_emoji: Option<String>,
    pub preferred_search: Option<String>,
}

/// Builds the processor for a freshly constructed engine. The resolved API
/// key (explicit > env var) is passed alongside the durable record so the
/// key itself never touches the store.
pub type ProcessorFactory =
    Arc<dyn Fn(&AgentRecord, Option<&str>) -> Arc<dyn Processor> + Send + Sync>;

/// Factory for the in-tree default brain.
pub fn chat_processor_factory() -> ProcessorFactory {
    Arc::new(|_record, _api_key| Arc::new(ChatProcessor))
}

type OnAgentCreated = Arc<dyn Fn(&AgentRecord) + Send + Sync>;

struct Inner {
    agents: HashMap<String, Engine>,
    // Read under the same lock as map inserts so a concurrent
    // set_on_agent_created cannot race a create.
    on_agent_created: Option<OnAgentCreated>,
}

pub struct Registry {
    store: Store,
    bus: Bus,
    metrics: Arc<Metrics>,
    factory: ProcessorFactory,
    poll_interval: Duration,
    max_retries: u32,
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new(
        store: Store,
        bus: Bus,
        metrics: Arc<Metrics>,
        factory: ProcessorFactory,
        poll_interval: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            bus,
            metrics,
            factory,
            poll_interval,
            max_retries,
            inner: RwLock::new(Inner {
                agents: HashMap::new(),
                on_agent_created: None,
            }),
        }
    }

    pub fn set_on_agent_created(&self, callback: OnAgentCreated) {
        self.inner.write().unwrap().on_agent_created = Some(callback);
    }

    /// Create and start a new agent. All-or-nothing: any failure after the
    /// engine is built tears it down again.
    pub async fn create_agent(&self, cfg: AgentConfig) -> Result<AgentRecord, RegistryError> {
        let agent_id = cfg.agent_id.trim().to_string();
        if agent_id.is_empty() {
            return Err(RegistryError::Validation("agent_id must not be empty".to_string()));
        }
        if self.inner.read().unwrap().agents.contains_key(&agent_id) {
            return Err(RegistryError::AlreadyExists(agent_id));
        }

        let record = AgentRecord {
            agent_id: agent_id.clone(),
            display_name: cfg.display_name.unwrap_or_else(|| agent_id.clone()),
            provider: cfg.provider.unwrap_or_else(|| "echo".to_string()),
            model: cfg.model.unwrap_or_else(|| "goclaw-v1".to_string()),
            soul: cfg.soul.unwrap_or_default(),
            worker_count: cfg.worker_count.unwrap_or(DEFAULT_WORKER_COUNT).max(1),
            task_timeout_seconds: cfg.task_timeout_seconds.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS),
            max_queue_depth: cfg.max_queue_depth.unwrap_or(0),
            api_key_env: cfg.api_key_env.clone(),
            agent_emoji: cfg.agent_emoji,
            preferred_search: cfg.preferred_search,
            status: AgentStatus::Active,
        };

        // Explicit key wins over the configured env var.
        let api_key = cfg
            .api_key
            .or_else(|| cfg.api_key_env.as_deref().and_then(|env| std::env::var(env).ok()));

        // In-memory duplicate check passed; the store insert is the
        // unique-constraint fallback (an existing row is reactivated, never
        // given a second engine).
        self.store.insert_agent(&record)?;
        self.install_engine(record, api_key.as_deref())
    }

    fn install_engine(
        &self,
        record: AgentRecord,
        api_key: Option<&str>,
    ) -> Result<AgentRecord, RegistryError> {
        let processor = (self.factory)(&record, api_key);
        let engine = Engine::new(
            self.store.clone(),
            self.bus.clone(),
            Arc::clone(&self.metrics),
            processor,
            record.clone(),
            self.poll_interval,
            self.max_retries,
        );

        // The engine only starts once it has won the map insert, so a lost
        // concurrent create never spins up a second worker pool.
        let callback = {
            let mut inner = self.inner.write().unwrap();
            if inner.agents.contains_key(&record.agent_id) {
                return Err(RegistryError::AlreadyExists(record.agent_id));
            }
            inner.agents.insert(record.agent_id.clone(), engine.clone());
            inner.on_agent_created.clone()
        };
        engine.start();
        if let Some(callback) = callback {
            callback(&record);
        }
        tracing::info!(target: "audit", agent_id = %record.agent_id, "Agent created");
        Ok(record)
    }

    /// Stop and remove an agent. The durable record is kept with
    /// `status = stopped` so a restart can tell "removed" from "never
    /// existed". The reserved default agent is refused.
    pub async fn remove_agent(
        &self,
        agent_id: &str,
        drain_timeout: Duration,
    ) -> Result<(), RegistryError> {
        if agent_id == DEFAULT_AGENT_ID {
            return Err(RegistryError::ReservedAgent);
        }
        let engine = self
            .inner
            .write()
            .unwrap()
            .agents
            .remove(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;

        engine.drain(drain_timeout).await;
        self.store.set_agent_status(agent_id, AgentStatus::Stopped)?;
        tracing::info!(target: "audit", agent_id, "Agent removed");
        Ok(())
    }

    /// Restore every durable record with `status = active` that is not
    /// already running. Stopped agents are skipped. Individual failures do
    /// not prevent other agents from restoring; they are combined into one
    /// error at the end.
    pub async fn restore_persisted_agents(&self) -> Result<usize, RegistryError> {
        let records = self.store.list_agent_records()?;
        let mut restored = 0;
        let mut failures = Vec::new();
        for record in records {
            if record.status == AgentStatus::Stopped {
                continue;
            }
            if self.inner.read().unwrap().agents.contains_key(&record.agent_id) {
                continue;
            }
            let api_key = record
                .api_key_env
                .as_deref()
                .and_then(|env| std::env::var(env).ok());
            match self.install_engine(record.clone(), api_key.as_deref()) {
                Ok(_) => restored += 1,
                Err(e) => {
                    tracing::error!(agent_id = %record.agent_id, error = %e, "Restore failed");
                    failures.push(format!("{}: {e}", record.agent_id));
                }
            }
        }
        if failures.is_empty() {
            Ok(restored)
        } else {
            Err(RegistryError::Restore(failures.join("; ")))
        }
    }

    pub fn engine(&self, agent_id: &str) -> Result<Engine, RegistryError> {
        self.inner
            .read()
            .unwrap()
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.inner
            .read()
            .unwrap()
            .agents
            .get(agent_id)
            .map(|e| e.record().clone())
    }

    /// All durable agent records, running or stopped.
    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        Ok(self.store.list_agent_records()?)
    }

    pub fn list_running_agents(&self) -> Vec<AgentRecord> {
        let inner = self.inner.read().unwrap();
        let mut records: Vec<AgentRecord> =
            inner.agents.values().map(|e| e.record().clone()).collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }

    pub fn agent_status(&self, agent_id: &str) -> Result<EngineStatus, RegistryError> {
        Ok(self.engine(agent_id)?.status())
    }

    pub fn statuses(&self) -> Vec<EngineStatus> {
        let inner = self.inner.read().unwrap();
        let mut statuses: Vec<EngineStatus> =
            inner.agents.values().map(Engine::status).collect();
        statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        statuses
    }

    pub fn create_chat_task(
        &self,
        agent_id: &str,
        session_id: &str,
        content: &str,
        trace_id: &str,
    ) -> Result<String, RegistryError> {
        Ok(self.engine(agent_id)?.create_chat_task(session_id, content, trace_id)?)
    }

    #[allow(dead_code)] // For embedding callers; the gateway routes chat only
    pub fn create_message_task(
        &self,
        agent_id: &str,
        session_id: &str,
        role: crate::store::HistoryRole,
        content: &str,
        trace_id: &str,
    ) -> Result<String, RegistryError> {
        Ok(self
            .engine(agent_id)?
            .create_message_task(session_id, role, content, trace_id)?)
    }

    /// Stream a chat task through the named agent's engine, forwarding
    /// chunks to `on_chunk` until the task terminates or the caller goes
    /// away.
    pub async fn stream_chat_task(
        &self,
        agent_id: &str,
        session_id: &str,
        content: &str,
        trace_id: &str,
        caller: tokio_util::sync::CancellationToken,
        on_chunk: crate::engine::ChunkSink,
    ) -> Result<String, RegistryError> {
        let engine = self.engine(agent_id)?;
        Ok(engine
            .stream_chat_task(session_id, content, trace_id, caller, on_chunk)
            .await?)
    }

    /// Abort a task wherever it lives. The owning agent is resolved through
    /// the store; when that agent is no longer running the cancel happens
    /// store-side only.
    pub async fn abort_task(&self, task_id: &str) -> Result<bool, RegistryError> {
        let Some(task) = self.store.get_task(task_id)? else {
            return Err(RegistryError::TaskNotFound(task_id.to_string()));
        };

        if let Ok(engine) = self.engine(&task.agent_id) {
            return Ok(engine.abort_task(task_id)?);
        }

        if task.status.is_terminal() {
            return Ok(false);
        }
        let applied = self.store.cancel_task(task_id, "agent not running")?;
        if applied {
            self.bus.publish(
                "task.canceled",
                serde_json::json!({
                    "task_id": task.task_id,
                    "session_id": task.session_id,
                }),
            );
        }
        Ok(applied)
    }

    /// Drain every engine in parallel, bounded by `timeout` per engine.
    pub async fn drain_all(&self, timeout: Duration) {
        let engines: Vec<Engine> = self
            .inner
            .read()
            .unwrap()
            .agents
            .values()
            .cloned()
            .collect();
        futures::future::join_all(engines.iter().map(|e| e.drain(timeout))).await;
    }

    /// Persist a new default model tag for an agent. Running engines keep
    /// their constructed processor; the new tag applies from the next
    /// restore.
    pub fn set_agent_model(&self, agent_id: &str, model: &str) -> Result<(), RegistryError> {
        self.store.set_agent_model(agent_id, model)?;
        tracing::info!(target: "audit", agent_id, model, "Agent model updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::wait_for_status;
    use crate::store::TaskStatus;

    fn registry(store: &Store) -> Arc<Registry> {
        Arc::new(Registry::new(
            store.clone(),
            Bus::new(),
            Arc::new(Metrics::new()),
            chat_processor_factory(),
            Duration::from_millis(20),
            3,
        ))
    }

    fn cfg(agent_id: &str) -> AgentConfig {
        AgentConfig {
            agent_id: agent_id.to_string(),
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_route() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry(&store);
        registry.create_agent(cfg("a")).await.unwrap();

        let session = uuid::Uuid::new_v4().to_string();
        let task_id = registry
            .create_chat_task("a", &session, "hi", "trace-1")
            .unwrap();

        let task = wait_for_status(&store, &task_id, TaskStatus::Succeeded, 3).await;
        assert_eq!(task.agent_id, "a");
        assert_eq!(task.result.as_deref(), Some(r#"{"reply":"hi"}"#));
        registry.drain_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry(&store);
        registry.create_agent(cfg("dup")).await.unwrap();

        let err = registry.create_agent(cfg("dup")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        registry.drain_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_creates_have_one_winner() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry(&store);

        let (r1, r2) = tokio::join!(
            registry.create_agent(cfg("dup")),
            registry.create_agent(cfg("dup")),
        );
        let wins = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        let loss = if r1.is_err() { r1 } else { r2 };
        assert!(loss.unwrap_err().to_string().contains("already exists"));
        registry.drain_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_default_agent_is_preserved() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry(&store);
        registry.create_agent(cfg(DEFAULT_AGENT_ID)).await.unwrap();

        let err = registry
            .remove_agent(DEFAULT_AGENT_ID, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ReservedAgent));
        assert!(registry.agent_status(DEFAULT_AGENT_ID).is_ok());
        registry.drain_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_remove_marks_stopped_and_restore_skips_it() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry(&store);
        registry.create_agent(cfg("gone")).await.unwrap();
        registry
            .remove_agent("gone", Duration::from_millis(50))
            .await
            .unwrap();

        let record = store.get_agent("gone").unwrap().unwrap();
        assert_eq!(record.status, AgentStatus::Stopped);

        let restored = registry.restore_persisted_agents().await.unwrap();
        assert_eq!(restored, 0);
        assert!(registry.agent_status("gone").is_err());
    }

    #[tokio::test]
    async fn test_restore_is_idempotent_for_running_agents() {
        let store = Store::open_in_memory().unwrap();
        let first = registry(&store);
        first.create_agent(cfg("a")).await.unwrap();

        // Already running: restore is a no-op for it.
        assert_eq!(first.restore_persisted_agents().await.unwrap(), 0);

        // A fresh registry over the same store restores it.
        let second = registry(&store);
        assert_eq!(second.restore_persisted_agents().await.unwrap(), 1);
        assert!(second.agent_status("a").is_ok());
        first.drain_all(Duration::from_millis(200)).await;
        second.drain_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_message_task_keeps_declared_role() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry(&store);
        registry.create_agent(cfg("a")).await.unwrap();

        let session = uuid::Uuid::new_v4().to_string();
        registry
            .create_message_task("a", &session, crate::store::HistoryRole::System, "be brief", "t")
            .unwrap();

        let history = store.history(&session).unwrap();
        assert_eq!(history[0].role, crate::store::HistoryRole::System);
        assert_eq!(history[0].content, "be brief");
        registry.drain_all(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_route_to_unknown_agent_fails() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry(&store);
        let err = registry
            .create_chat_task("ghost", "s1", "hi", "t")
            .unwrap_err();
        assert!(matches!(err, RegistryError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn test_abort_falls_back_to_store_for_stopped_agent() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry(&store);

        // A queued task whose agent is not running anywhere.
        store.ensure_session("s1").unwrap();
        store
            .create_task(
                "t-orphan",
                "s1",
                "ghost",
                &serde_json::json!({ "type": "chat", "content": "hi" }),
                None,
            )
            .unwrap();

        assert!(registry.abort_task("t-orphan").await.unwrap());
        let task = store.get_task("t-orphan").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);

        // Second abort is a no-op on the terminal task.
        assert!(!registry.abort_task("t-orphan").await.unwrap());
    }

    #[tokio::test]
    async fn test_abort_unknown_task_errors() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry(&store);
        let err = registry.abort_task("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_on_agent_created_callback_fires() {
        let store = Store::open_in_memory().unwrap();
        let registry = registry(&store);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            registry.set_on_agent_created(Arc::new(move |record| {
                seen.lock().unwrap().push(record.agent_id.clone());
            }));
        }
        registry.create_agent(cfg("a")).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["a"]);
        registry.drain_all(Duration::from_millis(200)).await;
    }
}
