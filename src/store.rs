//! Durable store for agents, sessions, tasks, task events and history.
//!
//! Single SQLite connection behind a mutex. The connection lock doubles as
//! the claim serialization point: `claim_task` is the one operation that
//! guarantees at-most-one execution, and every task state transition appends
//! its `task_events` row inside the same critical section, so per-session
//! `event_id` order always matches transition order.

mod schema;
#[cfg(test)]
mod proptests;

pub use schema::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe store handle
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Cheap liveness probe for health reporting
    pub fn ping(&self) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    // ==================== Agent Operations ====================

    /// Insert an agent record. Returns `false` when the row already existed
    /// (unique-constraint fallback for concurrent creates), in which case the
    /// existing row's status is flipped back to active.
    pub fn insert_agent(&self, rec: &AgentRecord) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO agents
             (agent_id, display_name, provider, model, soul, worker_count,
              task_timeout_seconds, max_queue_depth, api_key_env, agent_emoji,
              preferred_search, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rec.agent_id,
                rec.display_name,
                rec.provider,
                rec.model,
                rec.soul,
                rec.worker_count,
                rec.task_timeout_seconds,
                rec.max_queue_depth,
                rec.api_key_env,
                rec.agent_emoji,
                rec.preferred_search,
                rec.status.to_string(),
            ],
        )?;
        if inserted == 0 {
            conn.execute(
                "UPDATE agents SET status = 'active' WHERE agent_id = ?1",
                params![rec.agent_id],
            )?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentRecord>> {
        let conn = self.conn.lock().unwrap();
        let rec = conn
            .query_row(
                "SELECT agent_id, display_name, provider, model, soul, worker_count,
                        task_timeout_seconds, max_queue_depth, api_key_env, agent_emoji,
                        preferred_search, status
                 FROM agents WHERE agent_id = ?1",
                params![agent_id],
                row_to_agent,
            )
            .optional()?;
        Ok(rec)
    }

    pub fn list_agent_records(&self) -> StoreResult<Vec<AgentRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT agent_id, display_name, provider, model, soul, worker_count,
                    task_timeout_seconds, max_queue_depth, api_key_env, agent_emoji,
                    preferred_search, status
             FROM agents ORDER BY agent_id",
        )?;
        let rows = stmt.query_map([], row_to_agent)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE agents SET status = ?1 WHERE agent_id = ?2",
            params![status.to_string(), agent_id],
        )?;
        if changed == 0 {
            return Err(StoreError::AgentNotFound(agent_id.to_string()));
        }
        Ok(())
    }

    pub fn set_agent_model(&self, agent_id: &str, model: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE agents SET model = ?1 WHERE agent_id = ?2",
            params![model, agent_id],
        )?;
        if changed == 0 {
            return Err(StoreError::AgentNotFound(agent_id.to_string()));
        }
        Ok(())
    }

    // ==================== Session Operations ====================

    /// Create the session if it does not exist yet. Idempotent.
    pub fn ensure_session(&self, session_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (session_id, created_at) VALUES (?1, ?2)",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_sessions(&self, limit: u32) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, created_at FROM sessions
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(SessionRecord {
                session_id: row.get(0)?,
                created_at: parse_datetime(&row.get::<_, String>(1)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ==================== Task Operations ====================

    /// Persist a new QUEUED task and its `task.enqueued` event.
    pub fn create_task(
        &self,
        task_id: &str,
        session_id: &str,
        agent_id: &str,
        payload: &serde_json::Value,
        trace_id: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (task_id, session_id, agent_id, payload, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'QUEUED', ?5)",
            params![
                task_id,
                session_id,
                agent_id,
                payload.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        append_event_locked(
            &conn,
            session_id,
            task_id,
            "task.enqueued",
            "",
            "QUEUED",
            trace_id,
            None,
        )?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let rec = conn
            .query_row(
                &format!("{TASK_COLUMNS} WHERE task_id = ?1"),
                params![task_id],
                row_to_task,
            )
            .optional()?;
        Ok(rec)
    }

    /// Atomically claim one QUEUED task for this agent's worker.
    ///
    /// Selects the oldest QUEUED task with no lease owner, sets
    /// `lease_owner`/`claimed_at`/RUNNING and appends the transition event,
    /// all under the connection lock. Concurrent claimers serialize here,
    /// which is what guarantees at-most-one execution.
    pub fn claim_task(&self, agent_id: &str, worker_id: &str) -> StoreResult<Option<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let candidate: Option<String> = conn
            .query_row(
                "SELECT task_id FROM tasks
                 WHERE agent_id = ?1 AND status = 'QUEUED' AND lease_owner IS NULL
                 ORDER BY created_at LIMIT 1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(task_id) = candidate else {
            return Ok(None);
        };

        let changed = conn.execute(
            "UPDATE tasks
             SET status = 'RUNNING', lease_owner = ?1, claimed_at = ?2
             WHERE task_id = ?3 AND status = 'QUEUED' AND lease_owner IS NULL",
            params![worker_id, Utc::now().to_rfc3339(), task_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        let task = conn.query_row(
            &format!("{TASK_COLUMNS} WHERE task_id = ?1"),
            params![task_id],
            row_to_task,
        )?;
        append_event_locked(
            &conn,
            &task.session_id,
            &task.task_id,
            "task.claimed",
            "QUEUED",
            "RUNNING",
            trace_of(&task.payload),
            Some(serde_json::json!({ "lease_owner": worker_id })),
        )?;
        Ok(Some(task))
    }

    /// RUNNING → SUCCEEDED. No-op (returns `false`) if the task is already
    /// terminal.
    pub fn complete_task(&self, task_id: &str, result: &str) -> StoreResult<bool> {
        self.finish(task_id, TaskStatus::Succeeded, Some(result), None, "task.succeeded")
    }

    /// QUEUED|RUNNING → CANCELED. No-op if already terminal.
    pub fn cancel_task(&self, task_id: &str, reason: &str) -> StoreResult<bool> {
        self.finish(task_id, TaskStatus::Canceled, None, Some(reason), "task.canceled")
    }

    /// Any non-terminal state → DEAD_LETTER.
    pub fn dead_letter_task(&self, task_id: &str, error: &str) -> StoreResult<bool> {
        self.finish(task_id, TaskStatus::DeadLetter, None, Some(error), "task.dead_letter")
    }

    fn finish(
        &self,
        task_id: &str,
        to: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
        event_type: &str,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let Some(task) = conn
            .query_row(
                &format!("{TASK_COLUMNS} WHERE task_id = ?1"),
                params![task_id],
                row_to_task,
            )
            .optional()?
        else {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        };
        if task.status.is_terminal() {
            return Ok(false);
        }

        conn.execute(
            "UPDATE tasks
             SET status = ?1, result = COALESCE(?2, result),
                 error = COALESCE(?3, error), lease_owner = NULL, finished_at = ?4
             WHERE task_id = ?5",
            params![
                to.to_string(),
                result,
                error,
                Utc::now().to_rfc3339(),
                task_id
            ],
        )?;
        append_event_locked(
            &conn,
            &task.session_id,
            task_id,
            event_type,
            &task.status.to_string(),
            &to.to_string(),
            trace_of(&task.payload),
            error.map(|e| serde_json::json!({ "error": e })),
        )?;
        Ok(true)
    }

    /// RUNNING → FAILED with retry accounting. Returns the new retry count so
    /// the engine can decide between RETRY_WAIT and DEAD_LETTER.
    pub fn fail_task(&self, task_id: &str, error: &str) -> StoreResult<u32> {
        let conn = self.conn.lock().unwrap();
        let Some(task) = conn
            .query_row(
                &format!("{TASK_COLUMNS} WHERE task_id = ?1"),
                params![task_id],
                row_to_task,
            )
            .optional()?
        else {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        };
        if task.status.is_terminal() {
            return Ok(task.retry_count);
        }

        conn.execute(
            "UPDATE tasks
             SET status = 'FAILED', error = ?1, lease_owner = NULL,
                 retry_count = retry_count + 1
             WHERE task_id = ?2",
            params![error, task_id],
        )?;
        append_event_locked(
            &conn,
            &task.session_id,
            task_id,
            "task.failed",
            &task.status.to_string(),
            "FAILED",
            trace_of(&task.payload),
            Some(serde_json::json!({ "error": error })),
        )?;
        Ok(task.retry_count + 1)
    }

    /// FAILED → RETRY_WAIT.
    pub fn schedule_retry(&self, task_id: &str) -> StoreResult<bool> {
        self.transition(task_id, TaskStatus::Failed, TaskStatus::RetryWait, "task.retry_wait")
    }

    /// RETRY_WAIT → QUEUED (backoff timer elapsed).
    pub fn requeue_task(&self, task_id: &str) -> StoreResult<bool> {
        self.transition(task_id, TaskStatus::RetryWait, TaskStatus::Queued, "task.requeued")
    }

    fn transition(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        event_type: &str,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let Some(task) = conn
            .query_row(
                &format!("{TASK_COLUMNS} WHERE task_id = ?1"),
                params![task_id],
                row_to_task,
            )
            .optional()?
        else {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        };
        if task.status != from {
            return Ok(false);
        }
        conn.execute(
            "UPDATE tasks SET status = ?1, claimed_at = NULL WHERE task_id = ?2",
            params![to.to_string(), task_id],
        )?;
        append_event_locked(
            &conn,
            &task.session_id,
            task_id,
            event_type,
            &from.to_string(),
            &to.to_string(),
            trace_of(&task.payload),
            None,
        )?;
        Ok(true)
    }

    /// Return expired leases to QUEUED (or DEAD_LETTER past the retry
    /// budget). A worker that crashed mid-task stops renewing its claim;
    /// this is the recovery path. Returns the number of expired leases.
    pub fn expire_leases(&self, now: DateTime<Utc>, max_retries: u32) -> StoreResult<u64> {
        let expired: Vec<(String, String, u32)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT t.task_id, t.session_id, t.claimed_at, t.retry_count,
                        a.task_timeout_seconds
                 FROM tasks t JOIN agents a ON a.agent_id = t.agent_id
                 WHERE t.status = 'RUNNING' AND t.claimed_at IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;
            rows.filter_map(Result::ok)
                .filter(|(_, _, claimed, _, timeout)| {
                    parse_datetime(claimed) + ChronoDuration::seconds(*timeout) < now
                })
                .map(|(id, sid, _, retries, _)| (id, sid, retries))
                .collect()
        };

        let mut count = 0;
        for (task_id, session_id, retries) in expired {
            let conn = self.conn.lock().unwrap();
            let changed = if retries < max_retries {
                conn.execute(
                    "UPDATE tasks
                     SET status = 'QUEUED', lease_owner = NULL, claimed_at = NULL,
                         retry_count = retry_count + 1
                     WHERE task_id = ?1 AND status = 'RUNNING'",
                    params![task_id],
                )?
            } else {
                conn.execute(
                    "UPDATE tasks
                     SET status = 'DEAD_LETTER', lease_owner = NULL,
                         error = 'lease expired', finished_at = ?1
                     WHERE task_id = ?2 AND status = 'RUNNING'",
                    params![Utc::now().to_rfc3339(), task_id],
                )?
            };
            if changed == 1 {
                let to = if retries < max_retries { "QUEUED" } else { "DEAD_LETTER" };
                append_event_locked(
                    &conn,
                    &session_id,
                    &task_id,
                    "lease.expired",
                    "RUNNING",
                    to,
                    None,
                    None,
                )?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// QUEUED tasks currently admitted for an agent (the queue-depth gate).
    pub fn queued_count(&self, agent_id: &str) -> StoreResult<u32> {
        let conn = self.conn.lock().unwrap();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE agent_id = ?1 AND status = 'QUEUED'",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// (queued, running) across all agents, for status reporting.
    pub fn task_counts(&self) -> StoreResult<(u32, u32)> {
        let conn = self.conn.lock().unwrap();
        let queued = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'QUEUED'",
            [],
            |row| row.get(0),
        )?;
        let running = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'RUNNING'",
            [],
            |row| row.get(0),
        )?;
        Ok((queued, running))
    }

    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let rows = match status {
            Some(s) => {
                let mut stmt = conn.prepare(&format!(
                    "{TASK_COLUMNS} WHERE status = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt.query_map(params![s.to_string(), limit, offset], row_to_task)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{TASK_COLUMNS} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt.query_map(params![limit, offset], row_to_task)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    // ==================== Task Event Operations ====================

    /// Events with `event_id > after`, oldest first, bounded by `limit`.
    pub fn events_after(
        &self,
        session_id: &str,
        after: i64,
        limit: u32,
    ) -> StoreResult<Vec<TaskEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_id, session_id, task_id, event_type, state_from, state_to,
                    run_id, trace_id, payload, created_at
             FROM task_events
             WHERE session_id = ?1 AND event_id > ?2
             ORDER BY event_id LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![session_id, after, limit], row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_events_after(&self, session_id: &str, after: i64) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM task_events WHERE session_id = ?1 AND event_id > ?2",
            params![session_id, after],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// (min, max) surviving event ids for a session; (0, 0) when empty.
    pub fn event_id_bounds(&self, session_id: &str) -> StoreResult<(i64, i64)> {
        let conn = self.conn.lock().unwrap();
        let bounds = conn.query_row(
            "SELECT COALESCE(MIN(event_id), 0), COALESCE(MAX(event_id), 0)
             FROM task_events WHERE session_id = ?1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(bounds)
    }

    pub fn events_for_task(&self, session_id: &str, task_id: &str) -> StoreResult<Vec<TaskEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_id, session_id, task_id, event_type, state_from, state_to,
                    run_id, trace_id, payload, created_at
             FROM task_events
             WHERE session_id = ?1 AND task_id = ?2
             ORDER BY event_id",
        )?;
        let rows = stmt.query_map(params![session_id, task_id], row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// PII purge: drop events up to and including `up_to` (all when `None`).
    /// Returns the number of purged rows.
    pub fn purge_events(&self, session_id: &str, up_to: Option<i64>) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let changed = match up_to {
            Some(id) => conn.execute(
                "DELETE FROM task_events WHERE session_id = ?1 AND event_id <= ?2",
                params![session_id, id],
            )?,
            None => conn.execute(
                "DELETE FROM task_events WHERE session_id = ?1",
                params![session_id],
            )?,
        };
        Ok(changed as u64)
    }

    pub fn total_events(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.query_row("SELECT COUNT(*) FROM task_events", [], |row| row.get(0))?;
        Ok(n)
    }

    // ==================== History Operations ====================

    pub fn append_history(
        &self,
        session_id: &str,
        agent_id: &str,
        role: HistoryRole,
        content: &str,
        token_count: u32,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO history (session_id, agent_id, role, content, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                agent_id,
                role.to_string(),
                content,
                token_count,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn history(&self, session_id: &str) -> StoreResult<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, agent_id, role, content, token_count, created_at
             FROM history WHERE session_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(HistoryEntry {
                session_id: row.get(0)?,
                agent_id: row.get(1)?,
                role: parse_history_role(&row.get::<_, String>(2)?),
                content: row.get(3)?,
                token_count: row.get(4)?,
                created_at: parse_datetime(&row.get::<_, String>(5)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ==================== Schedule / Subtask Operations ====================

    pub fn add_schedule(&self, rec: &ScheduleRecord) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedules
             (schedule_id, name, schedule, agent_id, content, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rec.schedule_id,
                rec.name,
                rec.schedule,
                rec.agent_id,
                rec.content,
                rec.enabled,
                rec.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn remove_schedule(&self, schedule_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM schedules WHERE schedule_id = ?1",
            params![schedule_id],
        )?;
        Ok(changed == 1)
    }

    pub fn set_schedule_enabled(&self, schedule_id: &str, enabled: bool) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE schedules SET enabled = ?1 WHERE schedule_id = ?2",
            params![enabled, schedule_id],
        )?;
        Ok(changed == 1)
    }

    pub fn list_schedules(&self) -> StoreResult<Vec<ScheduleRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT schedule_id, name, schedule, agent_id, content, enabled, created_at
             FROM schedules ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ScheduleRecord {
                schedule_id: row.get(0)?,
                name: row.get(1)?,
                schedule: row.get(2)?,
                agent_id: row.get(3)?,
                content: row.get(4)?,
                enabled: row.get(5)?,
                created_at: parse_datetime(&row.get::<_, String>(6)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn add_subtask(&self, rec: &SubtaskRecord) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO subtasks
             (subtask_id, parent_task_id, task_id, agent_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.subtask_id,
                rec.parent_task_id,
                rec.task_id,
                rec.agent_id,
                rec.content,
                rec.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_subtasks(&self, parent_task_id: Option<&str>) -> StoreResult<Vec<SubtaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let map = |row: &rusqlite::Row<'_>| {
            Ok(SubtaskRecord {
                subtask_id: row.get(0)?,
                parent_task_id: row.get(1)?,
                task_id: row.get(2)?,
                agent_id: row.get(3)?,
                content: row.get(4)?,
                created_at: parse_datetime(&row.get::<_, String>(5)?),
            })
        };
        let rows = match parent_task_id {
            Some(parent) => {
                let mut stmt = conn.prepare(
                    "SELECT subtask_id, parent_task_id, task_id, agent_id, content, created_at
                     FROM subtasks WHERE parent_task_id = ?1 ORDER BY created_at",
                )?;
                let rows = stmt.query_map(params![parent], map)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT subtask_id, parent_task_id, task_id, agent_id, content, created_at
                     FROM subtasks ORDER BY created_at",
                )?;
                let rows = stmt.query_map([], map)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }
}

const TASK_COLUMNS: &str = "SELECT task_id, session_id, agent_id, payload, status, result, error,
        lease_owner, retry_count, created_at, claimed_at, finished_at FROM tasks";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        task_id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        payload: serde_json::from_str(&row.get::<_, String>(3)?)
            .unwrap_or(serde_json::Value::Null),
        status: parse_task_status(&row.get::<_, String>(4)?),
        result: row.get(5)?,
        error: row.get(6)?,
        lease_owner: row.get(7)?,
        retry_count: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        claimed_at: row.get::<_, Option<String>>(10)?.map(|s| parse_datetime(&s)),
        finished_at: row.get::<_, Option<String>>(11)?.map(|s| parse_datetime(&s)),
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        agent_id: row.get(0)?,
        display_name: row.get(1)?,
        provider: row.get(2)?,
        model: row.get(3)?,
        soul: row.get(4)?,
        worker_count: row.get(5)?,
        task_timeout_seconds: row.get(6)?,
        max_queue_depth: row.get(7)?,
        api_key_env: row.get(8)?,
        agent_emoji: row.get(9)?,
        preferred_search: row.get(10)?,
        status: parse_agent_status(&row.get::<_, String>(11)?),
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskEvent> {
    Ok(TaskEvent {
        event_id: row.get(0)?,
        session_id: row.get(1)?,
        task_id: row.get(2)?,
        event_type: row.get(3)?,
        state_from: row.get(4)?,
        state_to: row.get(5)?,
        run_id: row.get(6)?,
        trace_id: row.get(7)?,
        payload: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

#[allow(clippy::too_many_arguments)]
fn append_event_locked(
    conn: &Connection,
    session_id: &str,
    task_id: &str,
    event_type: &str,
    state_from: &str,
    state_to: &str,
    trace_id: Option<&str>,
    payload: Option<serde_json::Value>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO task_events
         (session_id, task_id, event_type, state_from, state_to, run_id, trace_id,
          payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8)",
        params![
            session_id,
            task_id,
            event_type,
            state_from,
            state_to,
            trace_id,
            payload.map(|p| p.to_string()),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn trace_of(payload: &serde_json::Value) -> Option<&str> {
    payload.get("trace_id").and_then(|v| v.as_str())
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
