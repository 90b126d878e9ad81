//! Store schema and persisted record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    agent_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    soul TEXT NOT NULL DEFAULT '',
    worker_count INTEGER NOT NULL DEFAULT 4,
    task_timeout_seconds INTEGER NOT NULL DEFAULT 600,
    max_queue_depth INTEGER NOT NULL DEFAULT 0,
    api_key_env TEXT,
    agent_emoji TEXT,
    preferred_search TEXT,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'QUEUED',
    result TEXT,
    error TEXT,
    lease_owner TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    claimed_at TEXT,
    finished_at TEXT,

    FOREIGN KEY (session_id) REFERENCES sessions(session_id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim
    ON tasks(agent_id, status, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_session ON tasks(session_id);

CREATE TABLE IF NOT EXISTS task_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    state_from TEXT NOT NULL,
    state_to TEXT NOT NULL,
    run_id TEXT,
    trace_id TEXT,
    payload TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_events_session
    ON task_events(session_id, event_id);
CREATE INDEX IF NOT EXISTS idx_task_events_task ON task_events(task_id);

CREATE TABLE IF NOT EXISTS history (
    session_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    token_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_session ON history(session_id);

CREATE TABLE IF NOT EXISTS schedules (
    schedule_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    schedule TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    content TEXT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subtasks (
    subtask_id TEXT PRIMARY KEY,
    parent_task_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Durable agent record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub display_name: String,
    pub provider: String,
    pub model: String,
    pub soul: String,
    pub worker_count: u32,
    pub task_timeout_seconds: u64,
    pub max_queue_depth: u32,
    pub api_key_env: Option<String>,
    pub agent_emoji: Option<String>,
    pub preferred_search: Option<String>,
    pub status: AgentStatus,
}

/// Agent lifecycle status. Removed agents keep their row as `stopped` so a
/// restart can distinguish "never existed" from "explicitly removed".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Stopped,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Stopped => write!(f, "stopped"),
        }
    }
}

pub fn parse_agent_status(s: &str) -> AgentStatus {
    match s {
        "stopped" => AgentStatus::Stopped,
        _ => AgentStatus::Active,
    }
}

/// Task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub lease_owner: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Task status lifecycle:
/// `QUEUED → RUNNING → {SUCCEEDED | FAILED | CANCELED | DEAD_LETTER}`,
/// with `FAILED → RETRY_WAIT → QUEUED` while retry budget remains.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "RETRY_WAIT")]
    RetryWait,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "DEAD_LETTER")]
    DeadLetter,
}

impl TaskStatus {
    /// Terminal statuses are final: any later transition attempt is a no-op.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Canceled | TaskStatus::DeadLetter
        )
    }

    /// Strict parse for externally supplied filters.
    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(TaskStatus::Queued),
            "RUNNING" => Some(TaskStatus::Running),
            "RETRY_WAIT" => Some(TaskStatus::RetryWait),
            "SUCCEEDED" => Some(TaskStatus::Succeeded),
            "FAILED" => Some(TaskStatus::Failed),
            "CANCELED" => Some(TaskStatus::Canceled),
            "DEAD_LETTER" => Some(TaskStatus::DeadLetter),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "QUEUED"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::RetryWait => write!(f, "RETRY_WAIT"),
            TaskStatus::Succeeded => write!(f, "SUCCEEDED"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Canceled => write!(f, "CANCELED"),
            TaskStatus::DeadLetter => write!(f, "DEAD_LETTER"),
        }
    }
}

pub fn parse_task_status(s: &str) -> TaskStatus {
    match s {
        "RUNNING" => TaskStatus::Running,
        "RETRY_WAIT" => TaskStatus::RetryWait,
        "SUCCEEDED" => TaskStatus::Succeeded,
        "FAILED" => TaskStatus::Failed,
        "CANCELED" => TaskStatus::Canceled,
        "DEAD_LETTER" => TaskStatus::DeadLetter,
        _ => TaskStatus::Queued,
    }
}

/// Durable, per-session-monotonic record of one task state transition.
/// The ordered, replayable log that session subscribers consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event_id: i64,
    pub session_id: String,
    pub task_id: String,
    pub event_type: String,
    pub state_from: String,
    pub state_to: String,
    pub run_id: Option<String>,
    pub trace_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// One conversation turn in a session's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub session_id: String,
    pub agent_id: String,
    pub role: HistoryRole,
    pub content: String,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for HistoryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryRole::System => write!(f, "system"),
            HistoryRole::User => write!(f, "user"),
            HistoryRole::Assistant => write!(f, "assistant"),
            HistoryRole::Tool => write!(f, "tool"),
        }
    }
}

pub fn parse_history_role(s: &str) -> HistoryRole {
    match s {
        "system" => HistoryRole::System,
        "assistant" => HistoryRole::Assistant,
        "tool" => HistoryRole::Tool,
        _ => HistoryRole::User,
    }
}

impl HistoryRole {
    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "system" => Some(HistoryRole::System),
            "user" => Some(HistoryRole::User),
            "assistant" => Some(HistoryRole::Assistant),
            "tool" => Some(HistoryRole::Tool),
            _ => None,
        }
    }
}

/// Session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

/// Cron schedule record (routed by the cron RPCs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub schedule_id: String,
    pub name: String,
    pub schedule: String,
    pub agent_id: String,
    pub content: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Subtask record (routed by the subtask RPCs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub subtask_id: String,
    pub parent_task_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
