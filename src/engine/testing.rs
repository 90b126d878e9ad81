//! Test processors and helpers for exercising the engine without a brain.

use crate::processor::{Processor, ProcessorError, TaskContext};
use crate::store::{Store, TaskRecord, TaskStatus};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Processor that blocks until released or cancelled. Lets tests observe a
/// task in RUNNING state.
pub struct BlockingProcessor {
    started: watch::Sender<bool>,
    release: Notify,
}

impl BlockingProcessor {
    pub fn new() -> Self {
        let (started, _) = watch::channel(false);
        Self {
            started,
            release: Notify::new(),
        }
    }

    /// Wait until a task has entered the processor.
    pub async fn wait_started(&self) {
        let mut rx = self.started.subscribe();
        rx.wait_for(|started| *started).await.unwrap();
    }

    #[allow(dead_code)]
    pub fn release(&self) {
        self.release.notify_waiters();
    }
}

#[async_trait]
impl Processor for BlockingProcessor {
    async fn process(
        &self,
        ctx: &TaskContext,
        _task: &TaskRecord,
    ) -> Result<String, ProcessorError> {
        self.started.send_replace(true);
        tokio::select! {
            () = ctx.cancel.cancelled() => Err(ProcessorError::canceled("blocked task canceled")),
            () = self.release.notified() => Ok(r#"{"reply":"released"}"#.to_string()),
        }
    }
}

/// Processor that fails a fixed number of times before succeeding.
pub struct FlakyProcessor {
    failures_left: AtomicI64,
}

impl FlakyProcessor {
    pub fn failing(failures: i64) -> Self {
        Self {
            failures_left: AtomicI64::new(failures),
        }
    }

    pub fn failing_forever() -> Self {
        Self::failing(i64::MAX)
    }
}

#[async_trait]
impl Processor for FlakyProcessor {
    async fn process(
        &self,
        _ctx: &TaskContext,
        _task: &TaskRecord,
    ) -> Result<String, ProcessorError> {
        if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
            Err(ProcessorError::failed("synthetic failure"))
        } else {
            Ok(r#"{"reply":"recovered"}"#.to_string())
        }
    }
}

/// Poll the store until the task reaches `status` or the timeout elapses.
pub async fn wait_for_status(
    store: &Store,
    task_id: &str,
    status: TaskStatus,
    timeout_secs: u64,
) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        let task = store.get_task(task_id).unwrap();
        if let Some(task) = task {
            if task.status == status {
                return task;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "task {task_id} stuck in {:?}, wanted {status:?}",
                    task.status
                );
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("task {task_id} never appeared");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
