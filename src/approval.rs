//! Approval broker: pending approval map with request-wait-decide flow and
//! timeout default-deny.
//!
//! Records live in memory only and are retained until process exit. The
//! completion signal is a cancellation token closed exactly once; waiters
//! and late responders all observe the same idempotent close.

use crate::bus::Bus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("approval not found: {0}")]
    NotFound(String),
    #[error("approval {0} is not pending")]
    NotPending(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ApprovalStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "DENIED")]
    Denied,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "PENDING"),
            ApprovalStatus::Approved => write!(f, "APPROVED"),
            ApprovalStatus::Denied => write!(f, "DENIED"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRecord {
    pub approval_id: String,
    pub action: String,
    pub details: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

struct Entry {
    record: ApprovalRecord,
    decided: CancellationToken,
}

pub struct ApprovalBroker {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    bus: Bus,
    timeout: Duration,
}

impl ApprovalBroker {
    pub fn new(bus: Bus, timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            bus,
            timeout,
        }
    }

    /// Create a PENDING approval, broadcast `approval.required`, and arm the
    /// default-deny timer.
    pub fn request(&self, action: &str, details: &str) -> ApprovalRecord {
        let record = ApprovalRecord {
            approval_id: uuid::Uuid::new_v4().to_string(),
            action: action.to_string(),
            details: details.to_string(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        };
        let decided = CancellationToken::new();
        self.entries.lock().unwrap().insert(
            record.approval_id.clone(),
            Entry {
                record: record.clone(),
                decided,
            },
        );
        self.bus.publish(
            "approval.required",
            serde_json::json!({
                "approval_id": record.approval_id,
                "action": record.action,
                "details": record.details,
            }),
        );

        let entries = Arc::clone(&self.entries);
        let bus = self.bus.clone();
        let approval_id = record.approval_id.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let denied = {
                let mut entries = entries.lock().unwrap();
                match entries.get_mut(&approval_id) {
                    Some(entry) if entry.record.status == ApprovalStatus::Pending => {
                        entry.record.status = ApprovalStatus::Denied;
                        entry.decided.cancel();
                        true
                    }
                    _ => false,
                }
            };
            if denied {
                tracing::info!(target: "audit", approval_id, "Approval timed out, denied");
                bus.publish(
                    "approval.updated",
                    serde_json::json!({
                        "approval_id": approval_id,
                        "status": "DENIED",
                        "reason": "timeout",
                    }),
                );
            }
        });
        record
    }

    /// Resolve a pending approval. Responses for non-pending records fail.
    pub fn respond(&self, approval_id: &str, approve: bool) -> Result<ApprovalStatus, ApprovalError> {
        let status = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(approval_id)
                .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;
            if entry.record.status != ApprovalStatus::Pending {
                return Err(ApprovalError::NotPending(approval_id.to_string()));
            }
            entry.record.status = if approve {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Denied
            };
            entry.decided.cancel();
            entry.record.status
        };
        tracing::info!(target: "audit", approval_id, %status, "Approval resolved");
        self.bus.publish(
            "approval.updated",
            serde_json::json!({
                "approval_id": approval_id,
                "status": status.to_string(),
            }),
        );
        Ok(status)
    }

    pub fn get(&self, approval_id: &str) -> Option<ApprovalRecord> {
        self.entries
            .lock()
            .unwrap()
            .get(approval_id)
            .map(|e| e.record.clone())
    }

    pub fn list(&self) -> Vec<ApprovalRecord> {
        let mut records: Vec<ApprovalRecord> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Programmatic hook: create an approval and block until it is decided
    /// or the caller's context is cancelled (treated as denial). External
    /// tooling blocks on the same records WS clients see.
    #[allow(dead_code)] // In-process hook for embedding callers
    pub async fn request_and_wait(
        &self,
        ctx: CancellationToken,
        action: &str,
        details: &str,
    ) -> bool {
        let record = self.request(action, details);
        let decided = {
            let entries = self.entries.lock().unwrap();
            entries
                .get(&record.approval_id)
                .map(|e| e.decided.clone())
        };
        let Some(decided) = decided else { return false };

        tokio::select! {
            () = ctx.cancelled() => {
                tracing::info!(
                    target: "audit",
                    approval_id = %record.approval_id,
                    "Approval wait abandoned by caller"
                );
                false
            }
            () = decided.cancelled() => {
                let approved = self
                    .get(&record.approval_id)
                    .is_some_and(|r| r.status == ApprovalStatus::Approved);
                tracing::info!(
                    target: "audit",
                    approval_id = %record.approval_id,
                    approved,
                    "Approval wait decided"
                );
                approved
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(timeout_ms: u64) -> ApprovalBroker {
        ApprovalBroker::new(Bus::new(), Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_respond_approves_and_wakes_waiter() {
        let broker = Arc::new(broker(60_000));
        let record = broker.request("deploy", "ship it");
        assert_eq!(record.status, ApprovalStatus::Pending);

        let waiter = {
            let broker = Arc::clone(&broker);
            let id = record.approval_id.clone();
            tokio::spawn(async move {
                let entry_token = {
                    let entries = broker.entries.lock().unwrap();
                    entries.get(&id).unwrap().decided.clone()
                };
                entry_token.cancelled().await;
                broker.get(&id).unwrap().status
            })
        };

        let status = broker.respond(&record.approval_id, true).unwrap();
        assert_eq!(status, ApprovalStatus::Approved);
        assert_eq!(waiter.await.unwrap(), ApprovalStatus::Approved);

        // A second response hits the non-pending guard.
        let err = broker.respond(&record.approval_id, false).unwrap_err();
        assert!(matches!(err, ApprovalError::NotPending(_)));
    }

    #[tokio::test]
    async fn test_timeout_defaults_to_denied() {
        let broker = broker(30);
        let bus_events = broker.bus.clone();
        let mut sub = bus_events.subscribe("approval.");

        let record = broker.request("risky", "needs a human");
        assert_eq!(sub.recv().await.unwrap().topic, "approval.required");

        let updated = sub.recv().await.unwrap();
        assert_eq!(updated.topic, "approval.updated");
        assert_eq!(updated.payload["status"], "DENIED");
        assert_eq!(
            broker.get(&record.approval_id).unwrap().status,
            ApprovalStatus::Denied
        );

        // Late response is rejected; the waiter was woken exactly once.
        assert!(broker.respond(&record.approval_id, true).is_err());
    }

    #[tokio::test]
    async fn test_request_and_wait_resolution() {
        let broker = Arc::new(broker(60_000));

        let waiting = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .request_and_wait(CancellationToken::new(), "tool", "run rm -rf")
                    .await
            })
        };
        // Let the request land, then approve it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let record = broker.list().pop().unwrap();
        broker.respond(&record.approval_id, true).unwrap();
        assert!(waiting.await.unwrap());
    }

    #[tokio::test]
    async fn test_request_and_wait_caller_cancel_is_denial() {
        let broker = broker(60_000);
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(!broker.request_and_wait(ctx, "tool", "x").await);
    }
}
