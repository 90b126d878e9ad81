//! In-process topic pub/sub with bounded per-subscriber buffers.
//!
//! Producers (engines, the approval broker) publish tagged payloads;
//! consumers (WebSocket clients, SSE handlers, stream waiters) subscribe by
//! topic prefix. Publishing never blocks: a subscriber whose buffer is full
//! loses the event (logged and counted) without affecting anyone else.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Per-subscription buffer capacity.
const SUBSCRIPTION_BUFFER: usize = 64;

/// One published event
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
}

struct Subscriber {
    id: u64,
    prefix: String,
    tx: mpsc::Sender<BusEvent>,
}

struct Inner {
    subscribers: Vec<Subscriber>,
}

/// Shared bus handle
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers: Vec::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to all topics starting with `prefix`.
    pub fn subscribe(&self, prefix: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap().subscribers.push(Subscriber {
            id,
            prefix: prefix.to_string(),
            tx,
        });
        Subscription {
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Publish an event to every matching subscriber. Non-blocking: full
    /// subscriber buffers drop the event for that subscriber only.
    pub fn publish(&self, topic: &str, payload: Value) {
        let inner = self.inner.lock().unwrap();
        for sub in inner
            .subscribers
            .iter()
            .filter(|s| topic.starts_with(&s.prefix))
        {
            let event = BusEvent {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic, subscriber = sub.id, "Bus subscriber full, dropping event");
            }
        }
    }

    /// Total events dropped across all subscribers since startup.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn unsubscribe_id(&self, id: u64) {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .retain(|s| s.id != id);
    }
}

/// Receive handle for one subscription. Unsubscribes on drop; any read after
/// unsubscription yields `None`.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<BusEvent>,
    bus: Bus,
}

impl Subscription {
    /// Receive the next event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    #[allow(dead_code)] // Used in tests
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }

    /// Explicitly detach from the bus. Idempotent; `Drop` does the same.
    pub fn unsubscribe(&mut self) {
        self.bus.unsubscribe_id(self.id);
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe_id(self.id);
    }
}
