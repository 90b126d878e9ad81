//! Process metrics: cheap atomic counters with JSON and Prometheus views.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub tasks_succeeded: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_canceled: AtomicU64,
    pub tasks_dead_letter: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub lease_expiries: AtomicU64,
    pub rate_limited: AtomicU64,
    pub ws_connections: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, bus_dropped: u64) -> Value {
        json!({
            "tasks_succeeded": self.tasks_succeeded.load(Ordering::Relaxed),
            "tasks_failed": self.tasks_failed.load(Ordering::Relaxed),
            "tasks_canceled": self.tasks_canceled.load(Ordering::Relaxed),
            "tasks_dead_letter": self.tasks_dead_letter.load(Ordering::Relaxed),
            "tasks_retried": self.tasks_retried.load(Ordering::Relaxed),
            "lease_expiries": self.lease_expiries.load(Ordering::Relaxed),
            "rate_limited": self.rate_limited.load(Ordering::Relaxed),
            "ws_connections": self.ws_connections.load(Ordering::Relaxed),
            "bus_dropped_events": bus_dropped,
        })
    }

    /// Prometheus text exposition format.
    pub fn prometheus(&self, bus_dropped: u64) -> String {
        let mut out = String::new();
        let counters = [
            ("goclaw_tasks_succeeded_total", self.tasks_succeeded.load(Ordering::Relaxed)),
            ("goclaw_tasks_failed_total", self.tasks_failed.load(Ordering::Relaxed)),
            ("goclaw_tasks_canceled_total", self.tasks_canceled.load(Ordering::Relaxed)),
            ("goclaw_tasks_dead_letter_total", self.tasks_dead_letter.load(Ordering::Relaxed)),
            ("goclaw_tasks_retried_total", self.tasks_retried.load(Ordering::Relaxed)),
            ("goclaw_lease_expiries_total", self.lease_expiries.load(Ordering::Relaxed)),
            ("goclaw_rate_limited_total", self.rate_limited.load(Ordering::Relaxed)),
            ("goclaw_bus_dropped_events_total", bus_dropped),
        ];
        for (name, value) in counters {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        let ws = self.ws_connections.load(Ordering::Relaxed);
        out.push_str(&format!(
            "# TYPE goclaw_ws_connections gauge\ngoclaw_ws_connections {ws}\n"
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_exposition() {
        let metrics = Metrics::new();
        metrics.tasks_succeeded.fetch_add(3, Ordering::Relaxed);
        metrics.ws_connections.fetch_add(2, Ordering::Relaxed);

        let snap = metrics.snapshot(7);
        assert_eq!(snap["tasks_succeeded"], 3);
        assert_eq!(snap["bus_dropped_events"], 7);

        let text = metrics.prometheus(7);
        assert!(text.contains("goclaw_tasks_succeeded_total 3"));
        assert!(text.contains("goclaw_ws_connections 2"));
        assert!(text.contains("# TYPE goclaw_bus_dropped_events_total counter"));
    }
}
