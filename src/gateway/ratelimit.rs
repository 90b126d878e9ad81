//! Token-bucket rate limiting middleware.
//!
//! One bucket per key (API key when presented, else remote address). Buckets
//! refill at `rpm / 60` tokens per second up to the burst ceiling; a request
//! that finds no whole token gets a 429 with `Retry-After: 1`. Health and
//! metrics paths bypass the limiter.

use super::auth::extract_token;
use super::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

const BYPASS_PATHS: &[&str] = &["/healthz", "/metrics", "/metrics/prometheus"];

/// Buckets idle longer than this are reaped.
const BUCKET_MAX_AGE: Duration = Duration::from_secs(600);

struct Bucket {
    tokens: f64,
    last: Instant,
}

pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    refill_rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rpm: u32, burst: u32) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            refill_rate: f64::from(rpm) / 60.0,
            burst: f64::from(burst.max(1)),
        }
    }

    /// Take one token for `key` if available.
    pub fn allow(&self, key: &str) -> bool {
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.burst);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().unwrap().get(key) {
            return Arc::clone(bucket);
        }
        // Double-checked insert under the write lock.
        let mut buckets = self.buckets.write().unwrap();
        Arc::clone(buckets.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket {
                tokens: self.burst,
                last: Instant::now(),
            }))
        }))
    }

    /// Periodically evict buckets nobody has touched in a while.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                limiter
                    .buckets
                    .write()
                    .unwrap()
                    .retain(|_, bucket| bucket.lock().unwrap().last.elapsed() < BUCKET_MAX_AGE);
            }
        });
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.read().unwrap().len()
    }
}

pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(limiter) = state.rate_limiter.as_ref() else {
        return next.run(request).await;
    };
    if BYPASS_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let key = extract_token(&request).unwrap_or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
    });

    if limiter.allow(&key) {
        next.run(request).await
    } else {
        state.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", "1")],
            Json(json!({ "error": "rate limit exceeded" })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_deny() {
        let limiter = RateLimiter::new(60, 3);
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = RateLimiter::new(60, 1);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = RateLimiter::new(6000, 1); // 100 tokens/sec
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow("k"));
    }
}
