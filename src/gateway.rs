//! Gateway: the HTTP/WebSocket surface over the runtime.
//!
//! JSON-RPC over WebSocket for the interactive protocol, REST for
//! inspection, SSE for token streams, and an OpenAI-compatible facade.

mod auth;
mod openai;
mod ratelimit;
mod rest;
mod rpc;
mod sse;
mod ws;

pub use ratelimit::RateLimiter;

use crate::approval::ApprovalBroker;
use crate::bus::Bus;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::policy::Policy;
use crate::registry::Registry;
use crate::store::Store;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub bus: Bus,
    pub registry: Arc<Registry>,
    pub approvals: Arc<ApprovalBroker>,
    pub policy: Arc<dyn Policy>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Runtime config overlay mutated by `config.set`; in-memory only.
    pub overrides: Arc<Mutex<HashMap<String, String>>>,
    pub started_at: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: Bus,
        registry: Arc<Registry>,
        approvals: Arc<ApprovalBroker>,
        policy: Arc<dyn Policy>,
        metrics: Arc<Metrics>,
        config: Arc<Config>,
    ) -> Self {
        let rate_limiter = (config.rate_limit_rpm > 0).then(|| {
            let limiter = Arc::new(RateLimiter::new(
                config.rate_limit_rpm,
                config.rate_limit_burst,
            ));
            limiter.spawn_reaper();
            limiter
        });
        Self {
            store,
            bus,
            registry,
            approvals,
            policy,
            metrics,
            config,
            rate_limiter,
            overrides: Arc::new(Mutex::new(HashMap::new())),
            started_at: std::time::Instant::now(),
        }
    }
}

/// Assemble the full router: WS, REST, SSE and the OpenAI surface, wrapped
/// in rate limiting, bearer auth, CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(rest::healthz))
        .route("/version", get(rest::version))
        .route("/metrics", get(rest::metrics_json))
        .route("/metrics/prometheus", get(rest::metrics_prometheus))
        .route("/api/tasks", get(rest::list_tasks))
        .route("/api/tasks/:id", get(rest::get_task))
        .route("/api/sessions", get(rest::list_sessions))
        .route("/api/sessions/:id/messages", get(rest::session_messages))
        .route("/api/skills", get(rest::skills))
        .route("/api/config", get(rest::api_config))
        .route("/api/plans", get(rest::plans))
        .route("/api/v1/task/stream", get(sse::task_stream))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(openai::list_models))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit::rate_limit,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    let router = match cors_layer(&state.config) {
        Some(cors) => router.layer(cors),
        None => router,
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    if config.allowed_origins.is_empty() {
        return None;
    }
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(600));
    let layer = if config.allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<_> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    };
    Some(layer)
}
