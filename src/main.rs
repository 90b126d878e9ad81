//! goclaw - multi-agent runtime
//!
//! Hosts named LLM-backed agents, each with a durable lease-claimed task
//! queue and worker pool, behind a JSON-RPC WebSocket + REST gateway.

mod approval;
mod bus;
mod config;
mod engine;
mod gateway;
mod metrics;
mod policy;
mod processor;
mod registry;
mod store;

use approval::ApprovalBroker;
use bus::Bus;
use config::Config;
use gateway::{create_router, AppState};
use metrics::Metrics;
use policy::StaticPolicy;
use registry::{chat_processor_factory, AgentConfig, Registry, DEFAULT_AGENT_ID};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cadence of the lease-expiry reaper.
const REAPER_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "goclaw=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(Config::from_env());
    if config.api_token.is_none() {
        tracing::warn!("No GOCLAW_API_TOKEN configured. The gateway is running open (dev mode).");
    }

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.db_path, "Opening store");
    let store = Store::open(&config.db_path)?;

    let bus = Bus::new();
    let metrics = Arc::new(Metrics::new());
    let policy = Arc::new(StaticPolicy::allow_all());
    let approvals = Arc::new(ApprovalBroker::new(bus.clone(), config.approval_timeout));

    let registry = Arc::new(Registry::new(
        store.clone(),
        bus.clone(),
        Arc::clone(&metrics),
        chat_processor_factory(),
        config.poll_interval,
        engine::DEFAULT_MAX_RETRIES,
    ));

    // Bring persisted agents back, then make sure the reserved default agent
    // exists and runs.
    if let Err(e) = registry.restore_persisted_agents().await {
        tracing::error!(error = %e, "Some agents failed to restore");
    }
    if registry.get_agent(DEFAULT_AGENT_ID).is_none() {
        registry
            .create_agent(AgentConfig {
                agent_id: DEFAULT_AGENT_ID.to_string(),
                ..AgentConfig::default()
            })
            .await?;
    }
    tracing::info!(
        agents = registry.list_running_agents().len(),
        "Registry ready"
    );

    spawn_lease_reaper(store.clone(), Arc::clone(&metrics));

    let state = AppState::new(
        store,
        bus,
        Arc::clone(&registry),
        approvals,
        policy,
        Arc::clone(&metrics),
        Arc::clone(&config),
    );
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("goclaw listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let drain_timeout = config.drain_timeout;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutting down, draining engines");
    registry.drain_all(drain_timeout).await;
    Ok(())
}

/// Return expired leases to the queue (or the dead-letter state past the
/// retry budget). Engines pick requeued work up on their next poll tick.
fn spawn_lease_reaper(store: Store, metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(REAPER_INTERVAL);
        loop {
            tick.tick().await;
            match store.expire_leases(chrono::Utc::now(), engine::DEFAULT_MAX_RETRIES) {
                Ok(0) => {}
                Ok(expired) => {
                    metrics.lease_expiries.fetch_add(expired, Ordering::Relaxed);
                    tracing::warn!(expired, "Expired task leases requeued");
                }
                Err(e) => tracing::error!(error = %e, "Lease reaper pass failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
