//! Server side of the Atelier realtime relay.
//!
//! Browser tabs open a server-sent event stream on `GET /api/realtime`
//! and publish their own mutations with `POST /api/realtime`. Every
//! published change is fanned out to every other open stream.

pub mod config;
pub mod hub;
pub mod instruments;
pub mod registry;
pub mod routes;
pub mod stream;
pub mod telemetry;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

pub use config::{Cli, ServerConfig};
pub use hub::{BroadcastHub, BroadcastOutcome};
pub use registry::{ChannelConfig, ChannelRegistration, ChannelRegistry, ChannelSnapshot};
pub use routes::{build_router, ApiError, RelayState};
pub use stream::ChannelStream;

/// Binds the listener and serves the relay until ctrl-c.
pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let registry = ChannelRegistry::new(config.channel.clone());
    let reclaimer = registry.spawn_reclaimer();

    let mut state = RelayState::new(BroadcastHub::new(registry));
    if let Some(metrics) = metrics {
        state = state.with_metrics(metrics);
    }
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("atelier-relay listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    reclaimer.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
