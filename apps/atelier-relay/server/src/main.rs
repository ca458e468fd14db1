use anyhow::Result;
use atelier_relay_server::{telemetry::Telemetry, Cli, ServerConfig};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        heartbeat_secs = config.channel.heartbeat_interval.as_secs(),
        idle_timeout_secs = config.channel.idle_timeout.as_secs(),
        "starting atelier-relay server"
    );

    atelier_relay_server::run(config, Some(telemetry.metrics_handle())).await
}
