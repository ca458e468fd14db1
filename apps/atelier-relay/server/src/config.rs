use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::registry::ChannelConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub channel: ChannelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            shutdown_grace: Duration::from_secs(5),
            channel: ChannelConfig::default(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "atelier-relay-server",
    author,
    version,
    about = "Realtime change relay for the boutique admin dashboard"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(
        long,
        env = "ATELIER_RELAY_LISTEN_ADDR",
        default_value = "127.0.0.1:8787"
    )]
    pub listen_addr: String,

    /// Seconds between heartbeat frames on an idle push channel.
    #[arg(long, env = "ATELIER_RELAY_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Upper bound on a single frame write before the channel is evicted.
    #[arg(long, env = "ATELIER_RELAY_WRITE_TIMEOUT_MS", default_value_t = 2000)]
    pub write_timeout_ms: u64,

    /// Channels whose stream stops draining for this long are reclaimed.
    #[arg(long, env = "ATELIER_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub idle_timeout_secs: u64,

    #[arg(long, env = "ATELIER_RELAY_RECLAIM_SECS", default_value_t = 30)]
    pub reclaim_secs: u64,

    /// Frames buffered per channel before writes start waiting.
    #[arg(long, env = "ATELIER_RELAY_CHANNEL_BUFFER", default_value_t = 64)]
    pub channel_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "ATELIER_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        if cli.heartbeat_secs == 0 {
            bail!("heartbeat interval must be at least one second");
        }
        if cli.idle_timeout_secs <= cli.heartbeat_secs {
            bail!(
                "idle timeout ({}s) must exceed the heartbeat interval ({}s)",
                cli.idle_timeout_secs,
                cli.heartbeat_secs
            );
        }
        if cli.write_timeout_ms == 0 || cli.reclaim_secs == 0 {
            bail!("write timeout and reclaim interval must be non-zero");
        }

        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            channel: ChannelConfig {
                per_channel_buffer: cli.channel_buffer.max(1),
                heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
                write_timeout: Duration::from_millis(cli.write_timeout_ms),
                idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
                reclaim_interval: Duration::from_secs(cli.reclaim_secs),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["atelier-relay-server"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn defaults_match_channel_defaults() {
        let config = ServerConfig::try_from(parse(&[])).unwrap();
        let defaults = ChannelConfig::default();
        assert_eq!(config.channel.heartbeat_interval, defaults.heartbeat_interval);
        assert_eq!(config.channel.write_timeout, defaults.write_timeout);
        assert_eq!(config.channel.idle_timeout, defaults.idle_timeout);
        assert_eq!(config.listen_addr, ServerConfig::default().listen_addr);
    }

    #[test]
    fn rejects_idle_timeout_below_heartbeat() {
        let err = ServerConfig::try_from(parse(&[
            "--heartbeat-secs",
            "30",
            "--idle-timeout-secs",
            "20",
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("idle timeout"));
    }

    #[test]
    fn rejects_bad_listen_addr() {
        assert!(ServerConfig::try_from(parse(&["--listen-addr", "nowhere"])).is_err());
    }
}
