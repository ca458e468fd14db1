use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use atelier_relay_core::{ConnectionInfo, Frame};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{instruments, stream::ChannelStream};

const DEFAULT_CHANNEL_DEPTH: usize = 64;

/// Timing and buffering knobs shared by every push channel.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub per_channel_buffer: usize,
    pub heartbeat_interval: Duration,
    /// Upper bound on a single frame write before the channel is treated as dead.
    pub write_timeout: Duration,
    /// A channel whose stream has not pulled a frame for this long is reclaimed.
    pub idle_timeout: Duration,
    pub reclaim_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            per_channel_buffer: DEFAULT_CHANNEL_DEPTH,
            heartbeat_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(90),
            reclaim_interval: Duration::from_secs(30),
        }
    }
}

/// In-process map from client id to its open push channel.
///
/// The registry is single-process: two relay instances never see each
/// other's channels, so subscribers are partitioned per instance.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    channels: DashMap<String, ChannelEntry>,
    config: ChannelConfig,
    epoch: Instant,
}

struct ChannelEntry {
    connection_id: Uuid,
    user_id: Option<String>,
    created_at: DateTime<Utc>,
    sender: mpsc::Sender<Frame>,
    last_drained: Arc<AtomicU64>,
    heartbeat: JoinHandle<()>,
}

impl Drop for ChannelEntry {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// Everything the caller needs to serve a freshly registered channel.
pub struct ChannelRegistration {
    pub client_id: String,
    pub connection_id: Uuid,
    pub receiver: mpsc::Receiver<Frame>,
    pub active_connections: usize,
    /// True when an older channel with the same client id was closed.
    pub replaced: bool,
    drain: DrainMarker,
    registry: ChannelRegistry,
}

impl ChannelRegistration {
    /// Turns the registration into the frame stream served to the client.
    /// Dropping the stream unregisters the channel.
    pub fn into_stream(self) -> ChannelStream {
        ChannelStream::new(
            self.receiver,
            self.drain,
            self.registry,
            self.client_id,
            self.connection_id,
        )
    }
}

/// Records when a channel's stream last pulled a frame.
#[derive(Clone)]
pub(crate) struct DrainMarker {
    epoch: Instant,
    last: Arc<AtomicU64>,
}

impl DrainMarker {
    pub(crate) fn touch(&self) {
        self.last
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

/// A channel selected for a fan-out write.
pub(crate) struct FanoutTarget {
    pub client_id: String,
    pub connection_id: Uuid,
    pub sender: mpsc::Sender<Frame>,
}

#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub client_id: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChannelRegistry {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                channels: DashMap::new(),
                config,
                epoch: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Opens a channel for `client_id`, queues its `connected` frame and
    /// starts its heartbeat. A live channel with the same id is closed and
    /// replaced.
    pub fn register(&self, client_id: String, user_id: Option<String>) -> ChannelRegistration {
        let config = &self.inner.config;
        let (sender, receiver) = mpsc::channel(config.per_channel_buffer.max(1));
        let connection_id = Uuid::new_v4();

        // Fresh channel with capacity >= 1, so the handshake frame always fits.
        let _ = sender.try_send(Frame::connected(client_id.clone()));

        let last_drained = Arc::new(AtomicU64::new(self.now_millis()));
        let heartbeat = spawn_heartbeat(
            Arc::downgrade(&self.inner),
            config,
            client_id.clone(),
            connection_id,
            sender.clone(),
        );
        let entry = ChannelEntry {
            connection_id,
            user_id: user_id.clone(),
            created_at: Utc::now(),
            sender,
            last_drained: Arc::clone(&last_drained),
            heartbeat,
        };

        let previous = self.inner.channels.insert(client_id.clone(), entry);
        let replaced = previous.is_some();
        if let Some(previous) = previous {
            info!(
                target: "relay.registry",
                client_id = %client_id,
                superseded_connection = %previous.connection_id,
                "client id re-registered; closing superseded channel"
            );
            counter!(instruments::CHANNELS_SUPERSEDED_TOTAL).increment(1);
            drop(previous);
        }

        let active_connections = self.count();
        gauge!(instruments::CONNECTIONS_ACTIVE).set(active_connections as f64);
        counter!(instruments::CONNECTIONS_TOTAL).increment(1);
        info!(
            target: "relay.registry",
            client_id = %client_id,
            connection_id = %connection_id,
            user_id = ?user_id,
            active_connections,
            "push channel registered"
        );

        ChannelRegistration {
            client_id,
            connection_id,
            receiver,
            active_connections,
            replaced,
            drain: DrainMarker {
                epoch: self.inner.epoch,
                last: last_drained,
            },
            registry: self.clone(),
        }
    }

    /// Removes the channel for `client_id`. Safe to call for unknown ids.
    pub fn unregister(&self, client_id: &str) -> bool {
        let removed = self.inner.channels.remove(client_id);
        let found = removed.is_some();
        drop(removed);
        if found {
            self.on_removed(client_id, "unregistered");
        }
        found
    }

    /// Removes the channel only while it still belongs to `connection_id`,
    /// so a stale connection can never evict the one that replaced it.
    pub fn unregister_connection(&self, client_id: &str, connection_id: Uuid) -> bool {
        remove_connection(&self.inner, client_id, connection_id, "closed")
    }

    pub(crate) fn evict(&self, client_id: &str, connection_id: Uuid) -> bool {
        remove_connection(&self.inner, client_id, connection_id, "write_failed")
    }

    pub fn count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.inner.channels.contains_key(client_id)
    }

    /// Sorted ids of every live channel.
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let connection_ids = self.connection_ids();
        ConnectionInfo {
            active_connections: connection_ids.len(),
            connection_ids,
        }
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let mut channels: Vec<ChannelSnapshot> = self
            .inner
            .channels
            .iter()
            .map(|entry| ChannelSnapshot {
                client_id: entry.key().clone(),
                user_id: entry.user_id.clone(),
                created_at: entry.created_at,
            })
            .collect();
        channels.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        channels
    }

    pub(crate) fn fanout_targets(&self, exclude_client_id: &str) -> Vec<FanoutTarget> {
        self.inner
            .channels
            .iter()
            .filter(|entry| entry.key().as_str() != exclude_client_id)
            .map(|entry| FanoutTarget {
                client_id: entry.key().clone(),
                connection_id: entry.connection_id,
                sender: entry.sender.clone(),
            })
            .collect()
    }

    /// Closes every channel whose stream has not pulled a frame within the
    /// idle timeout. Returns how many were reclaimed.
    pub fn reclaim_idle(&self) -> usize {
        let now = self.now_millis();
        let idle_ms = self.inner.config.idle_timeout.as_millis() as u64;
        let idle: Vec<(String, Uuid)> = self
            .inner
            .channels
            .iter()
            .filter(|entry| {
                now.saturating_sub(entry.last_drained.load(Ordering::Relaxed)) > idle_ms
            })
            .map(|entry| (entry.key().clone(), entry.connection_id))
            .collect();

        let mut reclaimed = 0usize;
        for (client_id, connection_id) in idle {
            if remove_connection(&self.inner, &client_id, connection_id, "idle_timeout") {
                counter!(instruments::IDLE_RECLAIMED_TOTAL).increment(1);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn spawn_reclaimer(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.inner.config.reclaim_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let reclaimed = registry.reclaim_idle();
                if reclaimed > 0 {
                    info!(target: "relay.registry", reclaimed, "reclaimed idle push channels");
                }
            }
        })
    }

    fn now_millis(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    fn on_removed(&self, client_id: &str, reason: &'static str) {
        on_removed(&self.inner, client_id, reason);
    }
}

fn remove_connection(
    inner: &RegistryInner,
    client_id: &str,
    connection_id: Uuid,
    reason: &'static str,
) -> bool {
    let removed = inner
        .channels
        .remove_if(client_id, |_, entry| entry.connection_id == connection_id);
    let found = removed.is_some();
    // Entry (and its heartbeat) is torn down outside the map's shard lock.
    drop(removed);
    if found {
        on_removed(inner, client_id, reason);
    }
    found
}

fn on_removed(inner: &RegistryInner, client_id: &str, reason: &'static str) {
    let active = inner.channels.len();
    gauge!(instruments::CONNECTIONS_ACTIVE).set(active as f64);
    counter!(instruments::CONNECTIONS_CLOSED_TOTAL, "reason" => reason).increment(1);
    debug!(
        target: "relay.registry",
        client_id = %client_id,
        reason,
        active_connections = active,
        "push channel removed"
    );
}

fn spawn_heartbeat(
    registry: Weak<RegistryInner>,
    config: &ChannelConfig,
    client_id: String,
    connection_id: Uuid,
    sender: mpsc::Sender<Frame>,
) -> JoinHandle<()> {
    let period = config.heartbeat_interval;
    let write_timeout = config.write_timeout;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = sender.send_timeout(Frame::heartbeat(), write_timeout).await {
                warn!(
                    target: "relay.registry",
                    client_id = %client_id,
                    connection_id = %connection_id,
                    error = %err,
                    "heartbeat write failed; closing channel"
                );
                if let Some(inner) = registry.upgrade() {
                    remove_connection(&inner, &client_id, connection_id, "heartbeat_failed");
                }
                break;
            }
            counter!(instruments::HEARTBEATS_TOTAL).increment(1);
        }
    })
}
