use std::time::Instant;

use atelier_relay_core::{ChangeEvent, ConnectionInfo, Frame};
use futures_util::future::join_all;
use metrics::{counter, histogram};
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

use crate::{
    instruments,
    registry::{ChannelRegistry, FanoutTarget},
};

/// Fans change events out to every registered channel except the one that
/// produced them.
#[derive(Clone)]
pub struct BroadcastHub {
    registry: ChannelRegistry,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Channels the frame was written to.
    pub delivered: usize,
    /// Channels removed because the write failed or timed out.
    pub evicted: usize,
    /// Registry size once the fan-out settled.
    pub active_connections: usize,
}

impl BroadcastHub {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub async fn publish(&self, event: ChangeEvent) -> BroadcastOutcome {
        let started = Instant::now();
        let targets = self.registry.fanout_targets(&event.source_client_id);
        let write_timeout = self.registry.config().write_timeout;
        let frame = Frame::data_change(event);

        let writes = targets.into_iter().map(|target| {
            let frame = frame.clone();
            async move {
                let result = target.sender.send_timeout(frame, write_timeout).await;
                (target, result)
            }
        });

        let mut outcome = BroadcastOutcome::default();
        for (target, result) in join_all(writes).await {
            match result {
                Ok(()) => outcome.delivered += 1,
                Err(err) => {
                    self.evict(&target, &err);
                    outcome.evicted += 1;
                }
            }
        }
        outcome.active_connections = self.registry.count();

        let data_type = match &frame {
            Frame::DataChange { event } => instruments::data_type_label(&event.data_type),
            _ => "other",
        };
        counter!(instruments::BROADCASTS_TOTAL, "type" => data_type).increment(1);
        counter!(instruments::FRAMES_DELIVERED_TOTAL).increment(outcome.delivered as u64);
        histogram!(instruments::BROADCAST_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        debug!(
            target: "relay.hub",
            data_type,
            delivered = outcome.delivered,
            evicted = outcome.evicted,
            active_connections = outcome.active_connections,
            "change event fanned out"
        );

        outcome
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.registry.connection_info()
    }

    fn evict(&self, target: &FanoutTarget, err: &SendTimeoutError<Frame>) {
        let reason = match err {
            SendTimeoutError::Timeout(_) => "timeout",
            SendTimeoutError::Closed(_) => "closed",
        };
        warn!(
            target: "relay.hub",
            client_id = %target.client_id,
            connection_id = %target.connection_id,
            reason,
            "push write failed; evicting channel"
        );
        counter!(instruments::WRITE_FAILURES_TOTAL, "reason" => reason).increment(1);
        self.registry.evict(&target.client_id, target.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::registry::ChannelConfig;
    use atelier_relay_core::DataType;
    use serde_json::json;

    fn hub() -> BroadcastHub {
        BroadcastHub::new(ChannelRegistry::new(ChannelConfig::default()))
    }

    fn event_from(source: &str) -> ChangeEvent {
        ChangeEvent::new(DataType::Products, json!({ "msg": "hi" }), source)
    }

    #[tokio::test]
    async fn publish_skips_source_channel() {
        let hub = hub();
        let mut a = hub.registry().register("a1".into(), None);
        let mut b = hub.registry().register("b1".into(), None);
        let _ = a.receiver.recv().await;
        let _ = b.receiver.recv().await;

        let outcome = hub.publish(event_from("a1")).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.evicted, 0);
        assert_eq!(outcome.active_connections, 2);

        match b.receiver.recv().await {
            Some(Frame::DataChange { event }) => {
                assert_eq!(event.source_client_id, "a1");
                assert_eq!(event.data["msg"], "hi");
            }
            other => panic!("expected dataChange, got {other:?}"),
        }
        assert!(a.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_reaches_every_other_channel() {
        let hub = hub();
        let mut receivers: Vec<_> = (0..5)
            .map(|i| hub.registry().register(format!("c{i}"), None))
            .collect();

        let outcome = hub.publish(event_from("c0")).await;
        assert_eq!(outcome.delivered, 4);

        for registration in receivers.iter_mut().skip(1) {
            let _ = registration.receiver.recv().await;
            assert!(matches!(
                registration.receiver.recv().await,
                Some(Frame::DataChange { .. })
            ));
        }
    }

    #[tokio::test]
    async fn publish_from_unregistered_source_reaches_everyone() {
        let hub = hub();
        let _a = hub.registry().register("a1".into(), None);
        let _b = hub.registry().register("b1".into(), None);

        let outcome = hub.publish(event_from("server-job")).await;
        assert_eq!(outcome.delivered, 2);
    }

    #[tokio::test]
    async fn closed_channel_is_evicted_during_fanout() {
        let hub = hub();
        let _a = hub.registry().register("a1".into(), None);
        let b = hub.registry().register("b1".into(), None);
        let _c = hub.registry().register("c1".into(), None);
        drop(b);

        let outcome = hub.publish(event_from("a1")).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.evicted, 1);
        assert_eq!(outcome.active_connections, 2);
        assert!(!hub.registry().contains("b1"));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn stalled_channel_is_evicted_after_write_timeout() {
        let hub = BroadcastHub::new(ChannelRegistry::new(ChannelConfig {
            per_channel_buffer: 1,
            write_timeout: Duration::from_millis(50),
            ..ChannelConfig::default()
        }));
        // The connected frame fills the single slot and is never drained.
        let _stalled = hub.registry().register("stalled".into(), None);

        let outcome = hub.publish(event_from("a1")).await;
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.evicted, 1);
        assert_eq!(hub.connection_info().active_connections, 0);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn stalled_channel_does_not_hold_back_healthy_ones() {
        let write_timeout = Duration::from_millis(1500);
        let hub = BroadcastHub::new(ChannelRegistry::new(ChannelConfig {
            per_channel_buffer: 1,
            write_timeout,
            ..ChannelConfig::default()
        }));
        let _stalled = hub.registry().register("stalled".into(), None);
        let mut healthy = hub.registry().register("healthy".into(), None);
        assert!(matches!(
            healthy.receiver.recv().await,
            Some(Frame::Connected { .. })
        ));

        let started = tokio::time::Instant::now();
        let publish = tokio::spawn({
            let hub = hub.clone();
            async move { hub.publish(event_from("a1")).await }
        });

        assert!(matches!(
            healthy.receiver.recv().await,
            Some(Frame::DataChange { .. })
        ));
        assert!(started.elapsed() < write_timeout / 10);

        let outcome = publish.await.unwrap();
        assert_eq!(
            outcome,
            BroadcastOutcome {
                delivered: 1,
                evicted: 1,
                active_connections: 1,
            }
        );
        assert!(started.elapsed() >= write_timeout);
        assert_eq!(hub.registry().connection_ids(), vec!["healthy".to_string()]);
    }
}
