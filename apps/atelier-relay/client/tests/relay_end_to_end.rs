use std::{net::SocketAddr, sync::Arc, time::Duration};

use atelier_relay_client::{
    CurrentMethod, NotifyOutcome, RealtimeClient, RealtimeConfig, RealtimeHandle, StaticAuth,
};
use atelier_relay_core::DataType;
use atelier_relay_server::{build_router, BroadcastHub, ChannelConfig, ChannelRegistry, RelayState};
use serde_json::json;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

/// A relay served on a real socket that can be stopped mid-test.
struct Relay {
    addr: SocketAddr,
    registry: ChannelRegistry,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl Relay {
    async fn start() -> Self {
        Self::serve(TcpListener::bind("127.0.0.1:0").await.unwrap())
    }

    async fn restart_on(addr: SocketAddr) -> Self {
        for _ in 0..50 {
            if let Ok(listener) = TcpListener::bind(addr).await {
                return Self::serve(listener);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("could not rebind {addr}");
    }

    fn serve(listener: TcpListener) -> Self {
        let addr = listener.local_addr().unwrap();
        let registry = ChannelRegistry::new(ChannelConfig::default());
        let router = build_router(RelayState::new(BroadcastHub::new(registry.clone())));
        let (shutdown, signal) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            registry,
            shutdown,
            server,
        }
    }

    /// Stops accepting, then ends every open stream so the server drains.
    async fn stop(self) {
        let _ = self.shutdown.send(());
        for client_id in self.registry.connection_ids() {
            self.registry.unregister(&client_id);
        }
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .expect("relay drains after shutdown")
            .unwrap();
    }
}

async fn wait_for_method(handle: &RealtimeHandle, expected: CurrentMethod, within: Duration) {
    let mut method = handle.watch_method();
    tokio::time::timeout(within, method.wait_for(|m| *m == expected))
        .await
        .unwrap_or_else(|_| panic!("method never became {expected:?}"))
        .expect("driver alive");
}

async fn push_only_client(addr: SocketAddr, client_id: &str, user_id: &str) -> RealtimeHandle {
    let config = RealtimeConfig::default()
        .with_relay_url(format!("http://{addr}"))
        .with_client_id(client_id)
        .with_transports(false, true, false)
        .with_push_reconnect_delay(Duration::from_millis(100));
    let handle = RealtimeClient::new(config, Arc::new(StaticAuth::new("tok", user_id)))
        .start()
        .await
        .unwrap();
    wait_for_method(&handle, CurrentMethod::PushChannel, Duration::from_secs(5)).await;
    handle
}

#[test_timeout::tokio_timeout_test(20)]
async fn change_from_one_tab_reaches_the_other_only() {
    let relay = Relay::start().await;
    let a = push_only_client(relay.addr, "a1", "u-1").await;
    let b = push_only_client(relay.addr, "b1", "u-2").await;
    assert_eq!(relay.registry.connection_ids(), vec!["a1".to_string(), "b1".to_string()]);

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let outcome = a
        .notifier()
        .notify(DataType::Products, json!({ "msg": "hi" }))
        .await;
    assert_eq!(
        outcome,
        NotifyOutcome::Delivered {
            broadcast_count: 1,
            active_connections: 2,
        }
    );

    let event = tokio::time::timeout(Duration::from_secs(5), b_events.recv())
        .await
        .expect("b receives the change")
        .unwrap();
    assert_eq!(event.data["msg"], "hi");
    assert_eq!(event.source_client_id, "a1");
    assert_eq!(event.user_id.as_deref(), Some("u-1"));

    let echo = tokio::time::timeout(Duration::from_millis(300), a_events.recv()).await;
    assert!(echo.is_err(), "a must not see its own change");

    let freshness = b.status().freshness;
    assert_eq!(
        freshness[&DataType::Products].last_value,
        Some(json!({ "msg": "hi" }))
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn notify_without_relay_is_best_effort() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = RealtimeConfig::default()
        .with_relay_url(format!("http://{addr}"))
        .with_transports(false, true, false)
        .with_push_reconnect_delay(Duration::from_millis(50));
    let handle = RealtimeClient::new(config, Arc::new(StaticAuth::default()))
        .start()
        .await
        .unwrap();

    let outcome = handle
        .notifier()
        .notify(DataType::Orders, json!({ "id": 1 }))
        .await;
    assert!(matches!(outcome, NotifyOutcome::BestEffort { .. }));
    assert_eq!(handle.current_method(), CurrentMethod::None);

    handle.shutdown().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn push_channel_reconnects_after_relay_restart() {
    let reconnect_delay = Duration::from_millis(200);
    let relay = Relay::start().await;
    let addr = relay.addr;

    let config = RealtimeConfig::default()
        .with_relay_url(format!("http://{addr}"))
        .with_client_id("a1")
        .with_transports(false, true, false)
        .with_push_reconnect_delay(reconnect_delay);
    let handle = RealtimeClient::new(config, Arc::new(StaticAuth::default()))
        .start()
        .await
        .unwrap();
    wait_for_method(&handle, CurrentMethod::PushChannel, Duration::from_secs(5)).await;

    relay.stop().await;
    wait_for_method(&handle, CurrentMethod::None, Duration::from_secs(5)).await;

    // Let at least one reconnect attempt fail against the closed port.
    tokio::time::sleep(reconnect_delay * 2).await;
    assert_eq!(handle.current_method(), CurrentMethod::None);

    let relay = Relay::restart_on(addr).await;
    wait_for_method(
        &handle,
        CurrentMethod::PushChannel,
        reconnect_delay + Duration::from_secs(2),
    )
    .await;
    assert_eq!(relay.registry.connection_ids(), vec!["a1".to_string()]);

    handle.shutdown().await;
    relay.stop().await;
}
