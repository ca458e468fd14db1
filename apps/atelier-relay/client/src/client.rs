use std::{collections::HashMap, sync::Arc};

use atelier_relay_core::{ChangeEvent, DataType};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    auth::AuthProvider,
    config::RealtimeConfig,
    filter::{SelfOriginFilter, StalenessTracker, TypeFreshness},
    notifier::ChangeNotifier,
    polling::{DataFetcher, PollingTransport},
    push_channel::PushChannelTransport,
    selector::{CurrentMethod, TransportSelector},
    subscription::SubscriptionTransport,
    transport::{Transport, TransportError, TransportSignal, TransportSink, TransportState, TransportStatus},
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Builder for a running [`RealtimeHandle`].
pub struct RealtimeClient {
    config: RealtimeConfig,
    auth: Arc<dyn AuthProvider>,
    fetcher: Option<Arc<dyn DataFetcher>>,
    transports: Vec<Arc<dyn Transport>>,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            config,
            auth,
            fetcher: None,
            transports: Vec::new(),
        }
    }

    /// Query layer backing the polling transport. Polling stays off
    /// without one.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn DataFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Uses `transport` instead of the ones derived from the config.
    /// Once any transport is supplied this way, only supplied transports run.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    fn build_transports(&self) -> Result<Vec<Arc<dyn Transport>>, TransportError> {
        if !self.transports.is_empty() {
            return Ok(self.transports.clone());
        }

        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        if self.config.enable_subscription && self.config.graphql_ws_url.is_some() {
            transports.push(Arc::new(SubscriptionTransport::new(
                self.config.clone(),
                Arc::clone(&self.auth),
            )?));
        }
        if self.config.enable_push_channel {
            transports.push(Arc::new(PushChannelTransport::new(
                self.config.clone(),
                Arc::clone(&self.auth),
            )?));
        }
        if self.config.enable_polling {
            match &self.fetcher {
                Some(fetcher) => transports.push(Arc::new(PollingTransport::new(
                    Arc::clone(fetcher),
                    self.config.watched.clone(),
                    self.config.poll_interval,
                ))),
                None => debug!(target: "relay.client", "polling enabled without a data fetcher; skipping"),
            }
        }
        Ok(transports)
    }

    /// Connects every transport and starts the driver that reconciles them.
    pub async fn start(self) -> Result<RealtimeHandle, TransportError> {
        let transports = self.build_transports()?;

        let user_scope = if self.config.scope_to_user {
            self.auth.user_id()
        } else {
            None
        };
        let filter = SelfOriginFilter::new(self.config.client_id.clone()).with_user_scope(user_scope);
        let selector = TransportSelector::new(transports.iter().map(|t| t.kind()));
        let shared = Arc::new(Shared {
            selector: Mutex::new(selector),
            tracker: Mutex::new(StalenessTracker::new()),
            watched: self.config.watched.clone(),
            filter,
        });

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (method_tx, method_rx) = watch::channel(shared.selector.lock().current());
        let method_tx = Arc::new(method_tx);

        let driver = tokio::spawn(drive(
            signal_rx,
            Arc::clone(&shared),
            events.clone(),
            Arc::clone(&method_tx),
        ));

        for transport in &transports {
            let sink = TransportSink::new(transport.kind(), signal_tx.clone());
            if let Err(err) = transport.connect(sink.clone()).await {
                warn!(
                    target: "relay.client",
                    transport = %transport.kind(),
                    error = %err,
                    "transport failed to start"
                );
                sink.error(err);
            }
        }

        info!(
            target: "relay.client",
            client_id = %self.config.client_id,
            transports = transports.len(),
            "realtime client started"
        );

        Ok(RealtimeHandle {
            client_id: self.config.client_id.clone(),
            notifier: ChangeNotifier::new(self.config, self.auth),
            shared,
            events,
            method_tx,
            method_rx,
            transports,
            driver,
        })
    }
}

struct Shared {
    selector: Mutex<TransportSelector>,
    tracker: Mutex<StalenessTracker>,
    watched: Vec<DataType>,
    filter: SelfOriginFilter,
}

/// Point-in-time view for diagnostics panels.
#[derive(Debug, Clone)]
pub struct RealtimeStatus {
    pub method: CurrentMethod,
    pub transports: Vec<TransportState>,
    pub freshness: HashMap<DataType, TypeFreshness>,
}

pub struct RealtimeHandle {
    client_id: String,
    notifier: ChangeNotifier,
    shared: Arc<Shared>,
    events: broadcast::Sender<ChangeEvent>,
    method_tx: Arc<watch::Sender<CurrentMethod>>,
    method_rx: watch::Receiver<CurrentMethod>,
    transports: Vec<Arc<dyn Transport>>,
    driver: JoinHandle<()>,
}

impl RealtimeHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Accepted changes from the active transport.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub fn current_method(&self) -> CurrentMethod {
        *self.method_rx.borrow()
    }

    pub fn watch_method(&self) -> watch::Receiver<CurrentMethod> {
        self.method_rx.clone()
    }

    pub fn status(&self) -> RealtimeStatus {
        let selector = self.shared.selector.lock();
        RealtimeStatus {
            method: selector.current(),
            transports: selector.states().to_vec(),
            freshness: self.shared.tracker.lock().snapshot(),
        }
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub async fn shutdown(self) {
        for transport in &self.transports {
            transport.disconnect().await;
        }
        self.driver.abort();
        if let Some(change) = self.shared.selector.lock().reset() {
            debug!(target: "relay.client", from = ?change.from, "realtime client stopped");
        }
        self.method_tx.send_replace(CurrentMethod::None);
    }
}

async fn drive(
    mut signals: mpsc::UnboundedReceiver<TransportSignal>,
    shared: Arc<Shared>,
    events: broadcast::Sender<ChangeEvent>,
    method: Arc<watch::Sender<CurrentMethod>>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            TransportSignal::Status {
                kind,
                status,
                error,
            } => {
                if status == TransportStatus::Error {
                    shared.tracker.lock().record_transport_error(&shared.watched);
                }
                let change = shared.selector.lock().apply(kind, status, error);
                if let Some(change) = change {
                    info!(
                        target: "relay.client",
                        from = ?change.from,
                        to = ?change.to,
                        trigger = %kind,
                        "realtime method changed"
                    );
                    method.send_replace(change.to);
                }
            }
            TransportSignal::Alive { kind } => {
                shared.selector.lock().record_activity(kind);
            }
            TransportSignal::Event { kind, event } => {
                let active = {
                    let mut selector = shared.selector.lock();
                    selector.record_activity(kind);
                    selector.is_active(kind)
                };
                if !active {
                    trace!(target: "relay.client", transport = %kind, "dropping event from standby transport");
                    continue;
                }
                if !shared.filter.should_accept(&event) {
                    trace!(target: "relay.client", event_id = %event.id, "dropping filtered event");
                    continue;
                }
                shared.tracker.lock().record_update(&event);
                let _ = events.send(event);
            }
            TransportSignal::FetchFailed {
                kind,
                data_type,
                error,
            } => {
                debug!(
                    target: "relay.client",
                    transport = %kind,
                    data_type = %data_type,
                    error = %error,
                    "data type refresh failed"
                );
                shared.tracker.lock().record_error(&data_type);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{auth::StaticAuth, transport::TransportKind};
    use async_trait::async_trait;
    use serde_json::json;

    /// Transport whose sink the test drives by hand.
    struct ManualTransport {
        kind: TransportKind,
        sink: Mutex<Option<TransportSink>>,
    }

    impl ManualTransport {
        fn new(kind: TransportKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                sink: Mutex::new(None),
            })
        }

        fn sink(&self) -> TransportSink {
            self.sink.lock().clone().expect("connected")
        }
    }

    #[async_trait]
    impl Transport for ManualTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn connect(&self, sink: TransportSink) -> Result<(), TransportError> {
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        async fn disconnect(&self) {
            self.sink.lock().take();
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<CurrentMethod>, expected: CurrentMethod) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|method| *method == expected))
            .await
            .expect("method transition")
            .expect("driver alive");
    }

    async fn start(
        transports: &[Arc<ManualTransport>],
        config: RealtimeConfig,
    ) -> RealtimeHandle {
        let mut client = RealtimeClient::new(config, Arc::new(StaticAuth::new("tok", "u-1")));
        for transport in transports {
            client = client.with_transport(transport.clone());
        }
        client.start().await.unwrap()
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn method_follows_transport_priority() {
        let subscription = ManualTransport::new(TransportKind::Subscription);
        let push = ManualTransport::new(TransportKind::PushChannel);
        let polling = ManualTransport::new(TransportKind::Polling);
        let handle = start(
            &[subscription.clone(), push.clone(), polling.clone()],
            RealtimeConfig::default().with_client_id("a1"),
        )
        .await;
        let mut method = handle.watch_method();
        assert_eq!(handle.current_method(), CurrentMethod::Polling);

        push.sink().status(TransportStatus::Connected);
        wait_for(&mut method, CurrentMethod::PushChannel).await;

        subscription.sink().status(TransportStatus::Connected);
        wait_for(&mut method, CurrentMethod::Subscription).await;

        subscription.sink().error("socket reset");
        wait_for(&mut method, CurrentMethod::PushChannel).await;

        push.sink().status(TransportStatus::Disconnected);
        wait_for(&mut method, CurrentMethod::Polling).await;

        let status = handle.status();
        assert_eq!(status.method, CurrentMethod::Polling);
        assert_eq!(status.transports.len(), 3);
        // The subscription error counted against every watched type.
        assert_eq!(status.freshness[&DataType::Orders].error_count, 1);

        handle.shutdown().await;
        assert_eq!(*method.borrow(), CurrentMethod::None);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn only_active_non_self_events_are_forwarded() {
        let subscription = ManualTransport::new(TransportKind::Subscription);
        let push = ManualTransport::new(TransportKind::PushChannel);
        let handle = start(
            &[subscription.clone(), push.clone()],
            RealtimeConfig::default().with_client_id("a1"),
        )
        .await;
        let mut method = handle.watch_method();
        let mut events = handle.subscribe();

        subscription.sink().status(TransportStatus::Connected);
        push.sink().status(TransportStatus::Connected);
        wait_for(&mut method, CurrentMethod::Subscription).await;

        // Standby transport.
        push.sink()
            .event(ChangeEvent::new(DataType::Orders, json!({ "via": "push" }), "b1"));
        // Own change echoed back.
        subscription
            .sink()
            .event(ChangeEvent::new(DataType::Orders, json!({ "via": "self" }), "a1"));
        subscription
            .sink()
            .event(ChangeEvent::new(DataType::Orders, json!({ "via": "subscription" }), "b1"));

        let received = events.recv().await.unwrap();
        assert_eq!(received.data["via"], "subscription");
        assert!(events.try_recv().is_err());

        let freshness = handle.status().freshness;
        assert_eq!(
            freshness[&DataType::Orders].last_value,
            Some(json!({ "via": "subscription" }))
        );

        handle.shutdown().await;
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn no_transports_means_no_method() {
        let config = RealtimeConfig::default().with_transports(false, false, true);
        // Polling without a fetcher is skipped.
        let handle = RealtimeClient::new(config, Arc::new(StaticAuth::default()))
            .start()
            .await
            .unwrap();
        assert_eq!(handle.current_method(), CurrentMethod::None);
        handle.shutdown().await;
    }
}
