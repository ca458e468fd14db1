use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use atelier_relay_core::Frame;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest_eventsource::{Event, EventSource};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::{
    auth::AuthProvider,
    config::RealtimeConfig,
    transport::{Transport, TransportError, TransportKind, TransportSink, TransportStatus},
};

/// Server-sent event stream from the relay's `GET /api/realtime`.
pub struct PushChannelTransport {
    config: RealtimeConfig,
    auth: Arc<dyn AuthProvider>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PushChannelTransport {
    pub fn new(config: RealtimeConfig, auth: Arc<dyn AuthProvider>) -> Result<Self, TransportError> {
        // Reject a bad base URL up front rather than on every reconnect.
        config.realtime_endpoint()?;
        Ok(Self {
            config,
            auth,
            worker: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Transport for PushChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PushChannel
    }

    async fn connect(&self, sink: TransportSink) -> Result<(), TransportError> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(TransportError::AlreadyConnected);
        }

        let config = self.config.clone();
        let auth = Arc::clone(&self.auth);
        *worker = Some(tokio::spawn(run_push_channel(config, auth, sink)));
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

async fn run_push_channel(config: RealtimeConfig, auth: Arc<dyn AuthProvider>, sink: TransportSink) {
    loop {
        if sink.is_closed() {
            return;
        }
        sink.status(TransportStatus::Connecting);

        match config.push_endpoint(auth.user_id().as_deref()) {
            Ok(endpoint) => consume_stream(endpoint, &sink).await,
            Err(err) => sink.error(err),
        }

        reconnect_pause(config.push_reconnect_delay).await;
    }
}

async fn consume_stream(endpoint: Url, sink: &TransportSink) {
    let mut source = EventSource::get(endpoint);
    while let Some(item) = source.next().await {
        match item {
            Ok(Event::Open) => {
                debug!(target: "relay.client.push", "push stream opened");
            }
            Ok(Event::Message(message)) => handle_payload(sink, &message.data),
            Err(err) => {
                warn!(target: "relay.client.push", error = %err, "push stream failed");
                sink.error(err);
                break;
            }
        }
    }
    source.close();
}

fn handle_payload(sink: &TransportSink, data: &str) {
    match Frame::parse(data) {
        Ok(Frame::Connected { client_id, .. }) => {
            debug!(target: "relay.client.push", client_id = %client_id, "push channel registered");
            sink.status(TransportStatus::Connected);
        }
        Ok(Frame::Heartbeat { .. }) => sink.alive(),
        Ok(Frame::DataChange { event }) => sink.event(event),
        Err(err) => {
            warn!(target: "relay.client.push", error = %err, "ignoring malformed push frame");
        }
    }
}

async fn reconnect_pause(delay: Duration) {
    debug!(
        target: "relay.client.push",
        delay_ms = delay.as_millis() as u64,
        "reconnecting push channel"
    );
    tokio::time::sleep(delay).await;
}
