use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use atelier_relay_core::{ChangeEvent, DataType};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

use crate::transport::{Transport, TransportError, TransportKind, TransportSink, TransportStatus};

/// `sourceClientId` stamped on changes the poller synthesizes.
pub const POLLING_SOURCE: &str = "polling";

/// Query layer the poller reads current collection contents from.
#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch(&self, data_type: &DataType) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> DataFetcher for F
where
    F: Fn(DataType) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn fetch(&self, data_type: &DataType) -> anyhow::Result<Value> {
        (self)(data_type.clone()).await
    }
}

/// True when `current` differs from a previously seen payload. The first
/// observation only establishes the baseline.
pub fn detect_change(previous: Option<&Value>, current: &Value) -> bool {
    previous.is_some_and(|previous| previous != current)
}

pub struct PollingTransport {
    fetcher: Arc<dyn DataFetcher>,
    watched: Vec<DataType>,
    interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PollingTransport {
    pub fn new(fetcher: Arc<dyn DataFetcher>, watched: Vec<DataType>, interval: Duration) -> Self {
        Self {
            fetcher,
            watched,
            interval,
            worker: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn connect(&self, sink: TransportSink) -> Result<(), TransportError> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(TransportError::AlreadyConnected);
        }
        let poller = Poller {
            fetcher: Arc::clone(&self.fetcher),
            watched: self.watched.clone(),
            baseline: HashMap::new(),
        };
        *worker = Some(tokio::spawn(poller.run(self.interval, sink)));
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

struct Poller {
    fetcher: Arc<dyn DataFetcher>,
    watched: Vec<DataType>,
    baseline: HashMap<DataType, Value>,
}

impl Poller {
    async fn run(mut self, period: Duration, sink: TransportSink) {
        sink.status(TransportStatus::Connected);

        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if sink.is_closed() {
                return;
            }
            self.poll_once(&sink).await;
        }
    }

    async fn poll_once(&mut self, sink: &TransportSink) {
        for data_type in self.watched.clone() {
            match self.fetcher.fetch(&data_type).await {
                Ok(current) => {
                    if detect_change(self.baseline.get(&data_type), &current) {
                        debug!(target: "relay.client.polling", data_type = %data_type, "change detected");
                        sink.event(ChangeEvent::new(data_type.clone(), current.clone(), POLLING_SOURCE));
                    } else {
                        sink.alive();
                    }
                    self.baseline.insert(data_type, current);
                }
                Err(err) => {
                    warn!(
                        target: "relay.client.polling",
                        data_type = %data_type,
                        error = %err,
                        "poll fetch failed"
                    );
                    sink.fetch_failed(data_type, err);
                }
            }
        }
    }
}
