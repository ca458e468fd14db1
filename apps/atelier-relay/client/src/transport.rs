use std::fmt;

use async_trait::async_trait;
use atelier_relay_core::{ChangeEvent, DataType};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Subscription,
    PushChannel,
    Polling,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Subscription => "subscription",
            TransportKind::PushChannel => "push_channel",
            TransportKind::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Last reported condition of one transport.
#[derive(Debug, Clone)]
pub struct TransportState {
    pub kind: TransportKind,
    pub status: TransportStatus,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TransportState {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            status: TransportStatus::Disconnected,
            last_update: None,
            last_error: None,
        }
    }
}

/// What a running transport reports back to the client driver.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    Status {
        kind: TransportKind,
        status: TransportStatus,
        error: Option<String>,
    },
    /// Traffic that proves the link is up without carrying a change.
    Alive { kind: TransportKind },
    Event {
        kind: TransportKind,
        event: ChangeEvent,
    },
    /// A failure scoped to one data type; the transport stays up.
    FetchFailed {
        kind: TransportKind,
        data_type: DataType,
        error: String,
    },
}

/// Handle a transport uses to report status changes and events.
#[derive(Debug, Clone)]
pub struct TransportSink {
    kind: TransportKind,
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl TransportSink {
    pub fn new(kind: TransportKind, tx: mpsc::UnboundedSender<TransportSignal>) -> Self {
        Self { kind, tx }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// True once the driver stopped listening; workers use it to exit.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn status(&self, status: TransportStatus) {
        self.send(TransportSignal::Status {
            kind: self.kind,
            status,
            error: None,
        });
    }

    pub fn error(&self, error: impl fmt::Display) {
        self.send(TransportSignal::Status {
            kind: self.kind,
            status: TransportStatus::Error,
            error: Some(error.to_string()),
        });
    }

    pub fn alive(&self) {
        self.send(TransportSignal::Alive { kind: self.kind });
    }

    pub fn event(&self, event: ChangeEvent) {
        self.send(TransportSignal::Event {
            kind: self.kind,
            event,
        });
    }

    pub fn fetch_failed(&self, data_type: DataType, error: impl fmt::Display) {
        self.send(TransportSignal::FetchFailed {
            kind: self.kind,
            data_type,
            error: error.to_string(),
        });
    }

    fn send(&self, signal: TransportSignal) {
        let _ = self.tx.send(signal);
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already connected")]
    AlreadyConnected,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(err))
    }
}

/// One way of learning about remote changes.
///
/// `connect` starts a background worker and returns once it is running;
/// from then on everything is reported through the sink. Transports own
/// their reconnect policy and never surface errors to the consumer.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(&self, sink: TransportSink) -> Result<(), TransportError>;

    /// Stops the worker. Safe to call when not connected.
    async fn disconnect(&self);
}
