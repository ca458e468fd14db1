//! GraphQL subscriptions over WebSocket (`graphql-transport-ws`).
//!
//! One `subscribe` operation is opened per watched collection, using the
//! collection name as the operation id. Every `next` payload for
//! `<collection>_mutated` becomes a [`ChangeEvent`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use atelier_relay_core::{ChangeEvent, DataType};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{sync::watch, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        Error as WsError, Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    auth::AuthProvider,
    config::RealtimeConfig,
    transport::{Transport, TransportError, TransportKind, TransportSink, TransportStatus},
};

pub const GRAPHQL_TRANSPORT_WS: &str = "graphql-transport-ws";

/// `sourceClientId` of events that arrive through the subscription.
pub const SUBSCRIPTION_SOURCE: &str = "subscription";

const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GqlMessage {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    Next {
        id: String,
        payload: Value,
    },
    Error {
        id: String,
        #[serde(default)]
        payload: Value,
    },
    Complete {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub query: String,
}

pub fn subscription_query(data_type: &DataType, owner_field: &str) -> String {
    format!("subscription {{ {data_type}_mutated {{ key event data {{ id {owner_field} }} }} }}")
}

/// Maps a `next` payload to a change event. Returns `None` for payloads
/// without mutation data.
pub fn event_from_next(id: &str, payload: &Value, owner_field: &str) -> Option<ChangeEvent> {
    let data_type = DataType::from(id);
    let field = format!("{data_type}_mutated");
    let mutation = payload.get("data")?.get(field.as_str())?;
    if mutation.is_null() {
        return None;
    }
    let user_id = mutation
        .get("data")
        .and_then(|record| record.get(owner_field))
        .and_then(owner_id);
    Some(ChangeEvent::new(data_type, mutation.clone(), SUBSCRIPTION_SOURCE).with_user(user_id))
}

fn owner_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        Value::Object(record) => record.get("id").and_then(owner_id),
        _ => None,
    }
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

pub struct SubscriptionTransport {
    endpoint: Url,
    config: RealtimeConfig,
    auth: Arc<dyn AuthProvider>,
    worker: Mutex<Option<Worker>>,
}

impl SubscriptionTransport {
    pub fn new(config: RealtimeConfig, auth: Arc<dyn AuthProvider>) -> Result<Self, TransportError> {
        let endpoint = config.graphql_endpoint()?.ok_or_else(|| {
            TransportError::InvalidEndpoint("GraphQL websocket URL is not configured".into())
        })?;
        Ok(Self {
            endpoint,
            config,
            auth,
            worker: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Transport for SubscriptionTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Subscription
    }

    async fn connect(&self, sink: TransportSink) -> Result<(), TransportError> {
        let mut worker = self.worker.lock();
        if worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
        {
            return Err(TransportError::AlreadyConnected);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let session = Session {
            endpoint: self.endpoint.clone(),
            config: self.config.clone(),
            auth: Arc::clone(&self.auth),
            sink,
            shutdown: shutdown_rx,
        };
        *worker = Some(Worker {
            handle: tokio::spawn(session.run()),
            shutdown,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        let worker = self.worker.lock().take();
        let Some(Worker { handle, shutdown }) = worker else {
            return;
        };
        let _ = shutdown.send(true);
        let abort = handle.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            abort.abort();
        }
    }
}

struct Session {
    endpoint: Url,
    config: RealtimeConfig,
    auth: Arc<dyn AuthProvider>,
    sink: TransportSink,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    async fn run(mut self) {
        loop {
            if self.stopping() {
                return;
            }
            self.sink.status(TransportStatus::Connecting);

            match self.session().await {
                Ok(()) => {
                    info!(target: "relay.client.subscription", "subscription socket closed");
                    self.sink.status(TransportStatus::Disconnected);
                }
                Err(err) => {
                    warn!(target: "relay.client.subscription", error = %err, "subscription failed");
                    self.sink.error(err);
                }
            }

            if self.stopping() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.subscription_reconnect_delay) => {}
                _ = self.shutdown.changed() => return,
            }
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.sink.is_closed()
    }

    async fn session(&mut self) -> Result<(), TransportError> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(GRAPHQL_TRANSPORT_WS),
        );
        let (socket, _) = connect_async(request).await?;
        let (mut write, mut read) = socket.split();

        let init = GqlMessage::ConnectionInit {
            payload: self
                .auth
                .access_token()
                .map(|token| json!({ "access_token": token })),
        };
        send_message(&mut write, &init).await?;
        tokio::time::timeout(ACK_TIMEOUT, await_ack(&mut read, &mut write))
            .await
            .map_err(|_| TransportError::Protocol("timed out waiting for connection_ack".into()))??;
        self.sink.status(TransportStatus::Connected);

        for data_type in &self.config.watched {
            let subscribe = GqlMessage::Subscribe {
                id: data_type.to_string(),
                payload: SubscribePayload {
                    query: subscription_query(data_type, &self.config.owner_field),
                },
            };
            send_message(&mut write, &subscribe).await?;
        }

        loop {
            let message = tokio::select! {
                _ = self.shutdown.changed() => {
                    for data_type in &self.config.watched {
                        let complete = GqlMessage::Complete { id: data_type.to_string() };
                        send_message(&mut write, &complete).await?;
                    }
                    let _ = write.close().await;
                    return Ok(());
                }
                message = read.next() => message,
            };
            let Some(message) = message else {
                return Ok(());
            };

            let text = match message? {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    debug!(
                        target: "relay.client.subscription",
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "server closed subscription socket"
                    );
                    return Ok(());
                }
                _ => continue,
            };

            match serde_json::from_str::<GqlMessage>(&text) {
                Ok(GqlMessage::Next { id, payload }) => {
                    match event_from_next(&id, &payload, &self.config.owner_field) {
                        Some(event) => self.sink.event(event),
                        None => self.sink.alive(),
                    }
                }
                Ok(GqlMessage::Ping { payload }) => {
                    send_message(&mut write, &GqlMessage::Pong { payload }).await?;
                    self.sink.alive();
                }
                Ok(GqlMessage::Pong { .. }) => self.sink.alive(),
                Ok(GqlMessage::Error { id, payload }) => {
                    warn!(target: "relay.client.subscription", id = %id, error = %payload, "subscription operation failed");
                    self.sink.fetch_failed(DataType::from(id.as_str()), payload);
                }
                Ok(GqlMessage::Complete { id }) => {
                    debug!(target: "relay.client.subscription", id = %id, "server completed operation");
                }
                Ok(other) => {
                    debug!(target: "relay.client.subscription", message = ?other, "ignoring unexpected message");
                }
                Err(err) => {
                    warn!(target: "relay.client.subscription", error = %err, "ignoring malformed message");
                }
            }
        }
    }
}

async fn send_message<W>(write: &mut W, message: &GqlMessage) -> Result<(), TransportError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let text =
        serde_json::to_string(message).map_err(|err| TransportError::Protocol(err.to_string()))?;
    write.send(Message::Text(text)).await?;
    Ok(())
}

async fn await_ack<R, W>(read: &mut R, write: &mut W) -> Result<(), TransportError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let Some(message) = read.next().await else {
            return Err(TransportError::Protocol(
                "socket closed before connection_ack".into(),
            ));
        };
        match message? {
            Message::Text(text) => match serde_json::from_str::<GqlMessage>(&text) {
                Ok(GqlMessage::ConnectionAck { .. }) => return Ok(()),
                Ok(GqlMessage::Ping { payload }) => {
                    send_message(write, &GqlMessage::Pong { payload }).await?;
                }
                Ok(other) => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected message before connection_ack: {other:?}"
                    )));
                }
                Err(err) => return Err(TransportError::Protocol(err.to_string())),
            },
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(TransportError::Protocol(format!(
                    "connection rejected: {reason}"
                )));
            }
            _ => continue,
        }
    }
}
