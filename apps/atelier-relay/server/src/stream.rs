use std::{
    pin::Pin,
    task::{Context, Poll},
};

use atelier_relay_core::Frame;
use futures_core::Stream;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::registry::{ChannelRegistry, DrainMarker};

/// Ordered frame stream for one push channel.
///
/// The stream owns the receiving half of the channel. When the HTTP layer
/// drops it (client went away, request cancelled) the channel is removed
/// from the registry and its heartbeat stops.
pub struct ChannelStream {
    receiver: mpsc::Receiver<Frame>,
    drain: DrainMarker,
    guard: ChannelGuard,
}

impl ChannelStream {
    pub(crate) fn new(
        receiver: mpsc::Receiver<Frame>,
        drain: DrainMarker,
        registry: ChannelRegistry,
        client_id: String,
        connection_id: Uuid,
    ) -> Self {
        Self {
            receiver,
            drain,
            guard: ChannelGuard {
                registry,
                client_id,
                connection_id,
            },
        }
    }

    pub fn client_id(&self) -> &str {
        &self.guard.client_id
    }
}

impl Stream for ChannelStream {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                this.drain.touch();
                Poll::Ready(Some(frame))
            }
            other => other,
        }
    }
}

struct ChannelGuard {
    registry: ChannelRegistry,
    client_id: String,
    connection_id: Uuid,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        let removed = self
            .registry
            .unregister_connection(&self.client_id, self.connection_id);
        debug!(
            target: "relay.stream",
            client_id = %self.client_id,
            connection_id = %self.connection_id,
            removed,
            "push stream dropped"
        );
    }
}
