//! Browser-tab side of the Atelier realtime relay.
//!
//! A [`RealtimeClient`] runs up to three transports side by side (GraphQL
//! subscription, the relay's push channel, and polling), forwards changes
//! only from the best one currently connected, and drops changes this tab
//! published itself. [`ChangeNotifier`] publishes local mutations to the
//! relay.

pub mod auth;
pub mod client;
pub mod config;
pub mod filter;
pub mod notifier;
pub mod polling;
pub mod push_channel;
pub mod selector;
pub mod subscription;
pub mod transport;

pub use auth::{Anonymous, AuthProvider, StaticAuth};
pub use client::{RealtimeClient, RealtimeHandle, RealtimeStatus};
pub use config::RealtimeConfig;
pub use filter::{SelfOriginFilter, StalenessTracker, TypeFreshness};
pub use notifier::{ChangeNotifier, NotifyError, NotifyOutcome};
pub use polling::{DataFetcher, PollingTransport, POLLING_SOURCE};
pub use push_channel::PushChannelTransport;
pub use selector::{select_method, CurrentMethod, MethodChange, TransportSelector};
pub use subscription::SubscriptionTransport;
pub use transport::{
    Transport, TransportError, TransportKind, TransportSignal, TransportSink, TransportState,
    TransportStatus,
};
