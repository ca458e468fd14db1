//! Shared primitives for the Atelier realtime relay.
//!
//! The server (`atelier-relay-server`) and the client library
//! (`atelier-relay-client`) both speak in terms of these types, so the
//! push-channel framing and the broadcast request/response bodies never
//! drift between the two sides.

pub mod api;
pub mod event;
pub mod frame;

pub use api::{
    BroadcastRequest, BroadcastRequestError, BroadcastResponse, ConnectionInfo, ErrorBody,
};
pub use event::{ChangeEvent, DataType};
pub use frame::{Frame, FrameError};

/// Path of the push subscription / broadcast endpoint.
pub const REALTIME_PATH: &str = "/api/realtime";

/// Path of the diagnostics endpoint.
pub const CONNECTIONS_PATH: &str = "/api/realtime/connections";

/// Generates a client identifier for callers that did not supply one.
pub fn generate_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
