use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::ChangeEvent;

/// Server-to-client push frame.
///
/// Every frame travels as one server-sent event whose `data:` line is the
/// JSON encoding of this enum, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// First frame on every channel; carries the id the server registered.
    #[serde(rename_all = "camelCase")]
    Connected {
        client_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Keeps proxies and load balancers from timing the stream out.
    Heartbeat { timestamp: DateTime<Utc> },
    /// A change published by some other client.
    DataChange { event: ChangeEvent },
}

impl Frame {
    pub fn connected(client_id: impl Into<String>) -> Self {
        Frame::Connected {
            client_id: client_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        Frame::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    pub fn data_change(event: ChangeEvent) -> Self {
        Frame::DataChange { event }
    }

    /// Wire discriminator, also used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Connected { .. } => "connected",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::DataChange { .. } => "dataChange",
        }
    }

    pub fn to_json(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Encode)
    }

    /// Parses the `data:` payload of one server-sent event.
    pub fn parse(data: &str) -> Result<Self, FrameError> {
        let trimmed = data.trim();
        if trimmed.is_empty() {
            return Err(FrameError::Empty);
        }
        serde_json::from_str(trimmed).map_err(FrameError::Decode)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame payload")]
    Empty,
    #[error("failed to encode frame: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode frame: {0}")]
    Decode(serde_json::Error),
}
