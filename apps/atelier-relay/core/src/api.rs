use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::event::{ChangeEvent, DataType};

/// Body of `POST /api/realtime`.
///
/// Every field is optional at the serde level so that a missing field is
/// reported as a validation error with a readable message instead of a
/// generic deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl BroadcastRequest {
    pub fn new(data_type: DataType, data: Value, client_id: impl Into<String>) -> Self {
        Self {
            data_type: Some(data_type.into()),
            data,
            user_id: None,
            client_id: Some(client_id.into()),
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Validates the request and builds the event that will be fanned out.
    pub fn into_event(self) -> Result<ChangeEvent, BroadcastRequestError> {
        let data_type = non_empty(self.data_type).ok_or(BroadcastRequestError::MissingType)?;
        let client_id = non_empty(self.client_id).ok_or(BroadcastRequestError::MissingClientId)?;
        Ok(ChangeEvent::new(DataType::from(data_type), self.data, client_id)
            .with_user(non_empty(self.user_id)))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BroadcastRequestError {
    #[error("missing required field `type`")]
    MissingType,
    #[error("missing required field `clientId`")]
    MissingClientId,
}

/// Successful reply to a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResponse {
    pub success: bool,
    pub broadcast_count: usize,
    pub active_connections: usize,
    pub change_event: ChangeEvent,
}

/// Error reply shared by every relay endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Diagnostics snapshot of the connection registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub active_connections: usize,
    pub connection_ids: Vec<String>,
}
