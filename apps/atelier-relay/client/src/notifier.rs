use std::{sync::Arc, time::Duration};

use atelier_relay_core::{BroadcastRequest, BroadcastResponse, DataType, ErrorBody};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{auth::AuthProvider, config::RealtimeConfig, transport::TransportError};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Endpoint(#[from] TransportError),
    #[error("broadcast request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay rejected broadcast ({status}): {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered {
        broadcast_count: usize,
        active_connections: usize,
    },
    /// The relay could not be reached or refused the request. The local
    /// mutation already succeeded, so this is only reported.
    BestEffort { error: String },
}

/// Tells the relay about a mutation this tab just made.
#[derive(Clone)]
pub struct ChangeNotifier {
    http: reqwest::Client,
    config: RealtimeConfig,
    auth: Arc<dyn AuthProvider>,
}

impl ChangeNotifier {
    pub fn new(config: RealtimeConfig, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            auth,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Publishes the change and swallows any failure into
    /// [`NotifyOutcome::BestEffort`].
    pub async fn notify(&self, data_type: DataType, data: Value) -> NotifyOutcome {
        match self.try_notify(data_type.clone(), data).await {
            Ok(response) => {
                debug!(
                    target: "relay.client.notifier",
                    data_type = %data_type,
                    broadcast_count = response.broadcast_count,
                    "change broadcast"
                );
                NotifyOutcome::Delivered {
                    broadcast_count: response.broadcast_count,
                    active_connections: response.active_connections,
                }
            }
            Err(err) => {
                warn!(
                    target: "relay.client.notifier",
                    data_type = %data_type,
                    error = %err,
                    "change broadcast failed"
                );
                NotifyOutcome::BestEffort {
                    error: err.to_string(),
                }
            }
        }
    }

    pub async fn try_notify(
        &self,
        data_type: DataType,
        data: Value,
    ) -> Result<BroadcastResponse, NotifyError> {
        let endpoint = self.config.realtime_endpoint()?;
        let request = BroadcastRequest::new(data_type, data, self.config.client_id.clone())
            .with_user(self.auth.user_id());

        let mut builder = self
            .http
            .post(endpoint)
            .timeout(self.timeout())
            .json(&request);
        if let Some(token) = self.auth.access_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<BroadcastResponse>().await?);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    fn timeout(&self) -> Duration {
        self.config.notify_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Anonymous;
    use serde_json::json;

    #[test_timeout::tokio_timeout_test(10)]
    async fn unreachable_relay_is_best_effort() {
        // Port 9 (discard) on localhost is not served in test environments.
        let config = RealtimeConfig::default()
            .with_relay_url("http://127.0.0.1:9")
            .with_notify_timeout(Duration::from_secs(2));
        let notifier = ChangeNotifier::new(config, Arc::new(Anonymous));

        match notifier.notify(DataType::Orders, json!({ "id": 1 })).await {
            NotifyOutcome::BestEffort { error } => assert!(!error.is_empty()),
            other => panic!("expected best-effort outcome, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn invalid_relay_url_is_reported() {
        let config = RealtimeConfig::default().with_relay_url("relay");
        let notifier = ChangeNotifier::new(config, Arc::new(Anonymous));
        assert!(matches!(
            notifier.try_notify(DataType::Orders, Value::Null).await,
            Err(NotifyError::Endpoint(TransportError::InvalidEndpoint(_)))
        ));
    }
}
