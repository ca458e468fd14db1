use std::time::Duration;

use atelier_relay_core::{generate_client_id, DataType, REALTIME_PATH};
use url::Url;

use crate::transport::TransportError;

const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8787";

/// Client-side knobs for [`RealtimeClient`](crate::RealtimeClient).
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Base URL of the relay server, e.g. `https://admin.example.com`. A
    /// path prefix such as `https://host/admin` is kept in front of the
    /// relay's routes.
    pub relay_url: String,
    /// `ws://` or `wss://` GraphQL endpoint; the subscription transport is
    /// skipped when unset.
    pub graphql_ws_url: Option<String>,
    /// Identifies this tab; changes it publishes are never echoed back.
    pub client_id: String,
    pub watched: Vec<DataType>,
    pub poll_interval: Duration,
    pub push_reconnect_delay: Duration,
    pub subscription_reconnect_delay: Duration,
    pub enable_subscription: bool,
    pub enable_push_channel: bool,
    pub enable_polling: bool,
    /// Only accept events attributed to the signed-in user.
    pub scope_to_user: bool,
    /// Field of a mutated record naming the user that owns it.
    pub owner_field: String,
    pub notify_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            graphql_ws_url: None,
            client_id: generate_client_id(),
            watched: DataType::KNOWN.to_vec(),
            poll_interval: Duration::from_secs(30),
            push_reconnect_delay: Duration::from_secs(3),
            subscription_reconnect_delay: Duration::from_secs(5),
            enable_subscription: true,
            enable_push_channel: true,
            enable_polling: true,
            scope_to_user: false,
            owner_field: "user_created".to_string(),
            notify_timeout: Duration::from_secs(5),
        }
    }
}

impl RealtimeConfig {
    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn with_graphql_ws_url(mut self, url: impl Into<String>) -> Self {
        self.graphql_ws_url = Some(url.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_watched(mut self, watched: impl IntoIterator<Item = DataType>) -> Self {
        self.watched = watched.into_iter().collect();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_push_reconnect_delay(mut self, delay: Duration) -> Self {
        self.push_reconnect_delay = delay;
        self
    }

    pub fn with_subscription_reconnect_delay(mut self, delay: Duration) -> Self {
        self.subscription_reconnect_delay = delay;
        self
    }

    /// Enables or disables the subscription, push-channel and polling
    /// transports, in that order.
    pub fn with_transports(mut self, subscription: bool, push_channel: bool, polling: bool) -> Self {
        self.enable_subscription = subscription;
        self.enable_push_channel = push_channel;
        self.enable_polling = polling;
        self
    }

    pub fn with_user_scope(mut self, enabled: bool) -> Self {
        self.scope_to_user = enabled;
        self
    }

    pub fn with_owner_field(mut self, field: impl Into<String>) -> Self {
        self.owner_field = field.into();
        self
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    /// `{relay_url}/api/realtime`, without query parameters or fragment.
    pub fn realtime_endpoint(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.relay_url)
            .map_err(|err| TransportError::InvalidEndpoint(format!("{}: {err}", self.relay_url)))?;
        if url.cannot_be_a_base() {
            return Err(TransportError::InvalidEndpoint(self.relay_url.clone()));
        }
        let path = format!("{}{REALTIME_PATH}", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    /// Push-channel URL carrying this tab's id and, when known, the user id.
    pub fn push_endpoint(&self, user_id: Option<&str>) -> Result<Url, TransportError> {
        let mut url = self.realtime_endpoint()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("clientId", &self.client_id);
            if let Some(user_id) = user_id {
                query.append_pair("userId", user_id);
            }
        }
        Ok(url)
    }

    pub fn graphql_endpoint(&self) -> Result<Option<Url>, TransportError> {
        self.graphql_ws_url
            .as_deref()
            .map(|raw| {
                let url = Url::parse(raw)
                    .map_err(|err| TransportError::InvalidEndpoint(format!("{raw}: {err}")))?;
                match url.scheme() {
                    "ws" | "wss" => Ok(url),
                    other => Err(TransportError::InvalidEndpoint(format!(
                        "unsupported GraphQL websocket scheme `{other}`"
                    ))),
                }
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_endpoint_adds_ids_and_drops_base_query() {
        let config = RealtimeConfig::default()
            .with_relay_url("https://admin.example.com/?tab=1")
            .with_client_id("tab 7");
        let url = config.push_endpoint(Some("u-1")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://admin.example.com/api/realtime?clientId=tab+7&userId=u-1"
        );
        assert_eq!(
            config.realtime_endpoint().unwrap().as_str(),
            "https://admin.example.com/api/realtime"
        );
    }

    #[test]
    fn realtime_endpoint_keeps_path_prefix() {
        for base in ["https://host/admin", "https://host/admin/", "https://host/admin#top"] {
            let config = RealtimeConfig::default().with_relay_url(base);
            assert_eq!(
                config.realtime_endpoint().unwrap().as_str(),
                "https://host/admin/api/realtime",
                "base {base}"
            );
        }
        let config = RealtimeConfig::default().with_relay_url("http://127.0.0.1:8787");
        assert_eq!(
            config.realtime_endpoint().unwrap().as_str(),
            "http://127.0.0.1:8787/api/realtime"
        );
    }

    #[test]
    fn invalid_endpoints_are_reported() {
        let config = RealtimeConfig::default().with_relay_url("not a url");
        assert!(matches!(
            config.realtime_endpoint(),
            Err(TransportError::InvalidEndpoint(_))
        ));

        let config = RealtimeConfig::default().with_graphql_ws_url("http://cms.local/graphql");
        assert!(config.graphql_endpoint().is_err());
        assert!(RealtimeConfig::default().graphql_endpoint().unwrap().is_none());
    }
}
