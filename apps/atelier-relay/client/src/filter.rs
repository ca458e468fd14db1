use std::{collections::HashMap, time::Duration};

use atelier_relay_core::{ChangeEvent, DataType};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Drops events this tab produced itself, and optionally events that do
/// not belong to the signed-in user.
#[derive(Debug, Clone)]
pub struct SelfOriginFilter {
    client_id: String,
    user_scope: Option<String>,
}

impl SelfOriginFilter {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            user_scope: None,
        }
    }

    pub fn with_user_scope(mut self, user_id: Option<String>) -> Self {
        self.user_scope = user_id;
        self
    }

    pub fn should_accept(&self, event: &ChangeEvent) -> bool {
        if event.originates_from(&self.client_id) {
            return false;
        }
        match &self.user_scope {
            Some(user) => event.user_id.as_deref() == Some(user.as_str()),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeFreshness {
    pub last_update: Option<DateTime<Utc>>,
    pub last_value: Option<Value>,
    /// Only ever grows; diagnostics.
    pub error_count: u64,
}

/// Per data type: when it last changed, what it changed to and how often
/// fetching it failed.
#[derive(Debug, Clone, Default)]
pub struct StalenessTracker {
    entries: HashMap<DataType, TypeFreshness>,
}

impl StalenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_update(&mut self, event: &ChangeEvent) {
        let entry = self.entries.entry(event.data_type.clone()).or_default();
        entry.last_update = Some(event.timestamp);
        entry.last_value = Some(event.data.clone());
    }

    pub fn record_error(&mut self, data_type: &DataType) {
        self.entries
            .entry(data_type.clone())
            .or_default()
            .error_count += 1;
    }

    /// A transport-wide failure counts against every watched type.
    pub fn record_transport_error<'a>(&mut self, watched: impl IntoIterator<Item = &'a DataType>) {
        for data_type in watched {
            self.record_error(data_type);
        }
    }

    pub fn get(&self, data_type: &DataType) -> Option<&TypeFreshness> {
        self.entries.get(data_type)
    }

    pub fn last_update(&self, data_type: &DataType) -> Option<DateTime<Utc>> {
        self.get(data_type).and_then(|entry| entry.last_update)
    }

    /// True when `data_type` never updated or last updated more than
    /// `max_age` before `now`.
    pub fn is_stale(&self, data_type: &DataType, max_age: Duration, now: DateTime<Utc>) -> bool {
        match self.last_update(data_type) {
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map(|age| age > max_age)
                .unwrap_or(false),
            None => true,
        }
    }

    pub fn snapshot(&self) -> HashMap<DataType, TypeFreshness> {
        self.entries.clone()
    }
}
