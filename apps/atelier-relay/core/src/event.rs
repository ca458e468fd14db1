use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Collections of the back office that emit change notifications.
///
/// Serialized as a plain lowercase string. Unknown names survive a round
/// trip through [`DataType::Other`] so newer producers do not break older
/// consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    Products,
    Orders,
    Customers,
    Categories,
    Boutiques,
    Other(String),
}

impl DataType {
    pub const KNOWN: [DataType; 5] = [
        DataType::Products,
        DataType::Orders,
        DataType::Customers,
        DataType::Categories,
        DataType::Boutiques,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            DataType::Products => "products",
            DataType::Orders => "orders",
            DataType::Customers => "customers",
            DataType::Categories => "categories",
            DataType::Boutiques => "boutiques",
            DataType::Other(name) => name.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, DataType::Other(_))
    }
}

impl From<&str> for DataType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "products" => DataType::Products,
            "orders" => DataType::Orders,
            "customers" => DataType::Customers,
            "categories" => DataType::Categories,
            "boutiques" => DataType::Boutiques,
            _ => DataType::Other(value.trim().to_string()),
        }
    }
}

impl From<String> for DataType {
    fn from(value: String) -> Self {
        DataType::from(value.as_str())
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        match value {
            DataType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical data-mutation notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Display identifier; never used for deduplication.
    pub id: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub source_client_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(data_type: DataType, data: Value, source_client_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data_type,
            data,
            user_id: None,
            source_client_id: source_client_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Returns true when the event was produced by `client_id`.
    pub fn originates_from(&self, client_id: &str) -> bool {
        self.source_client_id == client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_type_accepts_known_and_open_names() {
        let known: DataType = serde_json::from_value(json!("Orders")).unwrap();
        assert_eq!(known, DataType::Orders);

        let other: DataType = serde_json::from_value(json!("payments")).unwrap();
        assert_eq!(other, DataType::Other("payments".into()));
        assert_eq!(serde_json::to_value(&other).unwrap(), json!("payments"));
        assert!(!other.is_known());
    }

    #[test]
    fn change_event_uses_camel_case_wire_names() {
        let event = ChangeEvent::new(DataType::Products, json!({ "msg": "hi" }), "a1")
            .with_user(Some("u-7".into()));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "products");
        assert_eq!(value["data"]["msg"], "hi");
        assert_eq!(value["userId"], "u-7");
        assert_eq!(value["sourceClientId"], "a1");
        assert!(value["timestamp"].is_string());
        assert!(event.originates_from("a1"));
        assert!(!event.originates_from("b1"));
    }

    #[test]
    fn missing_user_is_omitted() {
        let event = ChangeEvent::new(DataType::Boutiques, Value::Null, "a1");
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("userId").is_none());
    }
}
