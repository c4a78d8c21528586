//! Wire format for notifications on the message bus.
//!
//! The bus payload is an event pointer, not a source of truth: any
//! divergence from the stored record resolves to the record. The
//! deserializer tolerates unknown fields and null primitives so that
//! producers can evolve independently.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notification::{Channel, Notification, NotificationKind, Priority};

/// Delivery attempt count header
pub const X_ATTEMPTS: &str = "x-attempts";
/// First enqueue timestamp header (RFC 3339)
pub const X_FIRST_ENQUEUED_AT: &str = "x-first-enqueued-at";
/// Correlation id header, propagated from the ingress request
pub const X_CORRELATION_ID: &str = "x-correlation-id";

/// JSON body published to the main exchange and the channel queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub id: Uuid,

    pub user_id: Uuid,

    #[serde(rename = "type")]
    pub kind: NotificationKind,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub content: Option<String>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub channels: Vec<Channel>,

    #[serde(default)]
    pub template_id: Option<String>,

    #[serde(default)]
    pub locale: Option<String>,

    /// Structured metadata object
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Flat metadata map; wins over `metadata` on key collision
    #[serde(default)]
    pub metadata_map: HashMap<String, String>,

    #[serde(default)]
    pub variables: serde_json::Value,
}

impl NotificationMessage {
    /// Single normalized metadata view. Structured `metadata` entries
    /// are taken first, then `metadataMap` overlays them (map wins).
    pub fn merged_metadata(&self) -> HashMap<String, String> {
        let mut merged = HashMap::new();

        if let Some(obj) = self.metadata.as_object() {
            for (key, value) in obj {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => continue,
                    other => other.to_string(),
                };
                merged.insert(key.clone(), text);
            }
        }

        for (key, value) in &self.metadata_map {
            merged.insert(key.clone(), value.clone());
        }

        merged
    }

    /// Recipient email as carried by the message metadata.
    pub fn user_email(&self) -> Option<String> {
        let merged = self.merged_metadata();
        merged.get("userEmail").filter(|s| !s.is_empty()).cloned()
    }

    /// Whether the message asks for email delivery. An empty channel
    /// set means the channels are derived from preferences, which may
    /// include email.
    pub fn implies_email(&self) -> bool {
        self.channels.is_empty() || self.channels.contains(&Channel::Email)
    }
}

impl From<&Notification> for NotificationMessage {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id,
            user_id: n.user_id,
            kind: n.kind,
            title: Some(n.title.clone()),
            content: Some(n.content.clone()),
            priority: n.priority,
            channels: n.channels.0.clone(),
            template_id: n.template_id.clone(),
            locale: n.locale.clone(),
            metadata: n.metadata.clone(),
            metadata_map: HashMap::new(),
            variables: n.variables.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_json() -> serde_json::Value {
        serde_json::json!({
            "id": "7f8c8ff2-6b3e-4fd5-a6f9-2b4f3a1d9c01",
            "userId": "0a0f5c3e-1111-4222-8333-444455556666",
            "type": "PASSWORD_RESET"
        })
    }

    #[test]
    fn test_tolerates_unknown_fields_and_nulls() {
        let mut json = base_json();
        json["futureField"] = serde_json::json!({"nested": true});
        json["title"] = serde_json::Value::Null;
        json["metadata"] = serde_json::Value::Null;

        let msg: NotificationMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.kind, NotificationKind::PasswordReset);
        assert!(msg.title.is_none());
        assert_eq!(msg.priority, Priority::Normal);
        assert!(msg.channels.is_empty());
    }

    #[test]
    fn test_metadata_map_wins_on_collision() {
        let mut json = base_json();
        json["metadata"] = serde_json::json!({"userEmail": "struct@x.com", "tenant": "alpha"});
        json["metadataMap"] = serde_json::json!({"userEmail": "map@x.com"});

        let msg: NotificationMessage = serde_json::from_value(json).unwrap();
        let merged = msg.merged_metadata();
        assert_eq!(merged.get("userEmail").unwrap(), "map@x.com");
        assert_eq!(merged.get("tenant").unwrap(), "alpha");
        assert_eq!(msg.user_email(), Some("map@x.com".to_string()));
    }

    #[test]
    fn test_missing_email_yields_none() {
        let mut json = base_json();
        json["metadata"] = serde_json::json!({"other": "value"});
        let msg: NotificationMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.user_email(), None);

        // Empty string counts as absent
        let mut json = base_json();
        json["metadataMap"] = serde_json::json!({"userEmail": ""});
        let msg: NotificationMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.user_email(), None);
    }

    #[test]
    fn test_non_string_metadata_values_are_stringified() {
        let mut json = base_json();
        json["metadata"] = serde_json::json!({"retries": 3, "flag": true});
        let msg: NotificationMessage = serde_json::from_value(json).unwrap();
        let merged = msg.merged_metadata();
        assert_eq!(merged.get("retries").unwrap(), "3");
        assert_eq!(merged.get("flag").unwrap(), "true");
    }

    #[test]
    fn test_implies_email() {
        let mut json = base_json();
        json["channels"] = serde_json::json!(["SMS"]);
        let msg: NotificationMessage = serde_json::from_value(json).unwrap();
        assert!(!msg.implies_email());

        let mut json = base_json();
        json["channels"] = serde_json::json!(["EMAIL", "IN_APP"]);
        let msg: NotificationMessage = serde_json::from_value(json).unwrap();
        assert!(msg.implies_email());

        // empty channel set defers to preferences, so email stays possible
        let msg: NotificationMessage = serde_json::from_value(base_json()).unwrap();
        assert!(msg.implies_email());
    }

    #[test]
    fn test_camel_case_wire_names() {
        let msg: NotificationMessage = serde_json::from_value(base_json()).unwrap();
        let out = serde_json::to_value(&msg).unwrap();
        assert!(out.get("userId").is_some());
        assert!(out.get("type").is_some());
        assert!(out.get("metadataMap").is_some());
        assert!(out.get("user_id").is_none());
    }
}
