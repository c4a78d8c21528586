//! Delivery transports.
//!
//! A transport hands a rendered notification to an external system
//! (SMTP relay, push gateway, SMS gateway) and classifies the outcome:
//! delivered, worth retrying, or permanently failed. Credentials and
//! wire details stay inside the transport; the workers only see the
//! classification.

pub mod email;
pub mod gateway;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::notification::{Channel, NotificationKind, Priority};

pub use email::SmtpEmailTransport;
pub use gateway::{HttpGatewayTransport, InAppTransport};

/// Rendered notification handed to a transport.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryPayload {
    pub notification_id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub priority: Priority,

    /// Channel-specific address: email address, device token, phone
    /// number. In-app delivery has none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    pub body: String,

    /// Whether `body` is HTML (email only)
    #[serde(default)]
    pub html: bool,
}

/// Classified result of a transport handoff
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// Accepted by the external system
    Delivered,

    /// Worth retrying: network failure, 5xx, throttling, timeout
    Transient(String),

    /// Never retry: bad address, authentication denied, rejected
    Permanent(String),
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, payload: &DeliveryPayload) -> SendOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serializes_without_empty_fields() {
        let payload = DeliveryPayload {
            notification_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind: NotificationKind::SystemAlert,
            priority: Priority::Normal,
            recipient: None,
            subject: None,
            body: "hello".to_string(),
            html: false,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("recipient").is_none());
        assert!(json.get("subject").is_none());
        assert_eq!(json["body"], "hello");
    }
}
