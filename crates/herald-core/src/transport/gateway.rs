//! HTTP gateway transports for push and SMS, plus the in-app
//! transport whose "delivery" is the stored unread row itself.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::notification::Channel;
use crate::transport::{DeliveryPayload, SendOutcome, Transport};
use crate::{Error, Result};

/// Push/SMS delivery through an HTTP gateway. The payload is a JSON
/// structure; credentials are opaque to the core.
pub struct HttpGatewayTransport {
    client: reqwest::Client,
    channel: Channel,
    url: Option<String>,
    api_key: Option<String>,
}

impl HttpGatewayTransport {
    pub fn push(config: &GatewayConfig) -> Result<Self> {
        Self::new(config, Channel::Push, config.push_url.clone(), config.push_api_key.clone())
    }

    pub fn sms(config: &GatewayConfig) -> Result<Self> {
        Self::new(config, Channel::Sms, config.sms_url.clone(), config.sms_api_key.clone())
    }

    fn new(
        config: &GatewayConfig,
        channel: Channel,
        url: Option<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Gateway client: {}", e)))?;

        Ok(Self {
            client,
            channel,
            url,
            api_key,
        })
    }

    fn classify(status: StatusCode) -> SendOutcome {
        if status.is_success() {
            SendOutcome::Delivered
        } else if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            SendOutcome::Transient(format!("gateway returned {}", status))
        } else {
            SendOutcome::Permanent(format!("gateway returned {}", status))
        }
    }
}

#[async_trait]
impl Transport for HttpGatewayTransport {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, payload: &DeliveryPayload) -> SendOutcome {
        let Some(url) = self.url.as_deref() else {
            return SendOutcome::Permanent(format!(
                "no {} gateway configured",
                self.channel
            ));
        };

        let mut request = self.client.post(url).json(payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        match request.send().await {
            Ok(response) => {
                let outcome = Self::classify(response.status());
                debug!(
                    id = %payload.notification_id,
                    channel = %self.channel,
                    status = %response.status(),
                    "Gateway handoff"
                );
                outcome
            }
            Err(e) => {
                // Connect errors and client timeouts retry
                warn!(
                    id = %payload.notification_id,
                    channel = %self.channel,
                    error = %e,
                    "Gateway unreachable"
                );
                SendOutcome::Transient(e.to_string())
            }
        }
    }
}

/// In-app transport. The unread row persisted in the store is the
/// delivery; fan-out to connected presence channels is out of scope.
pub struct InAppTransport;

#[async_trait]
impl Transport for InAppTransport {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, payload: &DeliveryPayload) -> SendOutcome {
        debug!(id = %payload.notification_id, "In-app notification stored");
        SendOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(HttpGatewayTransport::classify(StatusCode::OK).is_delivered());
        assert!(matches!(
            HttpGatewayTransport::classify(StatusCode::BAD_GATEWAY),
            SendOutcome::Transient(_)
        ));
        assert!(matches!(
            HttpGatewayTransport::classify(StatusCode::TOO_MANY_REQUESTS),
            SendOutcome::Transient(_)
        ));
        assert!(matches!(
            HttpGatewayTransport::classify(StatusCode::BAD_REQUEST),
            SendOutcome::Permanent(_)
        ));
        assert!(matches!(
            HttpGatewayTransport::classify(StatusCode::UNAUTHORIZED),
            SendOutcome::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_gateway_is_permanent() {
        let transport = HttpGatewayTransport::push(&GatewayConfig::default()).unwrap();
        let payload = DeliveryPayload {
            notification_id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            kind: crate::notification::NotificationKind::SystemAlert,
            priority: crate::notification::Priority::Normal,
            recipient: None,
            subject: None,
            body: "b".to_string(),
            html: false,
        };
        assert!(matches!(
            transport.send(&payload).await,
            SendOutcome::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn test_in_app_always_delivers() {
        let transport = InAppTransport;
        let payload = DeliveryPayload {
            notification_id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            kind: crate::notification::NotificationKind::AchievementUnlocked,
            priority: crate::notification::Priority::Low,
            recipient: None,
            subject: None,
            body: "unlocked".to_string(),
            html: false,
        };
        assert!(transport.send(&payload).await.is_delivered());
    }
}
