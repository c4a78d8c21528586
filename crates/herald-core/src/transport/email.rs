//! SMTP email transport (lettre).

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, warn};

use crate::config::SmtpConfig;
use crate::notification::Channel;
use crate::transport::{DeliveryPayload, SendOutcome, Transport};
use crate::{Error, Result};

/// Email transport over an SMTP relay.
pub struct SmtpEmailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| Error::Config(format!("Invalid SMTP relay: {}", e)))?
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let from = config
            .from
            .parse()
            .map_err(|e| Error::Config(format!("Invalid SMTP from address: {}", e)))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Transport for SmtpEmailTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, payload: &DeliveryPayload) -> SendOutcome {
        // Subject rendering is mandatory for email
        let Some(subject) = payload.subject.as_deref() else {
            return SendOutcome::Permanent("email without subject".to_string());
        };

        let Some(recipient) = payload.recipient.as_deref() else {
            return SendOutcome::Permanent("email without recipient".to_string());
        };

        let to: Mailbox = match recipient.parse() {
            Ok(to) => to,
            Err(e) => {
                return SendOutcome::Permanent(format!("invalid recipient address: {}", e));
            }
        };

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject);

        let message = if payload.html {
            builder
                .header(ContentType::TEXT_HTML)
                .body(payload.body.clone())
        } else {
            builder
                .header(ContentType::TEXT_PLAIN)
                .body(payload.body.clone())
        };

        let message = match message {
            Ok(message) => message,
            Err(e) => return SendOutcome::Permanent(format!("message build failed: {}", e)),
        };

        match self.transport.send(message).await {
            Ok(_) => {
                debug!(id = %payload.notification_id, "Email accepted by relay");
                SendOutcome::Delivered
            }
            Err(e) if e.is_permanent() => {
                warn!(id = %payload.notification_id, error = %e, "SMTP permanent failure");
                SendOutcome::Permanent(e.to_string())
            }
            Err(e) => {
                // Transient SMTP codes, connection failures, timeouts
                warn!(id = %payload.notification_id, error = %e, "SMTP transient failure");
                SendOutcome::Transient(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{NotificationKind, Priority};
    use uuid::Uuid;

    fn payload(subject: Option<&str>, recipient: Option<&str>) -> DeliveryPayload {
        DeliveryPayload {
            notification_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind: NotificationKind::PasswordReset,
            priority: Priority::Normal,
            recipient: recipient.map(str::to_string),
            subject: subject.map(str::to_string),
            body: "body".to_string(),
            html: false,
        }
    }

    #[tokio::test]
    async fn test_missing_subject_is_permanent() {
        let transport = SmtpEmailTransport::new(&SmtpConfig::default()).unwrap();
        let outcome = transport.send(&payload(None, Some("a@x.com"))).await;
        assert!(matches!(outcome, SendOutcome::Permanent(_)));
    }

    #[tokio::test]
    async fn test_missing_recipient_is_permanent() {
        let transport = SmtpEmailTransport::new(&SmtpConfig::default()).unwrap();
        let outcome = transport.send(&payload(Some("s"), None)).await;
        assert!(matches!(outcome, SendOutcome::Permanent(_)));
    }

    #[tokio::test]
    async fn test_invalid_address_is_permanent() {
        let transport = SmtpEmailTransport::new(&SmtpConfig::default()).unwrap();
        let outcome = transport.send(&payload(Some("s"), Some("not-an-address"))).await;
        assert!(matches!(outcome, SendOutcome::Permanent(_)));
    }

    #[test]
    fn test_invalid_from_rejected_at_construction() {
        let config = SmtpConfig {
            from: "not an address".to_string(),
            ..Default::default()
        };
        assert!(SmtpEmailTransport::new(&config).is_err());
    }
}
