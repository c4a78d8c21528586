//! Message bus topology and publishing.
//!
//! Exchanges and queues are declared idempotently at boot. Every work
//! queue dead-letters into the DLX with a queue-specific routing key
//! and carries a bounded message TTL; the priority queue additionally
//! supports broker-side priorities.

pub mod dispatcher;

use lapin::options::{
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel as AmqpChannel, Connection, ConnectionProperties, ExchangeKind};
use tracing::info;

use crate::config::BrokerConfig;
use crate::notification::{Channel, NotificationMessage, Priority};
use crate::notification::{X_ATTEMPTS, X_CORRELATION_ID, X_FIRST_ENQUEUED_AT};
use crate::Result;

pub use dispatcher::Dispatcher;

/// Routing key for default ingress
pub const RK_CREATED: &str = "notification.created";
/// Catch-all dead letter routing key
pub const RK_FAILED: &str = "notification.failed";

/// Connection to the message bus plus the topology it owns.
pub struct Broker {
    connection: Connection,
    config: BrokerConfig,
}

impl Broker {
    /// Connect to the broker. Failure here is fatal at boot.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let connection = Connection::connect(
            &config.url,
            ConnectionProperties::default().with_connection_name("herald".into()),
        )
        .await?;

        info!(url = %config.url, "Connected to message broker");

        Ok(Self { connection, config })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Whether the underlying connection is usable; feeds readiness.
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn create_channel(&self) -> Result<AmqpChannel> {
        Ok(self.connection.create_channel().await?)
    }

    /// Channel with a bounded prefetch for consumers.
    pub async fn create_consumer_channel(&self) -> Result<AmqpChannel> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;
        Ok(channel)
    }

    /// Declare exchanges, queues, and bindings. Safe to run on every
    /// boot; declarations are idempotent.
    pub async fn declare_topology(&self) -> Result<()> {
        let channel = self.connection.create_channel().await?;
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };

        channel
            .exchange_declare(
                self.config.exchange_main.as_str(),
                ExchangeKind::Topic,
                durable,
                FieldTable::default(),
            )
            .await?;

        channel
            .exchange_declare(
                self.config.exchange_dlx.as_str(),
                ExchangeKind::Topic,
                durable,
                FieldTable::default(),
            )
            .await?;

        // Work queues on the main exchange
        self.declare_work_queue(&channel, &self.config.queue_main, RK_CREATED, RK_FAILED, false)
            .await?;
        self.declare_work_queue(
            &channel,
            &self.config.queue_priority,
            "notification.priority.*",
            "notification.priority.failed",
            true,
        )
        .await?;

        for domain_channel in Channel::ALL {
            let queue = self.channel_queue(domain_channel);
            self.declare_work_queue(
                &channel,
                queue,
                &format!("notification.{}.*", channel_segment(domain_channel)),
                &channel_failed_key(domain_channel),
                false,
            )
            .await?;
        }

        // Dead letter queues on the DLX
        self.declare_dlq(&channel, &self.config.queue_dlq, RK_FAILED).await?;
        self.declare_dlq(
            &channel,
            &format!("{}.dlq", self.config.queue_email),
            &channel_failed_key(Channel::Email),
        )
        .await?;
        self.declare_dlq(
            &channel,
            &format!("{}.dlq", self.config.queue_priority),
            "notification.priority.failed",
        )
        .await?;

        info!("Broker topology declared");

        Ok(())
    }

    async fn declare_work_queue(
        &self,
        channel: &AmqpChannel,
        queue: &str,
        routing_key: &str,
        dead_letter_key: &str,
        max_priority: bool,
    ) -> Result<()> {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.config.exchange_dlx.as_str().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dead_letter_key.into()),
        );
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongUInt(self.config.message_ttl_ms),
        );
        if max_priority {
            args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(10));
        }

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;

        channel
            .queue_bind(
                queue,
                self.config.exchange_main.as_str(),
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn declare_dlq(
        &self,
        channel: &AmqpChannel,
        queue: &str,
        routing_key: &str,
    ) -> Result<()> {
        let mut args = FieldTable::default();
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongUInt(self.config.dlq_ttl_ms),
        );

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;

        channel
            .queue_bind(
                queue,
                self.config.exchange_dlx.as_str(),
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Work queue name for a delivery channel.
    pub fn channel_queue(&self, channel: Channel) -> &str {
        match channel {
            Channel::Email => &self.config.queue_email,
            Channel::InApp => &self.config.queue_in_app,
            Channel::Push => &self.config.queue_push,
            Channel::Sms => &self.config.queue_sms,
        }
    }

    /// Current depth of a queue (passive declare).
    pub async fn queue_depth(&self, queue: &str) -> Result<u32> {
        let channel = self.connection.create_channel().await?;
        let state = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(state.message_count())
    }
}

/// Routing-key segment for a delivery channel
fn channel_segment(channel: Channel) -> &'static str {
    match channel {
        Channel::Email => "email",
        Channel::InApp => "inapp",
        Channel::Push => "push",
        Channel::Sms => "sms",
    }
}

/// Send routing key for a delivery channel, e.g.
/// `notification.email.send`.
pub fn channel_send_key(channel: Channel) -> String {
    format!("notification.{}.send", channel_segment(channel))
}

/// Dead-letter routing key for a delivery channel, e.g.
/// `notification.email.failed`.
pub fn channel_failed_key(channel: Channel) -> String {
    format!("notification.{}.failed", channel_segment(channel))
}

/// Publisher for notification messages.
#[derive(Clone)]
pub struct Publisher {
    channel: AmqpChannel,
    exchange_main: String,
    exchange_dlx: String,
}

impl Publisher {
    pub fn new(channel: AmqpChannel, config: &BrokerConfig) -> Self {
        Self {
            channel,
            exchange_main: config.exchange_main.clone(),
            exchange_dlx: config.exchange_dlx.clone(),
        }
    }

    fn properties(
        message_id: &str,
        priority: Priority,
        attempts: i32,
        correlation_id: Option<&str>,
    ) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(X_ATTEMPTS.into(), AMQPValue::LongInt(attempts.into()));
        headers.insert(
            X_FIRST_ENQUEUED_AT.into(),
            AMQPValue::LongString(chrono::Utc::now().to_rfc3339().into()),
        );
        if let Some(correlation_id) = correlation_id {
            headers.insert(
                X_CORRELATION_ID.into(),
                AMQPValue::LongString(correlation_id.into()),
            );
        }

        BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(message_id.into())
            .with_priority(priority.amqp_priority())
            .with_headers(headers)
    }

    /// Publish a freshly created notification to the main exchange.
    /// The routing key is chosen by priority.
    pub async fn publish_created(
        &self,
        message: &NotificationMessage,
        correlation_id: Option<&str>,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let routing_key = message.priority.routing_key();

        self.channel
            .basic_publish(
                &self.exchange_main,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                Self::properties(
                    &message.id.to_string(),
                    message.priority,
                    0,
                    correlation_id,
                ),
            )
            .await?
            .await?;

        metrics::counter!("notifications.created").increment(1);

        Ok(())
    }

    /// Publish to a channel fan-out queue through the main exchange.
    pub async fn publish_to_channel(
        &self,
        channel: Channel,
        message: &NotificationMessage,
        attempts: i32,
        correlation_id: Option<&str>,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let routing_key = channel_send_key(channel);

        self.channel
            .basic_publish(
                &self.exchange_main,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                Self::properties(
                    &message.id.to_string(),
                    message.priority,
                    attempts,
                    correlation_id,
                ),
            )
            .await?
            .await?;

        Ok(())
    }

    /// Publish a message the pipeline gave up on to the DLX.
    pub async fn publish_dead_letter(
        &self,
        routing_key: &str,
        message_id: &str,
        payload: &[u8],
        attempts: i32,
    ) -> Result<()> {
        self.channel
            .basic_publish(
                &self.exchange_dlx,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                Self::properties(message_id, Priority::Normal, attempts, None),
            )
            .await?
            .await?;

        metrics::counter!("notifications.deadlettered").increment(1);

        Ok(())
    }

    /// Replay a dead letter onto its originating queue (default
    /// exchange targets the queue by name) with attempts reset.
    pub async fn publish_replay(
        &self,
        queue: &str,
        message_id: &str,
        payload: &[u8],
    ) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                Self::properties(message_id, Priority::Normal, 0, None),
            )
            .await?
            .await?;

        Ok(())
    }
}

/// Read an integer header from consumed message properties.
pub fn header_i64(properties: &BasicProperties, name: &str) -> Option<i64> {
    let headers = properties.headers().as_ref()?;
    let value = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)?;

    match value {
        AMQPValue::LongInt(v) => Some(*v as i64),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::ShortInt(v) => Some(*v as i64),
        AMQPValue::LongUInt(v) => Some(*v as i64),
        _ => None,
    }
}

/// Read a string header from consumed message properties.
pub fn header_string(properties: &BasicProperties, name: &str) -> Option<String> {
    let headers = properties.headers().as_ref()?;
    let value = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)?;

    match value {
        AMQPValue::LongString(v) => Some(v.to_string()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_routing_keys() {
        assert_eq!(channel_send_key(Channel::Email), "notification.email.send");
        assert_eq!(channel_send_key(Channel::InApp), "notification.inapp.send");
        assert_eq!(
            channel_failed_key(Channel::Email),
            "notification.email.failed"
        );
        assert_eq!(channel_failed_key(Channel::Sms), "notification.sms.failed");
    }

    #[test]
    fn test_header_roundtrip() {
        let props = Publisher::properties("msg-1", Priority::High, 2, Some("corr-9"));
        assert_eq!(header_i64(&props, X_ATTEMPTS), Some(2));
        assert_eq!(
            header_string(&props, X_CORRELATION_ID),
            Some("corr-9".to_string())
        );
        assert!(header_string(&props, X_FIRST_ENQUEUED_AT).is_some());
        assert_eq!(header_i64(&props, "missing"), None);
        assert_eq!(props.priority(), &Some(Priority::High.amqp_priority()));
    }
}
