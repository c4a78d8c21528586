//! The per-channel delivery worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use lapin::Channel as AmqpChannel;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{channel_failed_key, channel_send_key, Broker, Publisher};
use crate::delivery::ExponentialBackoff;
use crate::notification::{Channel, Notification, NotificationMessage, NotificationState};
use crate::repository::{
    DeadLetter, DeadLetterStore, NotificationStore, TransitionContext, TransitionOutcome,
};
use crate::template::{Rendered, TemplateCache};
use crate::transport::{DeliveryPayload, SendOutcome, Transport};
use crate::Result;

/// What the worker decided to do with a delivery attempt.
#[derive(Debug)]
pub enum DeliveryDisposition {
    /// Transport accepted; record is `SENT`
    Sent,

    /// Transient failure; record re-queued, retry after `delay`
    RetryScheduled { attempts: i32, delay: Duration },

    /// Record is `DEAD`; emit to the DLQ
    Dead { reason: String, attempts: i32 },

    /// Someone else owns the record (CAS lost, terminal, missing)
    Skipped,
}

/// Worker for one delivery channel.
pub struct DeliveryWorker {
    channel: Channel,
    store: Arc<dyn NotificationStore>,
    templates: Arc<TemplateCache>,
    transport: Arc<dyn Transport>,
    publisher: Publisher,
    dead_letters: Arc<dyn DeadLetterStore>,
    max_retries: i32,
    backoff: ExponentialBackoff,
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Channel,
        store: Arc<dyn NotificationStore>,
        templates: Arc<TemplateCache>,
        transport: Arc<dyn Transport>,
        publisher: Publisher,
        dead_letters: Arc<dyn DeadLetterStore>,
        max_retries: i32,
        backoff: ExponentialBackoff,
    ) -> Self {
        Self {
            channel,
            store,
            templates,
            transport,
            publisher,
            dead_letters,
            max_retries,
            backoff,
        }
    }

    /// Consume the channel queue until shutdown flips.
    pub async fn run(
        self: Arc<Self>,
        amqp: AmqpChannel,
        queue: String,
        tag: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut consumer = amqp
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %queue, tag = %tag, "Delivery worker consuming");
        metrics::gauge!("workers.active", "channel" => self.channel.as_str()).increment(1.0);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { break };

                    match delivery {
                        Ok(delivery) => {
                            if let Err(e) = self.handle(&queue, delivery).await {
                                error!(queue = %queue, error = %e, "Worker delivery failed");
                            }
                        }
                        Err(e) => error!(queue = %queue, error = %e, "Consumer error"),
                    }
                }
            }
        }

        metrics::gauge!("workers.active", "channel" => self.channel.as_str()).decrement(1.0);
        info!(queue = %queue, tag = %tag, "Delivery worker stopped");

        Ok(())
    }

    async fn handle(&self, queue: &str, delivery: Delivery) -> Result<()> {
        let message: NotificationMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(queue, error = %e, "Undecodable message on channel queue");
                self.dead_letter_raw(queue, &delivery.data, &e.to_string(), 0, "conversion_failed")
                    .await;
                delivery.acker.ack(BasicAckOptions::default()).await?;
                return Ok(());
            }
        };

        match self.process(&message, &delivery.data).await {
            Ok(disposition) => {
                debug!(id = %message.id, ?disposition, "Delivery processed");
                // The store transition is durable; only now acknowledge.
                delivery.acker.ack(BasicAckOptions::default()).await?;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(id = %message.id, error = %e, "Infrastructure failure, requeueing");
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!(id = %message.id, error = %e, "Unrecoverable delivery failure");
                self.dead_letter_raw(queue, &delivery.data, &e.to_string(), 0, "conversion_failed")
                    .await;
                delivery.acker.ack(BasicAckOptions::default()).await?;
                Err(e)
            }
        }
    }

    /// One delivery attempt: claim, render, hand off, map the outcome.
    async fn process(
        &self,
        message: &NotificationMessage,
        raw: &[u8],
    ) -> Result<DeliveryDisposition> {
        let Some(record) = self.store.get(message.id).await? else {
            warn!(id = %message.id, "No record for channel message, skipping");
            return Ok(DeliveryDisposition::Skipped);
        };

        if record.state.is_in_flight_or_done() {
            return Ok(DeliveryDisposition::Skipped);
        }

        // A record still PENDING was routed by someone other than the
        // dispatcher (e.g. a replay racing it); walk it to QUEUED first.
        let record = if record.state == NotificationState::Pending {
            match self
                .store
                .transition(
                    record.id,
                    NotificationState::Pending,
                    NotificationState::Queued,
                    TransitionContext::default(),
                )
                .await?
            {
                TransitionOutcome::Applied(record) => record,
                TransitionOutcome::Conflict { .. } | TransitionOutcome::NotFound => {
                    return Ok(DeliveryDisposition::Skipped)
                }
            }
        } else {
            record
        };

        // Exclusive claim
        let record = match self
            .store
            .transition(
                record.id,
                record.state,
                NotificationState::Sending,
                TransitionContext::default(),
            )
            .await?
        {
            TransitionOutcome::Applied(record) => record,
            TransitionOutcome::Conflict { actual } => {
                debug!(id = %message.id, state = %actual, "Claim lost, skipping");
                return Ok(DeliveryDisposition::Skipped);
            }
            TransitionOutcome::NotFound => return Ok(DeliveryDisposition::Skipped),
        };

        // Render; template errors are fatal and never retried
        let payload = match self.build_payload(&record).await {
            Ok(payload) => payload,
            Err(e) if e.is_fatal_for_delivery() => {
                let disposition = self.fail_fatally(&record, &e.to_string()).await?;
                if let DeliveryDisposition::Dead { reason, attempts } = &disposition {
                    self.dead_letter_raw(
                        self.queue_name(),
                        raw,
                        reason,
                        *attempts,
                        "template_fatal",
                    )
                    .await;
                }
                return Ok(disposition);
            }
            Err(e) => return Err(e),
        };

        let outcome = self.transport.send(&payload).await;
        let disposition = apply_outcome(
            self.store.as_ref(),
            &record,
            outcome,
            self.max_retries,
            &self.backoff,
        )
        .await?;

        match &disposition {
            DeliveryDisposition::Sent => {
                metrics::counter!("notifications.sent", "channel" => self.channel.as_str())
                    .increment(1);
                let latency = (Utc::now() - record.created_at).to_std().unwrap_or_default();
                metrics::histogram!("delivery.latency_seconds", "channel" => self.channel.as_str())
                    .record(latency.as_secs_f64());
            }
            DeliveryDisposition::RetryScheduled { attempts, delay } => {
                metrics::counter!("notifications.failed", "channel" => self.channel.as_str())
                    .increment(1);
                self.schedule_retry(message.clone(), *attempts, *delay);
            }
            DeliveryDisposition::Dead { reason, attempts } => {
                metrics::counter!("notifications.failed", "channel" => self.channel.as_str())
                    .increment(1);
                self.dead_letter_raw(self.queue_name(), raw, reason, *attempts, "delivery_failed")
                    .await;
            }
            DeliveryDisposition::Skipped => {}
        }

        Ok(disposition)
    }

    /// Fatal render failure: `SENDING -> FAILED -> DEAD`, never retried.
    async fn fail_fatally(
        &self,
        record: &Notification,
        reason: &str,
    ) -> Result<DeliveryDisposition> {
        self.transition_or_log(
            record.id,
            NotificationState::Sending,
            NotificationState::Failed,
            TransitionContext::with_error(reason),
        )
        .await?;
        self.transition_or_log(
            record.id,
            NotificationState::Failed,
            NotificationState::Dead,
            TransitionContext::default(),
        )
        .await?;

        Ok(DeliveryDisposition::Dead {
            reason: reason.to_string(),
            attempts: record.attempts,
        })
    }

    async fn transition_or_log(
        &self,
        id: uuid::Uuid,
        from: NotificationState,
        to: NotificationState,
        ctx: TransitionContext,
    ) -> Result<()> {
        transition_tolerant(self.store.as_ref(), id, from, to, ctx).await
    }

    /// Rendered payload for this channel. The recipient comes
    /// exclusively from the stored record, never the message envelope.
    async fn build_payload(&self, record: &Notification) -> Result<DeliveryPayload> {
        let rendered = match &record.template_id {
            Some(template_id) => {
                self.templates
                    .render(
                        template_id,
                        self.channel,
                        record.locale.as_deref(),
                        &record.variables,
                    )
                    .await?
            }
            // Pre-rendered notification
            None => Rendered {
                subject: Some(record.title.clone()),
                body: record.content.clone(),
                html: false,
                version: 0,
            },
        };

        let recipient = match self.channel {
            Channel::Email => record.user_email(),
            Channel::Push => metadata_field(record, "deviceToken"),
            Channel::Sms => metadata_field(record, "phoneNumber"),
            Channel::InApp => None,
        };

        let subject = rendered
            .subject
            .or_else(|| (!record.title.is_empty()).then(|| record.title.clone()));

        Ok(DeliveryPayload {
            notification_id: record.id,
            user_id: record.user_id,
            kind: record.kind,
            priority: record.priority,
            recipient,
            subject,
            body: rendered.body,
            html: rendered.html,
        })
    }

    fn schedule_retry(&self, message: NotificationMessage, attempts: i32, delay: Duration) {
        let publisher = self.publisher.clone();
        let channel = self.channel;

        debug!(id = %message.id, attempts, ?delay, "Retry scheduled");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = publisher
                .publish_to_channel(channel, &message, attempts, None)
                .await
            {
                error!(id = %message.id, error = %e, "Retry publish failed");
            }
        });
    }

    async fn dead_letter_raw(
        &self,
        queue: &str,
        payload: &[u8],
        reason: &str,
        attempts: i32,
        failure_kind: &str,
    ) {
        let message_id = serde_json::from_slice::<NotificationMessage>(payload)
            .map(|m| m.id)
            .unwrap_or_else(|_| uuid::Uuid::new_v4());

        let letter = DeadLetter::new(
            message_id,
            queue,
            channel_send_key(self.channel),
            payload.to_vec(),
            reason,
            attempts,
            failure_kind,
        );

        if let Err(e) = self.dead_letters.record(&letter).await {
            error!(error = %e, "Failed to persist dead letter");
        }

        if let Err(e) = self
            .publisher
            .publish_dead_letter(
                &channel_failed_key(self.channel),
                &message_id.to_string(),
                payload,
                attempts,
            )
            .await
        {
            error!(error = %e, "Failed to publish dead letter");
        }
    }

    fn queue_name(&self) -> &'static str {
        match self.channel {
            Channel::Email => "notifications.email",
            Channel::InApp => "notifications.inapp",
            Channel::Push => "notifications.push",
            Channel::Sms => "notifications.sms",
        }
    }
}

/// Map a transport outcome onto the record's state machine. Only store
/// transitions happen here; queue and DLQ side effects stay with the
/// caller.
pub(crate) async fn apply_outcome(
    store: &dyn NotificationStore,
    record: &Notification,
    outcome: SendOutcome,
    max_retries: i32,
    backoff: &ExponentialBackoff,
) -> Result<DeliveryDisposition> {
    match outcome {
        SendOutcome::Delivered => {
            transition_tolerant(
                store,
                record.id,
                NotificationState::Sending,
                NotificationState::Sent,
                TransitionContext::default(),
            )
            .await?;
            Ok(DeliveryDisposition::Sent)
        }

        SendOutcome::Transient(reason) => {
            let next_attempts = record.attempts + 1;

            if next_attempts >= max_retries {
                transition_tolerant(
                    store,
                    record.id,
                    NotificationState::Sending,
                    NotificationState::Dead,
                    TransitionContext::retry(reason.clone()),
                )
                .await?;
                return Ok(DeliveryDisposition::Dead {
                    reason: format!("retries exhausted: {}", reason),
                    attempts: next_attempts,
                });
            }

            transition_tolerant(
                store,
                record.id,
                NotificationState::Sending,
                NotificationState::Queued,
                TransitionContext::retry(reason),
            )
            .await?;

            Ok(DeliveryDisposition::RetryScheduled {
                attempts: next_attempts,
                delay: backoff.delay_for(next_attempts as u32),
            })
        }

        SendOutcome::Permanent(reason) => {
            transition_tolerant(
                store,
                record.id,
                NotificationState::Sending,
                NotificationState::Dead,
                TransitionContext::retry(reason.clone()),
            )
            .await?;
            Ok(DeliveryDisposition::Dead {
                reason,
                attempts: record.attempts + 1,
            })
        }
    }
}

/// CAS conflicts are logged, never surfaced: losing the race means
/// another worker already moved the record on.
async fn transition_tolerant(
    store: &dyn NotificationStore,
    id: uuid::Uuid,
    from: NotificationState,
    to: NotificationState,
    ctx: TransitionContext,
) -> Result<()> {
    match store.transition(id, from, to, ctx).await? {
        TransitionOutcome::Applied(_) => Ok(()),
        TransitionOutcome::Conflict { actual } => {
            warn!(%id, expected = %from, %actual, "Concurrent state change");
            Ok(())
        }
        TransitionOutcome::NotFound => {
            warn!(%id, "Record vanished mid-delivery");
            Ok(())
        }
    }
}

fn metadata_field(record: &Notification, field: &str) -> Option<String> {
    record
        .metadata
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Spawns the bounded worker pool for one channel.
pub struct WorkerPool;

impl WorkerPool {
    pub async fn start(
        broker: &Broker,
        worker: Arc<DeliveryWorker>,
        channel: Channel,
        count: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let queue = broker.channel_queue(channel).to_string();
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let amqp = broker.create_consumer_channel().await?;
            let worker = worker.clone();
            let queue = queue.clone();
            let tag = format!("herald-{}-{}", channel, index);
            let shutdown = shutdown.clone();

            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(amqp, queue, tag, shutdown).await {
                    error!(error = %e, "Worker exited with error");
                }
            }));
        }

        Ok(handles)
    }
}
