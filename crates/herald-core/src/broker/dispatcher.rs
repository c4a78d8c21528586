//! Dispatcher: consumes the ingress lanes, applies the policy gate,
//! and fans out to the per-channel queues.
//!
//! Consumers never call the ingress write path; they operate on the
//! stored record directly and publish only to channel queues. Routing
//! is claimed through a CAS on the record state, which makes the
//! dispatcher idempotent on message id under redelivery and across
//! instances.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use lapin::Channel as AmqpChannel;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{header_string, Publisher};
use crate::notification::{
    Channel, Notification, NotificationMessage, NotificationState, X_CORRELATION_ID,
    X_FIRST_ENQUEUED_AT,
};
use crate::policy::{GateOutcome, PreferenceGate};
use crate::repository::{
    DeadLetter, DeadLetterStore, NotificationStore, TransitionContext, TransitionOutcome,
};
use crate::template::TemplateCache;
use crate::Result;

/// Consumes an ingress queue and routes notifications to channel
/// queues.
pub struct Dispatcher {
    store: Arc<dyn NotificationStore>,
    gate: Arc<PreferenceGate>,
    templates: Arc<TemplateCache>,
    publisher: Publisher,
    dead_letters: Arc<dyn DeadLetterStore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        gate: Arc<PreferenceGate>,
        templates: Arc<TemplateCache>,
        publisher: Publisher,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            store,
            gate,
            templates,
            publisher,
            dead_letters,
        }
    }

    /// Spawn one consumer per ingress lane (default and priority).
    pub async fn spawn(
        self: Arc<Self>,
        broker: &crate::broker::Broker,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let lanes = [
            broker.config().queue_main.clone(),
            broker.config().queue_priority.clone(),
        ];

        let mut handles = Vec::with_capacity(lanes.len());
        for queue in lanes {
            let channel = broker.create_consumer_channel().await?;
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();

            handles.push(tokio::spawn(async move {
                if let Err(e) = dispatcher.run(channel, queue, shutdown).await {
                    error!(error = %e, "Dispatcher exited with error");
                }
            }));
        }

        Ok(handles)
    }

    /// Consume `queue` until shutdown flips.
    pub async fn run(
        self: Arc<Self>,
        channel: AmqpChannel,
        queue: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut consumer = channel
            .basic_consume(
                &queue,
                &format!("herald-dispatcher-{}", queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %queue, "Dispatcher consuming");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(queue = %queue, "Dispatcher stopping");
                        return Ok(());
                    }
                }
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else {
                        warn!(queue = %queue, "Consumer stream ended");
                        return Ok(());
                    };

                    match delivery {
                        Ok(delivery) => {
                            if let Err(e) = self.handle(&queue, delivery).await {
                                error!(queue = %queue, error = %e, "Dispatcher delivery failed");
                            }
                        }
                        Err(e) => {
                            error!(queue = %queue, error = %e, "Consumer error");
                        }
                    }
                }
            }
        }
    }

    async fn handle(&self, queue: &str, delivery: Delivery) -> Result<()> {
        record_queue_wait(&delivery);

        let message: NotificationMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                // Irrecoverable conversion error: acknowledge and dead-letter
                self.record_conversion_failure(queue, &delivery, &e.to_string())
                    .await;
                delivery.acker.ack(BasicAckOptions::default()).await?;
                return Ok(());
            }
        };

        let correlation_id = header_string(&delivery.properties, X_CORRELATION_ID);

        match self
            .dispatch(queue, &message, correlation_id.as_deref())
            .await
        {
            Ok(()) => {
                delivery.acker.ack(BasicAckOptions::default()).await?;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                // Infrastructure hiccup: requeue for redelivery
                warn!(id = %message.id, error = %e, "Dispatch failed, requeueing");
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
                self.record_conversion_failure(queue, &delivery, &e.to_string())
                    .await;
                delivery.acker.ack(BasicAckOptions::default()).await?;
                Err(e)
            }
        }
    }

    /// Core routing. Claims the record with a `PENDING -> QUEUED` CAS,
    /// gates it, then publishes to the surviving channel queues.
    async fn dispatch(
        &self,
        _queue: &str,
        message: &NotificationMessage,
        correlation_id: Option<&str>,
    ) -> Result<()> {
        let record = match self.store.get(message.id).await? {
            Some(record) => record,
            // Messages ingested straight off the bus have no record
            // yet; materialize one (insert is idempotent by id).
            None => self.store.insert(&record_from_message(message)).await?,
        };

        if record.state.is_in_flight_or_done() {
            debug!(id = %record.id, state = %record.state, "Already handled, acking");
            return Ok(());
        }

        // Claim the record. Losing the race means another dispatcher
        // instance (or a redelivery) already routed it.
        let record = match self
            .store
            .transition(
                record.id,
                NotificationState::Pending,
                NotificationState::Queued,
                TransitionContext {
                    correlation_id: correlation_id.map(str::to_string),
                    ..Default::default()
                },
            )
            .await?
        {
            TransitionOutcome::Applied(record) => record,
            TransitionOutcome::Conflict { actual } => {
                debug!(id = %record.id, state = %actual, "Lost routing claim, acking");
                return Ok(());
            }
            TransitionOutcome::NotFound => return Ok(()),
        };

        let outcome = self.gate.gate(&record, Utc::now()).await?;

        let plan = match outcome {
            GateOutcome::Suppressed(reason) => {
                return self.suppress(&record, &reason).await;
            }
            GateOutcome::Proceed(plan) => plan,
        };

        // Recipient email comes from the normalized metadata view; a
        // requested email channel without an address is dropped.
        let email_address = message.user_email().or_else(|| record.user_email());

        let deliver_now: Vec<Channel> = plan
            .deliver
            .iter()
            .copied()
            .filter(|channel| {
                if *channel == Channel::Email && email_address.is_none() {
                    debug!(id = %record.id, "Email requested but no userEmail present");
                    return false;
                }
                true
            })
            .collect();

        // Validate and warm the templates before fan-out. Fatal render
        // errors (missing template, missing required variable) kill
        // the notification here instead of bouncing through a worker.
        if record.template_id.is_some() && !deliver_now.is_empty() {
            if let Err(reason) = self.prerender(&record, &deliver_now).await {
                self.kill_unrenderable(&record, message, &reason).await?;
                return Ok(());
            }
        }

        let mut routed = 0usize;
        for channel in &deliver_now {
            self.publisher
                .publish_to_channel(*channel, message, record.attempts, correlation_id)
                .await?;
            routed += 1;
        }

        for (channel, resume_at) in &plan.deferred {
            if *channel == Channel::Email && email_address.is_none() {
                continue;
            }
            self.schedule_deferred(*channel, message.clone(), *resume_at, record.attempts);
            routed += 1;
        }

        // Digested channels were buffered by the gate
        routed += plan.digested.len();

        if routed == 0 {
            return self.suppress(&record, "no_channel").await;
        }

        debug!(id = %record.id, routed, "Notification routed");

        Ok(())
    }

    /// Render every outgoing channel once, warming both cache tiers.
    /// Returns the failure reason when the template can never render.
    async fn prerender(
        &self,
        record: &Notification,
        channels: &[Channel],
    ) -> std::result::Result<(), String> {
        let Some(template_id) = &record.template_id else {
            return Ok(());
        };

        for channel in channels {
            if let Err(e) = self
                .templates
                .render(template_id, *channel, record.locale.as_deref(), &record.variables)
                .await
            {
                if e.is_fatal_for_delivery() {
                    return Err(e.to_string());
                }
                // Cache/store hiccups degrade to worker-side rendering
                debug!(id = %record.id, error = %e, "Prerender degraded");
            }
        }

        // Mark the record rendered; workers claim RENDERED -> SENDING
        if let TransitionOutcome::Conflict { actual } = self
            .store
            .transition(
                record.id,
                NotificationState::Queued,
                NotificationState::Rendered,
                TransitionContext::default(),
            )
            .await
            .map_err(|e| e.to_string())?
        {
            debug!(id = %record.id, state = %actual, "Rendered transition lost a race");
        }

        Ok(())
    }

    /// Template can never render: `QUEUED -> DEAD`, dead-lettered,
    /// never retried.
    async fn kill_unrenderable(
        &self,
        record: &Notification,
        message: &NotificationMessage,
        reason: &str,
    ) -> Result<()> {
        warn!(id = %record.id, reason, "Notification unrenderable");

        if let TransitionOutcome::Conflict { actual } = self
            .store
            .transition(
                record.id,
                NotificationState::Queued,
                NotificationState::Dead,
                TransitionContext::with_error(reason),
            )
            .await?
        {
            debug!(id = %record.id, state = %actual, "Dead transition lost a race");
            return Ok(());
        }

        let payload = serde_json::to_vec(message)?;
        let letter = DeadLetter::new(
            record.id,
            "notifications",
            crate::broker::RK_FAILED,
            payload.clone(),
            reason,
            record.attempts,
            "template_fatal",
        );

        if let Err(e) = self.dead_letters.record(&letter).await {
            error!(error = %e, "Failed to persist dead letter");
        }

        self.publisher
            .publish_dead_letter(crate::broker::RK_FAILED, &record.id.to_string(), &payload, record.attempts)
            .await?;

        Ok(())
    }

    /// Mark a notification delivered-by-suppression. Still audited.
    async fn suppress(&self, record: &Notification, reason: &str) -> Result<()> {
        info!(id = %record.id, reason, "Notification suppressed");

        match self
            .store
            .transition(
                record.id,
                NotificationState::Queued,
                NotificationState::Sent,
                TransitionContext::suppressed(reason),
            )
            .await?
        {
            TransitionOutcome::Applied(_) | TransitionOutcome::NotFound => Ok(()),
            TransitionOutcome::Conflict { actual } => {
                debug!(id = %record.id, state = %actual, "Suppression lost the race");
                Ok(())
            }
        }
    }

    /// Publish a deferred delivery once quiet hours end. The record
    /// stays `QUEUED`; the channel worker picks it up after the timer
    /// republishes.
    fn schedule_deferred(
        &self,
        channel: Channel,
        message: NotificationMessage,
        resume_at: chrono::DateTime<Utc>,
        attempts: i32,
    ) {
        let publisher = self.publisher.clone();
        let delay = (resume_at - Utc::now())
            .to_std()
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));

        debug!(id = %message.id, channel = %channel, ?delay, "Deferred past quiet hours");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = publisher
                .publish_to_channel(channel, &message, attempts, None)
                .await
            {
                error!(id = %message.id, error = %e, "Deferred publish failed");
            }
        });
    }

    async fn record_conversion_failure(&self, queue: &str, delivery: &Delivery, error: &str) {
        warn!(queue, error, "Recording conversion failure");

        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .and_then(|id| Uuid::parse_str(id.as_str()).ok())
            .unwrap_or_else(Uuid::new_v4);

        let letter = DeadLetter::new(
            message_id,
            queue,
            delivery.routing_key.as_str(),
            delivery.data.clone(),
            error,
            0,
            "conversion_failed",
        );

        if let Err(e) = self.dead_letters.record(&letter).await {
            error!(error = %e, "Failed to persist dead letter");
        }

        if let Err(e) = self
            .publisher
            .publish_dead_letter(
                crate::broker::RK_FAILED,
                &message_id.to_string(),
                &delivery.data,
                0,
            )
            .await
        {
            error!(error = %e, "Failed to publish dead letter");
        }
    }
}

/// Materialize a record for a message that arrived straight off the
/// bus. The merged metadata becomes the record's single metadata view.
fn record_from_message(message: &NotificationMessage) -> Notification {
    let merged = message.merged_metadata();
    let metadata = serde_json::to_value(&merged).unwrap_or(serde_json::Value::Null);

    let mut notification = Notification::new(
        message.user_id,
        message.kind,
        message.title.clone().unwrap_or_default(),
        message.content.clone().unwrap_or_default(),
    )
    .with_priority(message.priority)
    .with_channels(message.channels.clone())
    .with_metadata(metadata);

    notification.id = message.id;
    if let Some(template_id) = &message.template_id {
        notification = notification.with_template(template_id.clone(), message.variables.clone());
    }
    notification.locale = message.locale.clone();
    notification
}

fn record_queue_wait(delivery: &Delivery) {
    if let Some(enqueued_at) = header_string(&delivery.properties, X_FIRST_ENQUEUED_AT) {
        if let Ok(enqueued_at) = chrono::DateTime::parse_from_rfc3339(&enqueued_at) {
            let wait = (Utc::now() - enqueued_at.with_timezone(&Utc))
                .to_std()
                .unwrap_or_default();
            metrics::histogram!("queue.wait_seconds").record(wait.as_secs_f64());
        }
    }
}
