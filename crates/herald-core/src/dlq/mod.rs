//! Dead-letter administration.
//!
//! DLQ consumers are passive; nothing replays automatically. The
//! controller exposes list, replay, and purge for the admin surface.
//! Replay is idempotent by message id: the first call claims the
//! letter, every later call is a no-op.

use std::sync::Arc;

use lapin::options::QueuePurgeOptions;
use lapin::Channel as AmqpChannel;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::Publisher;
use crate::notification::NotificationState;
use crate::repository::{
    DeadLetter, DeadLetterStore, NotificationStore, TransitionContext, TransitionOutcome,
};
use crate::{Error, Result};

/// Result of a replay request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOutcome {
    /// Letter re-published to its originating queue
    Replayed,

    /// Letter was already replayed earlier
    AlreadyReplayed,
}

/// Admin controller over the dead-letter queues.
pub struct ReplayController {
    store: Arc<dyn NotificationStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    publisher: Publisher,
    amqp: AmqpChannel,
}

impl ReplayController {
    /// Build a controller with its own broker channel.
    pub async fn create(
        broker: &crate::broker::Broker,
        store: Arc<dyn NotificationStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Result<Self> {
        let publisher = Publisher::new(broker.create_channel().await?, broker.config());
        let amqp = broker.create_channel().await?;
        Ok(Self::new(store, dead_letters, publisher, amqp))
    }

    pub fn new(
        store: Arc<dyn NotificationStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        publisher: Publisher,
        amqp: AmqpChannel,
    ) -> Self {
        Self {
            store,
            dead_letters,
            publisher,
            amqp,
        }
    }

    pub async fn list(&self, queue: &str, limit: i64) -> Result<Vec<DeadLetter>> {
        self.dead_letters.list_by_queue(queue, limit).await
    }

    /// Replay one letter onto its originating queue with attempts
    /// reset to zero.
    pub async fn replay(&self, id: Uuid) -> Result<ReplayOutcome> {
        let letter = self
            .dead_letters
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("dead letter {}", id)))?;

        if !self.dead_letters.claim_replay(letter.id).await? {
            return Ok(ReplayOutcome::AlreadyReplayed);
        }

        // Reset the record so the workers accept the message again
        if let Some(record) = self.store.get(letter.message_id).await? {
            if matches!(
                record.state,
                NotificationState::Dead | NotificationState::Failed
            ) {
                match self
                    .store
                    .transition(
                        record.id,
                        record.state,
                        NotificationState::Queued,
                        TransitionContext::replay(),
                    )
                    .await?
                {
                    TransitionOutcome::Applied(_) => {}
                    TransitionOutcome::Conflict { actual } => {
                        warn!(id = %record.id, state = %actual, "Replay record reset lost a race");
                    }
                    TransitionOutcome::NotFound => {}
                }
            }
        }

        self.publisher
            .publish_replay(&letter.queue, &letter.message_id.to_string(), &letter.payload)
            .await?;

        info!(
            letter = %letter.id,
            message = %letter.message_id,
            queue = %letter.queue,
            "Dead letter replayed"
        );

        Ok(ReplayOutcome::Replayed)
    }

    /// Drop the stored letters and purge the broker-side queue.
    pub async fn purge(&self, queue: &str) -> Result<u64> {
        let purged_rows = self.dead_letters.purge_queue(queue).await?;

        let dlq_name = if queue.ends_with(".dlq") {
            queue.to_string()
        } else {
            format!("{}.dlq", queue)
        };

        if let Err(e) = self
            .amqp
            .queue_purge(&dlq_name, QueuePurgeOptions::default())
            .await
        {
            warn!(queue = %dlq_name, error = %e, "Broker-side purge failed");
        }

        info!(queue, purged_rows, "Dead letter queue purged");

        Ok(purged_rows)
    }
}
