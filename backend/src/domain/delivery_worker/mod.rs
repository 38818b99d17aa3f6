//! Idempotent delivery of queued notifications.
//!
//! The worker turns one queue delivery into at most one send and at most one
//! store write. It re-reads the notification's status before sending, so a
//! redelivered message for a `Sent` or `Canceled` row is dropped without side
//! effects. Send failures feed the retry policy and never ask the queue for
//! redelivery; the rescheduled row is picked up again by a scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use mockable::Clock;
use tracing::{error, info, warn};

use crate::domain::notification_lookup::NotificationLookup;
use crate::domain::ports::{
    MessageHandler, MessageHandlerError, NotificationRepository, NotificationRepositoryError,
    NotificationSendError, SenderRegistry, StatusUpdate,
};
use crate::domain::{
    BackoffPolicy, Channel, Notification, NotificationEnvelope, NotificationStatus,
    RetryDecision, RetryPolicy,
};

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryWorkerConfig {
    /// Upper bound for a single send attempt.
    pub send_timeout: Duration,
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// What the worker did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The sender succeeded and the row is `Sent`.
    Sent,
    /// The send failed; the row is `Pending` again.
    Rescheduled {
        /// Failures recorded so far.
        retry_count: u32,
        /// Next attempt instant.
        scheduled_at: DateTime<Utc>,
    },
    /// The send failed and the retry budget is spent; the row is `Failed`.
    Exhausted {
        /// Retry count stored with the failure.
        retry_count: u32,
    },
    /// The row was already `Sent` or `Canceled`; nothing was done.
    AlreadyFinal(NotificationStatus),
    /// The row no longer exists; the message was dropped.
    Missing,
    /// The message body could not be decoded; it was dropped.
    Malformed,
}

/// Failures surfaced to the caller of [`DeliveryWorker::deliver`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// No sender is registered for the channel. The row is marked `Failed`.
    #[error("no sender registered for channel '{channel}'")]
    UnsupportedChannel {
        /// Channel carried by the notification.
        channel: Channel,
    },
    /// The store could not be read or written; the delivery must be retried.
    #[error("notification store unavailable: {message}")]
    StoreUnavailable {
        /// Store diagnostic.
        message: String,
    },
}

impl DeliveryError {
    /// True when the queue should redeliver the message.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

impl From<NotificationRepositoryError> for DeliveryError {
    fn from(value: NotificationRepositoryError) -> Self {
        Self::StoreUnavailable {
            message: value.to_string(),
        }
    }
}

/// Ports required by the worker.
#[derive(Clone)]
pub struct DeliveryWorkerPorts {
    /// Authoritative store.
    pub repository: Arc<dyn NotificationRepository>,
    /// Cache-first reads backed by the same store.
    pub lookup: NotificationLookup,
    /// Channel senders.
    pub senders: SenderRegistry,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Consumes queue deliveries and drives the retry state machine.
pub struct DeliveryWorker {
    repository: Arc<dyn NotificationRepository>,
    lookup: NotificationLookup,
    senders: SenderRegistry,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    backoff: Arc<dyn BackoffPolicy>,
    config: DeliveryWorkerConfig,
}

impl DeliveryWorker {
    /// Assemble a worker.
    pub fn new(
        ports: DeliveryWorkerPorts,
        retry_policy: RetryPolicy,
        backoff: Arc<dyn BackoffPolicy>,
        config: DeliveryWorkerConfig,
    ) -> Self {
        let DeliveryWorkerPorts {
            repository,
            lookup,
            senders,
            clock,
        } = ports;
        Self {
            repository,
            lookup,
            senders,
            clock,
            retry_policy,
            backoff,
            config,
        }
    }

    /// Handle one raw queue message.
    pub async fn deliver(&self, body: &[u8]) -> Result<DeliveryOutcome, DeliveryError> {
        let envelope = match NotificationEnvelope::decode(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = %err, body_len = body.len(), "dropping malformed delivery");
                return Ok(DeliveryOutcome::Malformed);
            }
        };
        let id = envelope.id();

        let notification = match self.lookup.current(&id).await {
            Ok(notification) => notification,
            Err(NotificationRepositoryError::NotFound { .. }) => {
                info!(notification_id = %id, "notification no longer exists, dropping delivery");
                return Ok(DeliveryOutcome::Missing);
            }
            Err(err) => {
                warn!(notification_id = %id, error = %err, "status check failed");
                return Err(err.into());
            }
        };

        if notification.status.is_absorbing() {
            info!(
                notification_id = %id,
                status = %notification.status,
                "notification already final, skipping redelivery"
            );
            return Ok(DeliveryOutcome::AlreadyFinal(notification.status));
        }

        let Some(sender) = self.senders.get(&notification.channel) else {
            return self.reject_unsupported_channel(&notification).await;
        };

        let attempt = tokio::time::timeout(self.config.send_timeout, sender.send(&notification))
            .await
            .unwrap_or_else(|_| Err(NotificationSendError::timeout(self.config.send_timeout.as_secs())));

        match attempt {
            Ok(()) => self.record_success(&notification).await,
            Err(err) => self.record_failure(&notification, &err).await,
        }
    }

    async fn record_success(
        &self,
        notification: &Notification,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let update = StatusUpdate::new(
            notification.id,
            NotificationStatus::Sent,
            notification.retry_count,
        );
        self.write(&update).await?;
        info!(
            notification_id = %notification.id,
            channel = %notification.channel,
            "notification sent"
        );
        Ok(DeliveryOutcome::Sent)
    }

    async fn record_failure(
        &self,
        notification: &Notification,
        failure: &NotificationSendError,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        match self.retry_policy.after_send_failure(notification.retry_count) {
            RetryDecision::Retry { retry_count } => {
                let delay = TimeDelta::from_std(self.backoff.delay(retry_count))
                    .unwrap_or(TimeDelta::MAX);
                let now = self.clock.utc();
                let scheduled_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
                let update =
                    StatusUpdate::new(notification.id, NotificationStatus::Pending, retry_count)
                        .with_scheduled_at(scheduled_at)
                        .with_last_error(failure.to_string());
                self.write(&update).await?;
                warn!(
                    notification_id = %notification.id,
                    channel = %notification.channel,
                    retry_count,
                    %scheduled_at,
                    error = %failure,
                    "send failed, retry scheduled"
                );
                Ok(DeliveryOutcome::Rescheduled {
                    retry_count,
                    scheduled_at,
                })
            }
            RetryDecision::Exhausted { retry_count } => {
                let update =
                    StatusUpdate::new(notification.id, NotificationStatus::Failed, retry_count)
                        .with_last_error(failure.to_string());
                self.write(&update).await?;
                error!(
                    notification_id = %notification.id,
                    channel = %notification.channel,
                    retry_count,
                    error = %failure,
                    "send failed, retries exhausted"
                );
                Ok(DeliveryOutcome::Exhausted { retry_count })
            }
        }
    }

    async fn reject_unsupported_channel(
        &self,
        notification: &Notification,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let channel = notification.channel.clone();
        error!(
            notification_id = %notification.id,
            %channel,
            "no sender registered for channel, failing notification"
        );
        let update = StatusUpdate::new(
            notification.id,
            NotificationStatus::Failed,
            notification.retry_count,
        )
        .with_last_error(format!("unsupported channel: {channel}"));
        self.write(&update).await?;
        Err(DeliveryError::UnsupportedChannel { channel })
    }

    /// Persist `update` and refresh the cache.
    ///
    /// A row that vanished or became final meanwhile is not an error: the
    /// write is dropped and the delivery still counts as handled.
    async fn write(&self, update: &StatusUpdate) -> Result<(), DeliveryError> {
        match self.repository.update_status(update).await {
            Ok(stored) => {
                self.lookup.refresh(&stored).await;
                Ok(())
            }
            Err(NotificationRepositoryError::NotFound { id }) => {
                info!(notification_id = %id, "notification deleted during delivery");
                Ok(())
            }
            Err(NotificationRepositoryError::TerminalState { id, status }) => {
                info!(notification_id = %id, %status, "notification became final during delivery");
                self.lookup.forget(&id).await;
                Ok(())
            }
            Err(err) => {
                error!(notification_id = %update.id, error = %err, "recording delivery outcome failed");
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for DeliveryWorker {
    async fn handle(&self, body: &[u8]) -> Result<(), MessageHandlerError> {
        match self.deliver(body).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_transient() => Err(MessageHandlerError::transient(err.to_string())),
            // Configuration problems are not fixed by redelivery.
            Err(_) => Ok(()),
        }
    }
}
