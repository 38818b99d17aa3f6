//! Claim-and-dispatch loop moving due notifications onto the delayed queue.
//!
//! Each tick claims one batch from the store and publishes every claimed row
//! with a delay equal to the time left until it is due. Claiming relies on the
//! store's skip-locked statement, so any number of schedulers may run against
//! the same database.

use std::sync::Arc;
use std::time::Duration;

use mockable::Clock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::ports::{DelayedQueue, NotificationRepository, StatusUpdate};
use crate::domain::{Notification, NotificationStatus, RetryDecision, RetryPolicy};

/// Shortest interval between ticks; smaller values are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Scheduler polling and claim settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Interval between ticks, at least [`MIN_POLL_INTERVAL`].
    pub poll_interval: Duration,
    /// Maximum rows claimed per tick.
    pub batch_size: u32,
    /// How long a row may stay `InProcess` before it is reclaimed.
    pub visibility_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// Counters describing one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Rows claimed from the store.
    pub claimed: usize,
    /// Rows handed to the delayed queue.
    pub published: usize,
    /// Rows returned to `Pending` after a publish failure.
    pub requeued: usize,
    /// Rows marked `Failed` after a publish failure.
    pub failed: usize,
    /// Store writes that failed while reconciling publish failures.
    pub reconcile_errors: usize,
    /// The claim itself failed and the tick did nothing.
    pub claim_failed: bool,
}

/// Polls the store and publishes due notifications.
pub struct Scheduler {
    repository: Arc<dyn NotificationRepository>,
    queue: Arc<dyn DelayedQueue>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Assemble a scheduler from its ports.
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        queue: Arc<dyn DelayedQueue>,
        clock: Arc<dyn Clock>,
        retry_policy: RetryPolicy,
        mut config: SchedulerConfig,
    ) -> Self {
        config.poll_interval = config.poll_interval.max(MIN_POLL_INTERVAL);
        Self {
            repository,
            queue,
            clock,
            retry_policy,
            config,
        }
    }

    /// Tick until `shutdown` is cancelled.
    ///
    /// The first tick runs immediately. A tick always runs to completion;
    /// cancellation is only observed between ticks, and a slow tick delays
    /// the next one instead of overlapping it.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.claimed > 0 {
                        info!(
                            claimed = report.claimed,
                            published = report.published,
                            requeued = report.requeued,
                            failed = report.failed,
                            "scheduler tick processed batch"
                        );
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    /// Claim one batch and publish it.
    ///
    /// Claim failures skip the tick. A failure on one row never stops the
    /// rest of the batch.
    pub async fn tick(&self) -> TickReport {
        let claimed = match self
            .repository
            .claim_ready(self.config.batch_size, self.config.visibility_timeout)
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(error = %err, "claiming due notifications failed, skipping tick");
                return TickReport {
                    claim_failed: true,
                    ..TickReport::default()
                };
            }
        };

        let mut report = TickReport {
            claimed: claimed.len(),
            ..TickReport::default()
        };
        for notification in &claimed {
            self.dispatch(notification, &mut report).await;
        }
        report
    }

    async fn dispatch(&self, notification: &Notification, report: &mut TickReport) {
        let delay = (notification.scheduled_at - self.clock.utc())
            .to_std()
            .unwrap_or(Duration::ZERO);

        match self.queue.publish(notification, delay).await {
            Ok(()) => {
                debug!(
                    notification_id = %notification.id,
                    delay_ms = delay.as_millis(),
                    "notification published"
                );
                report.published += 1;
            }
            Err(err) => {
                warn!(notification_id = %notification.id, error = %err, "publish failed");
                self.reconcile_publish_failure(notification, &err.to_string(), report)
                    .await;
            }
        }
    }

    async fn reconcile_publish_failure(
        &self,
        notification: &Notification,
        message: &str,
        report: &mut TickReport,
    ) {
        let decision = self.retry_policy.after_publish_failure(notification.retry_count);
        let status = match decision {
            RetryDecision::Retry { .. } => NotificationStatus::Pending,
            RetryDecision::Exhausted { .. } => NotificationStatus::Failed,
        };
        let update = StatusUpdate::new(notification.id, status, decision.retry_count())
            .with_last_error(message);

        match self.repository.update_status(&update).await {
            Ok(_) if status == NotificationStatus::Failed => {
                warn!(
                    notification_id = %notification.id,
                    retry_count = decision.retry_count(),
                    "publish retries exhausted, notification failed"
                );
                report.failed += 1;
            }
            Ok(_) => report.requeued += 1,
            Err(err) => {
                error!(
                    notification_id = %notification.id,
                    error = %err,
                    "recording publish failure failed"
                );
                report.reconcile_errors += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests;
