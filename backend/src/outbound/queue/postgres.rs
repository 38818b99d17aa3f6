//! Delayed queue stored in a Postgres table and driven through SQLx.
//!
//! Messages are rows in `notification_queue`. A row is deliverable once
//! `visible_at` has passed and it holds no live lease. Fetching leases rows
//! with `FOR UPDATE SKIP LOCKED`, so any number of consumers can poll the
//! same table. An expired lease makes the row deliverable again, which covers
//! consumers that crash mid-delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::ports::{
    DelayedQueue, DelayedQueueError, MessageHandler, NOTIFICATION_ROUTING_KEY,
};
use crate::domain::{Notification, NotificationEnvelope};

const CREATE_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS notification_queue (
    id BIGSERIAL PRIMARY KEY,
    routing_key TEXT NOT NULL,
    body BYTEA NOT NULL,
    visible_at TIMESTAMPTZ NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 0,
    leased_until TIMESTAMPTZ,
    enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
";

const CREATE_INDEX_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_notification_queue_visible
    ON notification_queue (routing_key, visible_at)
";

const PUBLISH_SQL: &str = r"
INSERT INTO notification_queue (routing_key, body, visible_at)
VALUES ($1, $2, NOW() + ($3::double precision * INTERVAL '1 millisecond'))
";

const FETCH_SQL: &str = r"
UPDATE notification_queue AS q
SET leased_until = NOW() + ($3::double precision * INTERVAL '1 millisecond'),
    delivery_count = q.delivery_count + 1
FROM (
    SELECT id
    FROM notification_queue
    WHERE routing_key = $1
      AND visible_at <= NOW()
      AND (leased_until IS NULL OR leased_until <= NOW())
    ORDER BY visible_at, id
    LIMIT $2
    FOR UPDATE SKIP LOCKED
) AS due
WHERE q.id = due.id
RETURNING q.id, q.body, q.delivery_count
";

const ACK_SQL: &str = "DELETE FROM notification_queue WHERE id = $1";

const REQUEUE_SQL: &str = r"
UPDATE notification_queue
SET leased_until = NULL,
    visible_at = NOW() + ($2::double precision * INTERVAL '1 millisecond')
WHERE id = $1
";

const RELEASE_SQL: &str = r"
UPDATE notification_queue
SET leased_until = NULL,
    delivery_count = GREATEST(delivery_count - 1, 0)
WHERE id = ANY($1)
";

/// Tuning for [`PgDelayedQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgQueueConfig {
    /// Consumer worker tasks.
    pub workers: usize,
    /// Messages one worker leases per fetch.
    pub prefetch: u32,
    /// Sleep between empty fetches.
    pub poll_interval: Duration,
    /// Lease length; an unacknowledged message reappears after this.
    pub lease: Duration,
    /// Delay before a message whose handler failed is delivered again.
    pub redelivery_delay: Duration,
}

impl Default for PgQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            prefetch: 10,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(300),
            redelivery_delay: Duration::from_secs(5),
        }
    }
}

/// One leased message.
#[derive(Debug)]
struct Delivery {
    id: i64,
    body: Vec<u8>,
    delivery_count: i32,
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn unavailable(err: sqlx::Error) -> DelayedQueueError {
    debug!(error = %err, "notification queue statement failed");
    DelayedQueueError::unavailable(err.to_string())
}

/// [`DelayedQueue`] over a Postgres table.
#[derive(Debug, Clone)]
pub struct PgDelayedQueue {
    pool: PgPool,
    config: PgQueueConfig,
    closed: Arc<AtomicBool>,
}

impl PgDelayedQueue {
    /// Connect a dedicated pool sized for the worker count.
    ///
    /// # Errors
    ///
    /// Returns [`DelayedQueueError::Unavailable`] when Postgres is unreachable.
    pub async fn connect(database_url: &str, config: PgQueueConfig) -> Result<Self, DelayedQueueError> {
        let max_connections = u32::try_from(config.workers)
            .unwrap_or(u32::MAX)
            .saturating_add(2);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(unavailable)?;
        Ok(Self::new(pool, config))
    }

    /// Wrap an existing pool.
    pub fn new(pool: PgPool, config: PgQueueConfig) -> Self {
        Self {
            pool,
            config,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> Result<(), DelayedQueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(DelayedQueueError::closed())
        } else {
            Ok(())
        }
    }

    async fn fetch(&self) -> Result<Vec<Delivery>, DelayedQueueError> {
        let rows = sqlx::query(FETCH_SQL)
            .bind(NOTIFICATION_ROUTING_KEY)
            .bind(i64::from(self.config.prefetch.max(1)))
            .bind(millis(self.config.lease))
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        let mut deliveries = rows
            .into_iter()
            .map(|row| {
                Ok(Delivery {
                    id: row.try_get("id")?,
                    body: row.try_get("body")?,
                    delivery_count: row.try_get("delivery_count")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(unavailable)?;
        // RETURNING gives no ordering guarantee.
        deliveries.sort_by_key(|delivery| delivery.id);
        Ok(deliveries)
    }

    async fn ack(&self, id: i64) -> Result<(), DelayedQueueError> {
        sqlx::query(ACK_SQL)
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(unavailable)
    }

    async fn requeue(&self, id: i64) -> Result<(), DelayedQueueError> {
        sqlx::query(REQUEUE_SQL)
            .bind(id)
            .bind(millis(self.config.redelivery_delay))
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(unavailable)
    }

    async fn release(&self, ids: &[i64]) -> Result<(), DelayedQueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(RELEASE_SQL)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(unavailable)
    }

    async fn run_worker(
        self,
        worker: usize,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) {
        debug!(worker, "queue worker started");
        while !shutdown.is_cancelled() {
            let batch = match self.fetch().await {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(worker, error = %err, "queue fetch failed");
                    self.idle(&shutdown).await;
                    continue;
                }
            };
            if batch.is_empty() {
                self.idle(&shutdown).await;
                continue;
            }

            let mut pending = batch.into_iter();
            while let Some(delivery) = pending.next() {
                if shutdown.is_cancelled() {
                    let unstarted: Vec<i64> = std::iter::once(delivery.id)
                        .chain(pending.by_ref().map(|d| d.id))
                        .collect();
                    if let Err(err) = self.release(&unstarted).await {
                        warn!(worker, error = %err, "failed to release prefetched messages");
                    }
                    break;
                }
                self.dispatch(worker, handler.as_ref(), delivery).await;
            }
        }
        debug!(worker, "queue worker stopped");
    }

    async fn dispatch(&self, worker: usize, handler: &dyn MessageHandler, delivery: Delivery) {
        let Delivery {
            id,
            body,
            delivery_count,
        } = delivery;
        let settled = match handler.handle(&body).await {
            Ok(()) => self.ack(id).await,
            Err(err) => {
                warn!(worker, message_id = id, delivery_count, error = %err, "handler failed; requeueing");
                self.requeue(id).await
            }
        };
        if let Err(err) = settled {
            // The lease expires and the message is delivered again.
            warn!(worker, message_id = id, error = %err, "failed to settle message");
        }
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {}
            () = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }
}

#[async_trait]
impl DelayedQueue for PgDelayedQueue {
    async fn declare(&self) -> Result<(), DelayedQueueError> {
        self.ensure_open()?;
        sqlx::query(CREATE_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        sqlx::query(CREATE_INDEX_SQL)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        info!(routing_key = NOTIFICATION_ROUTING_KEY, "notification queue declared");
        Ok(())
    }

    async fn publish(
        &self,
        notification: &Notification,
        delay: Duration,
    ) -> Result<(), DelayedQueueError> {
        self.ensure_open()?;
        let body = NotificationEnvelope::encode(notification)
            .map_err(|err| DelayedQueueError::encoding(err.to_string()))?;
        sqlx::query(PUBLISH_SQL)
            .bind(NOTIFICATION_ROUTING_KEY)
            .bind(body)
            .bind(millis(delay))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        debug!(
            notification_id = %notification.id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "notification enqueued"
        );
        Ok(())
    }

    async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), DelayedQueueError> {
        self.ensure_open()?;
        let workers = self.config.workers.max(1);
        info!(workers, prefetch = self.config.prefetch, "queue consumer starting");

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            tasks.spawn(
                self.clone()
                    .run_worker(worker, Arc::clone(&handler), shutdown.clone()),
            );
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "queue worker task ended abnormally");
            }
        }

        info!("queue consumer drained");
        Ok(())
    }

    async fn close(&self) -> Result<(), DelayedQueueError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.pool.close().await;
            info!("notification queue closed");
        }
        Ok(())
    }
}
