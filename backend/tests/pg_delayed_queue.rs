//! Integration tests for `PgDelayedQueue` against PostgreSQL.
//!
//! The suite needs a disposable database named by
//! `NOTIFIER_TEST_DATABASE_URL`; every test is skipped when it is unset.
//! Tests truncate the `notification_queue` table, so they run one at a time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use notifier::domain::ports::{DelayedQueue, MessageHandler, MessageHandlerError};
use notifier::domain::{Channel, Notification, NotificationEnvelope, NotificationId};
use notifier::outbound::queue::{PgDelayedQueue, PgQueueConfig};
use notifier::test_support::notifications::pending_notification;
use rstest::rstest;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::MutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DATABASE_URL_VAR: &str = "NOTIFIER_TEST_DATABASE_URL";

static DATABASE: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

struct TestContext {
    pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

impl TestContext {
    async fn queue(&self, config: PgQueueConfig) -> PgDelayedQueue {
        let queue = PgDelayedQueue::new(self.pool.clone(), config);
        queue.declare().await.expect("declare");
        queue
    }

    /// `(delivery_count, lease released)` per queued row, oldest first.
    async fn rows(&self) -> Vec<(i32, bool)> {
        sqlx::query(
            "SELECT delivery_count, leased_until IS NULL AS released \
             FROM notification_queue ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .expect("select queue rows")
        .into_iter()
        .map(|row| {
            (
                row.try_get("delivery_count").expect("delivery_count"),
                row.try_get("released").expect("released"),
            )
        })
        .collect()
    }
}

/// Declare and empty the queue table, or `None` when no database is configured.
async fn context() -> Option<TestContext> {
    let Ok(url) = std::env::var(DATABASE_URL_VAR) else {
        eprintln!("{DATABASE_URL_VAR} not set; skipping");
        return None;
    };
    let guard = DATABASE.lock().await;

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("connect");
    PgDelayedQueue::new(pool.clone(), PgQueueConfig::default())
        .declare()
        .await
        .expect("declare");
    sqlx::query("TRUNCATE notification_queue")
        .execute(&pool)
        .await
        .expect("truncate");

    Some(TestContext {
        pool,
        _guard: guard,
    })
}

fn fast_config() -> PgQueueConfig {
    PgQueueConfig {
        workers: 1,
        prefetch: 1,
        poll_interval: Duration::from_millis(20),
        lease: Duration::from_secs(30),
        redelivery_delay: Duration::from_millis(300),
    }
}

fn notification() -> Notification {
    let now = Utc::now();
    pending_notification(Channel::email(), now, now)
}

#[derive(Debug, Clone, Copy)]
enum Reply {
    Ack,
    Fail,
    Stall(Duration),
    StopConsumer,
}

/// Handler answering from a script and recording every delivery.
///
/// Once the script runs out every delivery is acknowledged.
struct ScriptedHandler {
    script: Mutex<VecDeque<Reply>>,
    deliveries: Mutex<Vec<(NotificationId, Instant)>>,
    shutdown: CancellationToken,
}

impl ScriptedHandler {
    fn new(script: Vec<Reply>, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            deliveries: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    fn deliveries(&self) -> Vec<(NotificationId, Instant)> {
        self.deliveries.lock().expect("deliveries lock").clone()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, body: &[u8]) -> Result<(), MessageHandlerError> {
        let id = NotificationEnvelope::decode(body)
            .map_err(|err| MessageHandlerError::transient(err.to_string()))?
            .id();
        self.deliveries
            .lock()
            .expect("deliveries lock")
            .push((id, Instant::now()));
        let reply = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Reply::Ack);

        match reply {
            Reply::Ack => Ok(()),
            Reply::Fail => Err(MessageHandlerError::transient("store offline")),
            Reply::Stall(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Reply::StopConsumer => {
                self.shutdown.cancel();
                Ok(())
            }
        }
    }
}

fn start_consumer(
    queue: &PgDelayedQueue,
    handler: Arc<ScriptedHandler>,
) -> JoinHandle<()> {
    let queue = queue.clone();
    let shutdown = handler.shutdown.clone();
    tokio::spawn(async move {
        queue.consume(handler, shutdown).await.expect("consume");
    })
}

/// Wait up to five seconds for `count` deliveries.
async fn wait_for_deliveries(handler: &ScriptedHandler, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handler.deliveries().len() < count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("deliveries not seen in time");
}

/// Wait up to five seconds for the queue table to empty.
async fn wait_until_drained(ctx: &TestContext) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !ctx.rows().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queue not drained in time");
}

async fn stop(handler: &ScriptedHandler, consumer: JoinHandle<()>) {
    handler.shutdown.cancel();
    consumer.await.expect("consumer joins");
}

#[rstest]
#[tokio::test]
async fn delayed_message_stays_hidden_until_due() {
    let Some(ctx) = context().await else { return };
    let queue = ctx.queue(fast_config()).await;
    let handler = ScriptedHandler::new(vec![], CancellationToken::new());
    let consumer = start_consumer(&queue, handler.clone());
    let message = notification();

    let published_at = Instant::now();
    queue
        .publish(&message, Duration::from_millis(700))
        .await
        .expect("publish");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(handler.deliveries().is_empty(), "delivered before its delay");

    wait_for_deliveries(&handler, 1).await;
    stop(&handler, consumer).await;

    let deliveries = handler.deliveries();
    assert_eq!(deliveries[0].0, message.id);
    assert!(deliveries[0].1.duration_since(published_at) >= Duration::from_millis(650));
}

#[rstest]
#[tokio::test]
async fn acknowledged_messages_are_deleted() {
    let Some(ctx) = context().await else { return };
    let queue = ctx.queue(fast_config()).await;
    let handler = ScriptedHandler::new(vec![], CancellationToken::new());
    for _ in 0..2 {
        queue
            .publish(&notification(), Duration::ZERO)
            .await
            .expect("publish");
    }
    assert_eq!(ctx.rows().await.len(), 2);

    let consumer = start_consumer(&queue, handler.clone());
    wait_until_drained(&ctx).await;
    stop(&handler, consumer).await;

    assert_eq!(handler.deliveries().len(), 2);
}

#[rstest]
#[tokio::test]
async fn failed_handling_is_redelivered_after_delay() {
    let Some(ctx) = context().await else { return };
    let queue = ctx.queue(fast_config()).await;
    let handler = ScriptedHandler::new(vec![Reply::Fail], CancellationToken::new());
    let message = notification();
    queue.publish(&message, Duration::ZERO).await.expect("publish");

    let consumer = start_consumer(&queue, handler.clone());
    wait_for_deliveries(&handler, 2).await;
    wait_until_drained(&ctx).await;
    stop(&handler, consumer).await;

    let deliveries = handler.deliveries();
    assert!(deliveries.iter().all(|(id, _)| *id == message.id));
    let gap = deliveries[1].1.duration_since(deliveries[0].1);
    assert!(gap >= Duration::from_millis(250), "redelivered after {gap:?}");
}

#[rstest]
#[tokio::test]
async fn expired_lease_is_redelivered_to_another_worker() {
    let Some(ctx) = context().await else { return };
    let queue = ctx
        .queue(PgQueueConfig {
            workers: 2,
            lease: Duration::from_millis(200),
            ..fast_config()
        })
        .await;
    // The first worker holds the message well past its lease.
    let handler = ScriptedHandler::new(
        vec![Reply::Stall(Duration::from_millis(800))],
        CancellationToken::new(),
    );
    let message = notification();
    queue.publish(&message, Duration::ZERO).await.expect("publish");

    let consumer = start_consumer(&queue, handler.clone());
    wait_for_deliveries(&handler, 2).await;
    stop(&handler, consumer).await;

    let deliveries = handler.deliveries();
    assert!(deliveries.iter().all(|(id, _)| *id == message.id));
    assert!(deliveries[1].1.duration_since(deliveries[0].1) >= Duration::from_millis(150));
    // Both workers acknowledged; the later delete finds nothing left.
    assert!(ctx.rows().await.is_empty());
}

#[rstest]
#[tokio::test]
async fn shutdown_releases_prefetched_messages() {
    let Some(ctx) = context().await else { return };
    let queue = ctx
        .queue(PgQueueConfig {
            prefetch: 3,
            ..fast_config()
        })
        .await;
    for _ in 0..3 {
        queue
            .publish(&notification(), Duration::ZERO)
            .await
            .expect("publish");
    }

    // Shutdown is requested while the first of three leased messages runs.
    let shutdown = CancellationToken::new();
    let handler = ScriptedHandler::new(vec![Reply::StopConsumer], shutdown.clone());
    queue
        .consume(handler.clone(), shutdown)
        .await
        .expect("consume drains");

    assert_eq!(handler.deliveries().len(), 1);
    assert_eq!(ctx.rows().await, vec![(0, true), (0, true)]);

    let again = ScriptedHandler::new(vec![], CancellationToken::new());
    let consumer = start_consumer(&queue, again.clone());
    wait_until_drained(&ctx).await;
    stop(&again, consumer).await;
    assert_eq!(again.deliveries().len(), 2);
}

#[rstest]
#[tokio::test]
async fn closed_queue_rejects_publish() {
    let Some(ctx) = context().await else { return };
    let queue = ctx.queue(fast_config()).await;

    queue.close().await.expect("close");
    let err = queue
        .publish(&notification(), Duration::ZERO)
        .await
        .expect_err("closed");

    assert_eq!(err.to_string(), "delayed queue is closed");
}
