//! In-process delayed queue built on tokio timers and channels.
//!
//! Suitable for single-process deployments and tests. Messages live only in
//! memory: anything not yet delivered is lost when the process exits, and the
//! Scheduler's visibility timeout recovers the affected rows.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::ports::{DelayedQueue, DelayedQueueError, MessageHandler};
use crate::domain::{Notification, NotificationEnvelope};

/// Tuning for [`InMemoryDelayedQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InMemoryQueueConfig {
    /// Consumer worker tasks.
    pub workers: usize,
    /// Delay before a message whose handler failed is delivered again.
    pub redelivery_delay: Duration,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            redelivery_delay: Duration::from_secs(5),
        }
    }
}

/// [`DelayedQueue`] held entirely in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryDelayedQueue {
    config: InMemoryQueueConfig,
    ready_tx: mpsc::UnboundedSender<Vec<u8>>,
    ready_rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    timers: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Default for InMemoryDelayedQueue {
    fn default() -> Self {
        Self::new(InMemoryQueueConfig::default())
    }
}

impl InMemoryDelayedQueue {
    /// Create an empty queue.
    pub fn new(config: InMemoryQueueConfig) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            config,
            ready_tx,
            ready_rx: Arc::new(Mutex::new(ready_rx)),
            timers: CancellationToken::new(),
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

    /// Make `body` ready after `delay`. Timers die with [`DelayedQueue::close`].
    fn schedule(&self, body: Vec<u8>, delay: Duration) {
        if delay.is_zero() {
            // A send only fails once every receiver is gone, which the queue
            // itself prevents.
            let _ = self.ready_tx.send(body);
            return;
        }
        let ready_tx = self.ready_tx.clone();
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = timers.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = ready_tx.send(body);
                }
            }
        });
    }

    async fn run_worker(
        self,
        worker: usize,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => None,
                body = async { self.ready_rx.lock().await.recv().await } => body,
            };
            let Some(body) = next else {
                break;
            };
            if let Err(err) = handler.handle(&body).await {
                warn!(worker, error = %err, "handler failed; requeueing");
                self.schedule(body, self.config.redelivery_delay);
            }
        }
        debug!(worker, "queue worker stopped");
    }
}

#[async_trait]
impl DelayedQueue for InMemoryDelayedQueue {
    async fn declare(&self) -> Result<(), DelayedQueueError> {
        self.ensure_open()
    }

    async fn publish(
        &self,
        notification: &Notification,
        delay: Duration,
    ) -> Result<(), DelayedQueueError> {
        self.ensure_open()?;
        let body = NotificationEnvelope::encode(notification)
            .map_err(|err| DelayedQueueError::encoding(err.to_string()))?;
        self.schedule(body, delay);
        Ok(())
    }

    async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), DelayedQueueError> {
        self.ensure_open()?;
        let workers = self.config.workers.max(1);
        info!(workers, "in-memory queue consumer starting");

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
        Ok(())
    }

    async fn close(&self) -> Result<(), DelayedQueueError> {
        self.closed.store(true, Ordering::Release);
        self.timers.cancel();
        Ok(())
    }
}
