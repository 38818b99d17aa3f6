//! Runs the Scheduler loop and the Consumer pool under one shutdown token.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domain::ports::{DelayedQueue, DelayedQueueError, MessageHandler};
use crate::domain::{DeliveryWorker, Scheduler};

/// Which halves of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Role {
    /// Scheduler and consumer together.
    #[default]
    All,
    /// Claim and publish only.
    Scheduler,
    /// Consume and deliver only.
    Consumer,
}

impl Role {
    /// True when the scheduler loop should run.
    pub const fn runs_scheduler(self) -> bool {
        matches!(self, Self::All | Self::Scheduler)
    }

    /// True when the consumer pool should run.
    pub const fn runs_consumer(self) -> bool {
        matches!(self, Self::All | Self::Consumer)
    }
}

/// Scheduler and consumer wired to the same delayed queue.
pub struct DeliveryPipeline {
    queue: Arc<dyn DelayedQueue>,
    scheduler: Option<Scheduler>,
    worker: Option<Arc<DeliveryWorker>>,
}

impl DeliveryPipeline {
    /// A pipeline that runs nothing until halves are added.
    pub fn new(queue: Arc<dyn DelayedQueue>) -> Self {
        Self {
            queue,
            scheduler: None,
            worker: None,
        }
    }

    /// Run `scheduler` as the producing half.
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Feed queue deliveries to `worker`.
    pub fn with_worker(mut self, worker: DeliveryWorker) -> Self {
        self.worker = Some(Arc::new(worker));
        self
    }

    /// Run every configured half until `shutdown` is cancelled.
    ///
    /// The scheduler stops between ticks and the consumer drains in-flight
    /// deliveries before this returns. A consumer failure cancels `shutdown`
    /// so the scheduler stops too.
    ///
    /// # Errors
    ///
    /// Returns the consumer's [`DelayedQueueError`], if any.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DelayedQueueError> {
        info!(
            scheduler = self.scheduler.is_some(),
            consumer = self.worker.is_some(),
            "delivery pipeline starting"
        );

        let produce = async {
            if let Some(scheduler) = &self.scheduler {
                scheduler.run(shutdown.clone()).await;
            }
        };
        let consume = async {
            let Some(worker) = &self.worker else {
                return Ok(());
            };
            let handler: Arc<dyn MessageHandler> = Arc::clone(worker) as Arc<dyn MessageHandler>;
            let result = self.queue.consume(handler, shutdown.clone()).await;
            if let Err(err) = &result {
                error!(error = %err, "consumer stopped unexpectedly; shutting down");
                shutdown.cancel();
            }
            result
        };

        let ((), consumed) = tokio::join!(produce, consume);
        info!("delivery pipeline stopped");
        consumed
    }
}
