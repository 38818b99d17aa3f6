//! Notifier entry-point: wires the store, cache, queue, and senders, then runs
//! the delivery pipeline until a shutdown signal arrives.

use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use mockable::{Clock, DefaultClock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use notifier::config::QueueBackend;
use notifier::domain::ports::{
    DelayedQueue, NoOpNotificationCache, NotificationCache, NotificationRepository,
};
use notifier::domain::{
    DeliveryWorker, DeliveryWorkerPorts, NotificationLookup, Scheduler,
};
use notifier::outbound::cache::RedisNotificationCache;
use notifier::outbound::persistence::{DbPool, DieselNotificationRepository, run_migrations};
use notifier::outbound::queue::{InMemoryDelayedQueue, PgDelayedQueue};
use notifier::outbound::senders::build_registry;
use notifier::{DeliveryPipeline, NotifierSettings, Role};

/// Command-line arguments. Service settings come from `NOTIFIER_*` variables
/// and configuration files.
#[derive(Debug, Parser)]
#[command(name = "notifier", about = "Delayed notification delivery service")]
struct Cli {
    /// Pipeline halves to run in this process.
    #[arg(long, value_enum, default_value_t = Role::All)]
    role: Role,
}

/// Application bootstrap.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    if let Err(e) = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .try_init()
    {
        warn!(error = %e, "tracing init failed");
    }

    let cli = Cli::parse();
    let settings = NotifierSettings::load()?;
    info!(role = ?cli.role, settings = ?settings, "notifier starting");

    let database_url = settings.database_url()?.to_owned();
    run_migrations(&database_url).await?;

    let pool = DbPool::new(settings.pool_config()?)
        .await
        .wrap_err("failed to build database pool")?;
    let repository: Arc<dyn NotificationRepository> =
        Arc::new(DieselNotificationRepository::new(pool));
    let clock: Arc<dyn Clock> = Arc::new(DefaultClock);

    let queue = build_queue(&settings, &database_url, cli.role).await?;
    queue.declare().await.wrap_err("failed to declare delayed queue")?;

    let mut pipeline = DeliveryPipeline::new(Arc::clone(&queue));
    if cli.role.runs_scheduler() {
        pipeline = pipeline.with_scheduler(Scheduler::new(
            Arc::clone(&repository),
            Arc::clone(&queue),
            Arc::clone(&clock),
            settings.retry_policy(),
            settings.scheduler_config(),
        ));
    }
    if cli.role.runs_consumer() {
        let senders = build_registry(settings.email_sender_config(), settings.telegram_token())?;
        if senders.is_empty() {
            warn!("no channel senders configured; every delivery will be marked failed");
        }
        let cache = build_cache(&settings).await?;
        let ports = DeliveryWorkerPorts {
            lookup: NotificationLookup::new(Arc::clone(&repository), cache),
            repository: Arc::clone(&repository),
            senders,
            clock: Arc::clone(&clock),
        };
        pipeline = pipeline.with_worker(DeliveryWorker::new(
            ports,
            settings.retry_policy(),
            settings.backoff(),
            settings.delivery_worker_config(),
        ));
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let outcome = pipeline.run(shutdown).await;
    queue.close().await.wrap_err("failed to close delayed queue")?;
    outcome.wrap_err("delivery pipeline failed")?;
    info!("notifier stopped");
    Ok(())
}

async fn build_queue(
    settings: &NotifierSettings,
    database_url: &str,
    role: Role,
) -> Result<Arc<dyn DelayedQueue>> {
    let queue: Arc<dyn DelayedQueue> = match settings.queue_backend()? {
        QueueBackend::Postgres => Arc::new(
            PgDelayedQueue::connect(database_url, settings.pg_queue_config())
                .await
                .wrap_err("failed to connect delayed queue")?,
        ),
        QueueBackend::Memory => {
            if role != Role::All {
                warn!(?role, "in-memory queue is process-local; run both halves together");
            }
            Arc::new(InMemoryDelayedQueue::new(settings.in_memory_queue_config()))
        }
    };
    Ok(queue)
}

async fn build_cache(settings: &NotifierSettings) -> Result<Arc<dyn NotificationCache>> {
    let Some(url) = settings.redis_url() else {
        info!("no redis url configured; notification cache disabled");
        return Ok(Arc::new(NoOpNotificationCache));
    };
    let cache = RedisNotificationCache::connect(url, settings.cache_ttl())
        .await
        .wrap_err("failed to connect notification cache")?;
    Ok(Arc::new(cache))
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "ctrl-c handler failed");
            }
        }
        () = terminate => {}
    }
    info!("shutdown requested; draining");
    shutdown.cancel();
}
