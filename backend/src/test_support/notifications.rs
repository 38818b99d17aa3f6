//! In-memory doubles for the notification ports.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, Utc};
use mockable::Clock;
use tokio_util::sync::CancellationToken;

use crate::domain::ports::{
    DelayedQueue, DelayedQueueError, MessageHandler, NotificationCache, NotificationCacheError,
    NotificationRepository, NotificationRepositoryError, NotificationSendError,
    NotificationSender, StatusUpdate,
};
use crate::domain::{Channel, NewNotification, Notification, NotificationId, NotificationStatus};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clock whose time only moves when told to.
pub struct MutableClock(Mutex<DateTime<Utc>>);

impl MutableClock {
    /// Clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    /// Move the clock forward by `delta`.
    ///
    /// # Panics
    ///
    /// Panics if `delta` does not fit in a [`TimeDelta`].
    pub fn advance(&self, delta: Duration) {
        let delta = match TimeDelta::from_std(delta) {
            Ok(delta) => delta,
            Err(error) => panic!("failed to convert Duration to TimeDelta: {error}; delta={delta:?}"),
        };
        *lock(&self.0) += delta;
    }

    /// Move the clock forward by whole seconds; negative values rewind it.
    pub fn advance_seconds(&self, seconds: i64) {
        *lock(&self.0) += TimeDelta::seconds(seconds);
    }
}

impl Clock for MutableClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *lock(&self.0)
    }
}

/// Build a `Pending` notification due at `scheduled_at`.
pub fn pending_notification(
    channel: Channel,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
) -> Notification {
    Notification::new(
        NewNotification {
            id: None,
            payload: b"Your parcel arrives today".to_vec(),
            target: "recipient@example.com".to_owned(),
            channel,
            scheduled_at,
        },
        created_at,
    )
}

/// Store double mirroring the Postgres adapter's semantics.
///
/// Claims, visibility timeouts, the absorbing-status guard, and the
/// keep-schedule rule of [`StatusUpdate`] all behave as in the real store.
/// Time comes from the injected clock.
pub struct InMemoryNotificationRepository {
    clock: Arc<dyn Clock>,
    rows: Mutex<BTreeMap<NotificationId, Notification>>,
    status_updates: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryNotificationRepository {
    /// Empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: Mutex::new(BTreeMap::new()),
            status_updates: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Seed a row as-is, bypassing `create` validation.
    pub fn insert(&self, notification: Notification) {
        lock(&self.rows).insert(notification.id, notification);
    }

    /// Current stored copy of `id`.
    pub fn row(&self, id: &NotificationId) -> Option<Notification> {
        lock(&self.rows).get(id).cloned()
    }

    /// Number of successful `update_status` calls.
    pub fn status_updates(&self) -> usize {
        self.status_updates.load(Ordering::SeqCst)
    }

    /// Make every operation fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), NotificationRepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(NotificationRepositoryError::connection("store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn create(&self, notification: &Notification) -> Result<(), NotificationRepositoryError> {
        self.ensure_available()?;
        let mut rows = lock(&self.rows);
        if rows.contains_key(&notification.id) {
            return Err(NotificationRepositoryError::already_exists(notification.id));
        }
        rows.insert(notification.id, notification.clone());
        Ok(())
    }

    async fn get_by_id(
        &self,
        id: &NotificationId,
    ) -> Result<Notification, NotificationRepositoryError> {
        self.ensure_available()?;
        self.row(id)
            .ok_or_else(|| NotificationRepositoryError::not_found(*id))
    }

    async fn update_status(
        &self,
        update: &StatusUpdate,
    ) -> Result<Notification, NotificationRepositoryError> {
        self.ensure_available()?;
        let mut rows = lock(&self.rows);
        let row = rows
            .get_mut(&update.id)
            .ok_or_else(|| NotificationRepositoryError::not_found(update.id))?;
        if row.status.is_absorbing() {
            return Err(NotificationRepositoryError::terminal_state(update.id, row.status));
        }
        row.status = update.status;
        if let Some(scheduled_at) = update.scheduled_at {
            row.scheduled_at = scheduled_at;
        }
        row.retry_count = update.retry_count;
        row.last_error.clone_from(&update.last_error);
        row.updated_at = self.clock.utc();
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        Ok(row.clone())
    }

    async fn delete_by_id(&self, id: &NotificationId) -> Result<(), NotificationRepositoryError> {
        self.ensure_available()?;
        lock(&self.rows).remove(id);
        Ok(())
    }

    async fn claim_ready(
        &self,
        limit: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<Notification>, NotificationRepositoryError> {
        self.ensure_available()?;
        let now = self.clock.utc();
        let stale_before = TimeDelta::from_std(visibility_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut rows = lock(&self.rows);

        let mut due: Vec<&mut Notification> = rows
            .values_mut()
            .filter(|row| match row.status {
                NotificationStatus::Pending => row.scheduled_at <= now,
                NotificationStatus::InProcess => row.updated_at <= stale_before,
                _ => false,
            })
            .collect();
        due.sort_by_key(|row| (row.scheduled_at, row.id));

        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|row| {
                row.status = NotificationStatus::InProcess;
                row.updated_at = now;
                row.clone()
            })
            .collect())
    }

    async fn list(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Notification>, NotificationRepositoryError> {
        self.ensure_available()?;
        let mut rows: Vec<Notification> = lock(&self.rows).values().cloned().collect();
        rows.sort_by_key(|row| (row.scheduled_at, row.id));
        Ok(rows
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect())
    }
}

/// Cache double backed by a map; entries never expire.
#[derive(Default)]
pub struct InMemoryNotificationCache {
    entries: Mutex<BTreeMap<NotificationId, Notification>>,
}

impl InMemoryNotificationCache {
    /// Cached copy of `id`, if any.
    pub fn entry(&self, id: &NotificationId) -> Option<Notification> {
        lock(&self.entries).get(id).cloned()
    }
}

#[async_trait]
impl NotificationCache for InMemoryNotificationCache {
    async fn get(&self, id: &NotificationId) -> Result<Option<Notification>, NotificationCacheError> {
        Ok(self.entry(id))
    }

    async fn put(&self, notification: &Notification) -> Result<(), NotificationCacheError> {
        lock(&self.entries).insert(notification.id, notification.clone());
        Ok(())
    }

    async fn invalidate(&self, id: &NotificationId) -> Result<(), NotificationCacheError> {
        lock(&self.entries).remove(id);
        Ok(())
    }
}

/// Sender replaying scripted results and recording what it was asked to send.
///
/// Once the script runs out every further send succeeds.
#[derive(Default)]
pub struct ScriptedSender {
    script: Mutex<VecDeque<Result<(), NotificationSendError>>>,
    sent: Mutex<Vec<NotificationId>>,
    latency: Option<Duration>,
}

impl ScriptedSender {
    /// Sender answering with `script` in order, then succeeding.
    pub fn new(script: Vec<Result<(), NotificationSendError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Sleep for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Identifiers passed to `send`, in call order.
    pub fn sent(&self) -> Vec<NotificationId> {
        lock(&self.sent).clone()
    }

    /// Number of `send` calls so far, including failed ones.
    pub fn calls(&self) -> usize {
        lock(&self.sent).len()
    }
}

#[async_trait]
impl NotificationSender for ScriptedSender {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationSendError> {
        lock(&self.sent).push(notification.id);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        lock(&self.script).pop_front().unwrap_or(Ok(()))
    }
}

/// Queue double recording publishes; consuming just waits for shutdown.
#[derive(Default)]
pub struct RecordingQueue {
    published: Mutex<Vec<(NotificationId, Duration)>>,
    rejected: Mutex<BTreeSet<NotificationId>>,
}

impl RecordingQueue {
    /// Queue accepting every publish.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publishes of `id` fail.
    pub fn reject(&self, id: NotificationId) {
        lock(&self.rejected).insert(id);
    }

    /// Successful publishes with their delays, in call order.
    pub fn published(&self) -> Vec<(NotificationId, Duration)> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl DelayedQueue for RecordingQueue {
    async fn declare(&self) -> Result<(), DelayedQueueError> {
        Ok(())
    }

    async fn publish(
        &self,
        notification: &Notification,
        delay: Duration,
    ) -> Result<(), DelayedQueueError> {
        if lock(&self.rejected).contains(&notification.id) {
            return Err(DelayedQueueError::unavailable("broker connection lost"));
        }
        lock(&self.published).push((notification.id, delay));
        Ok(())
    }

    async fn consume(
        &self,
        _handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), DelayedQueueError> {
        shutdown.cancelled().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), DelayedQueueError> {
        Ok(())
    }
}
