//! Cache-assisted reads of notification state.
//!
//! The cache is consulted before the store, but only a final status is
//! trusted from it. Cache failures are logged and otherwise ignored; only
//! the store decides.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::ports::{NotificationCache, NotificationRepository, NotificationRepositoryError};
use crate::domain::{Notification, NotificationId};

/// Read-through access to notifications shared by the service and the worker.
#[derive(Clone)]
pub struct NotificationLookup {
    repository: Arc<dyn NotificationRepository>,
    cache: Arc<dyn NotificationCache>,
}

impl NotificationLookup {
    /// Combine the authoritative store with a cache.
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        cache: Arc<dyn NotificationCache>,
    ) -> Self {
        Self { repository, cache }
    }

    /// Return the state a reader or a delivery decision can rely on.
    ///
    /// A cached `Sent` or `Canceled` copy is final because those statuses
    /// never change. Any other cached status may be stale, so the store is
    /// read and the cache refreshed. Rows moved by the scheduler are
    /// therefore never reported from a stale copy.
    pub async fn current(
        &self,
        id: &NotificationId,
    ) -> Result<Notification, NotificationRepositoryError> {
        if let Some(cached) = self.cached(id).await {
            if cached.status.is_absorbing() {
                return Ok(cached);
            }
            debug!(notification_id = %id, status = %cached.status, "cached status not final, reading store");
        }
        self.stored(id).await
    }

    /// Store `notification` in the cache, logging failures.
    pub async fn refresh(&self, notification: &Notification) {
        if let Err(err) = self.cache.put(notification).await {
            warn!(notification_id = %notification.id, error = %err, "cache refresh failed");
        }
    }

    /// Drop `id` from the cache, logging failures.
    pub async fn forget(&self, id: &NotificationId) {
        if let Err(err) = self.cache.invalidate(id).await {
            warn!(notification_id = %id, error = %err, "cache invalidation failed");
        }
    }

    async fn cached(&self, id: &NotificationId) -> Option<Notification> {
        match self.cache.get(id).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(notification_id = %id, error = %err, "cache read failed, using store");
                None
            }
        }
    }

    async fn stored(
        &self,
        id: &NotificationId,
    ) -> Result<Notification, NotificationRepositoryError> {
        let notification = self.repository.get_by_id(id).await?;
        self.refresh(&notification).await;
        Ok(notification)
    }
}
