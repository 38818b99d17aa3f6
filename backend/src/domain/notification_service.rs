//! Creation and read contract used by inbound adapters.
//!
//! Validates new notifications, translates store errors into domain
//! [`Error`]s, and keeps the cache coherent on cancel and delete.

use std::sync::Arc;

use mockable::Clock;
use tracing::{info, warn};

use crate::domain::notification_lookup::NotificationLookup;
use crate::domain::ports::{NotificationRepository, NotificationRepositoryError, StatusUpdate};
use crate::domain::{Error, NewNotification, Notification, NotificationId, NotificationStatus};

/// Largest page returned by [`NotificationService::list`].
pub const MAX_PAGE_SIZE: u32 = 100;

/// Application service for scheduling and inspecting notifications.
#[derive(Clone)]
pub struct NotificationService {
    repository: Arc<dyn NotificationRepository>,
    lookup: NotificationLookup,
    clock: Arc<dyn Clock>,
}

impl NotificationService {
    /// Build the service over a store and its cache-backed lookup.
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        lookup: NotificationLookup,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            lookup,
            clock,
        }
    }

    /// Persist a new `Pending` notification.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a blank target or a `scheduled_at` in the past,
    /// `Conflict` when the identifier is taken.
    pub async fn save(&self, draft: NewNotification) -> Result<Notification, Error> {
        let now = self.clock.utc();
        if draft.target.trim().is_empty() {
            return Err(Error::invalid_request("notification target must not be empty"));
        }
        if draft.scheduled_at < now {
            return Err(Error::invalid_request("scheduled_at must not be in the past"));
        }

        let notification = Notification::new(draft, now);
        self.repository
            .create(&notification)
            .await
            .map_err(map_repository_error)?;
        info!(
            notification_id = %notification.id,
            channel = %notification.channel,
            scheduled_at = %notification.scheduled_at,
            "notification scheduled"
        );
        Ok(notification)
    }

    /// Fetch a notification.
    ///
    /// Only a cached `Sent` or `Canceled` copy is returned as-is; any other
    /// status is re-read from the store, which also refreshes the cache.
    pub async fn get(&self, id: &NotificationId) -> Result<Notification, Error> {
        self.lookup.current(id).await.map_err(map_repository_error)
    }

    /// Page through notifications; `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn list(&self, limit: u32, offset: u32) -> Result<Vec<Notification>, Error> {
        self.repository
            .list(limit.clamp(1, MAX_PAGE_SIZE), offset)
            .await
            .map_err(map_repository_error)
    }

    /// Cancel a notification that has not been sent.
    ///
    /// Cancelling twice is fine; cancelling a sent notification is a
    /// `Conflict`.
    pub async fn cancel(&self, id: &NotificationId) -> Result<Notification, Error> {
        let current = self
            .repository
            .get_by_id(id)
            .await
            .map_err(map_repository_error)?;
        if current.status == NotificationStatus::Canceled {
            return Ok(current);
        }
        if !current.status.can_transition_to(NotificationStatus::Canceled) {
            return Err(Error::conflict(format!(
                "notification {id} is {} and cannot be cancelled",
                current.status
            )));
        }

        let mut update = StatusUpdate::new(*id, NotificationStatus::Canceled, current.retry_count);
        update.last_error = current.last_error;
        let cancelled = self
            .repository
            .update_status(&update)
            .await
            .map_err(map_repository_error)?;
        self.lookup.forget(id).await;
        info!(notification_id = %id, "notification cancelled");
        Ok(cancelled)
    }

    /// Delete a notification. Deleting an unknown identifier succeeds.
    pub async fn delete(&self, id: &NotificationId) -> Result<(), Error> {
        self.repository
            .delete_by_id(id)
            .await
            .map_err(map_repository_error)?;
        self.lookup.forget(id).await;
        Ok(())
    }
}

fn map_repository_error(error: NotificationRepositoryError) -> Error {
    match error {
        NotificationRepositoryError::NotFound { id } => {
            Error::not_found(format!("notification {id} not found"))
        }
        NotificationRepositoryError::AlreadyExists { id } => {
            Error::conflict(format!("notification {id} already exists"))
        }
        err @ NotificationRepositoryError::TerminalState { .. } => Error::conflict(err.to_string()),
        err @ (NotificationRepositoryError::Connection { .. }
        | NotificationRepositoryError::Query { .. }) => {
            warn!(error = %err, "notification store unavailable");
            Error::service_unavailable("notification store unavailable")
        }
    }
}
