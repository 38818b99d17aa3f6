//! Port abstraction for the notification store.
//!
//! The store is the system of record and the only mutual-exclusion point
//! between scheduler instances: [`NotificationRepository::claim_ready`] must
//! be a single atomic statement that skips rows locked by a concurrent claim.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Notification, NotificationId, NotificationStatus};

use super::define_port_error;

define_port_error! {
    /// Errors raised when reading or writing notifications.
    pub enum NotificationRepositoryError {
        /// Repository connection could not be established.
        Connection { message: String } =>
            "notification repository connection failed: {message}",
        /// Query or mutation failed during execution.
        Query { message: String } => "notification repository query failed: {message}",
        /// No row exists for the identifier.
        NotFound { id: NotificationId } => "notification {id} not found",
        /// A row with the identifier already exists.
        AlreadyExists { id: NotificationId } => "notification {id} already exists",
        /// The row is `Sent` or `Canceled` and can no longer change.
        TerminalState { id: NotificationId, status: NotificationStatus } =>
            "notification {id} is {status} and can no longer change",
    }
}

impl NotificationRepositoryError {
    /// True when retrying the operation later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Query { .. })
    }
}

/// Partial status mutation.
///
/// A `scheduled_at` of `None` keeps the stored schedule. `last_error` always
/// overwrites, so `None` clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Row to update.
    pub id: NotificationId,
    /// New status.
    pub status: NotificationStatus,
    /// Replacement schedule, if any.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Retry count to store.
    pub retry_count: u32,
    /// Failure message to store.
    pub last_error: Option<String>,
}

impl StatusUpdate {
    /// Update `id` to `status`, keeping the schedule and clearing the error.
    pub const fn new(id: NotificationId, status: NotificationStatus, retry_count: u32) -> Self {
        Self {
            id,
            status,
            scheduled_at: None,
            retry_count,
            last_error: None,
        }
    }

    /// Replace the stored schedule.
    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    /// Record a failure message.
    pub fn with_last_error(mut self, last_error: impl Into<String>) -> Self {
        self.last_error = Some(last_error.into());
        self
    }
}

/// Durable notification storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Insert a new row, failing with `AlreadyExists` on an ID collision.
    async fn create(&self, notification: &Notification) -> Result<(), NotificationRepositoryError>;

    /// Fetch a row, failing with `NotFound` when absent.
    async fn get_by_id(&self, id: &NotificationId)
    -> Result<Notification, NotificationRepositoryError>;

    /// Apply `update`, bump `updated_at`, and return the stored row.
    ///
    /// Fails with `NotFound` when the row no longer exists and with
    /// `TerminalState` when it is `Sent` or `Canceled`.
    async fn update_status(
        &self,
        update: &StatusUpdate,
    ) -> Result<Notification, NotificationRepositoryError>;

    /// Delete a row. Deleting a missing row succeeds.
    async fn delete_by_id(&self, id: &NotificationId) -> Result<(), NotificationRepositoryError>;

    /// Atomically claim up to `limit` due rows and mark them `InProcess`.
    ///
    /// Due rows are `Pending` ones whose `scheduled_at` has passed and
    /// `InProcess` ones untouched for longer than `visibility_timeout`. The
    /// result is ordered by `scheduled_at`.
    async fn claim_ready(
        &self,
        limit: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<Notification>, NotificationRepositoryError>;

    /// Page through rows ordered by `scheduled_at`, then `id`.
    async fn list(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Notification>, NotificationRepositoryError>;
}
