//! Port interface for the read-through notification cache.
//!
//! The cache holds bounded-lifetime copies of notifications. It is never
//! authoritative; callers fall back to the store on a miss or an error.
use async_trait::async_trait;

use crate::domain::{Notification, NotificationId};

use super::define_port_error;

define_port_error! {
    /// Errors surfaced by the caching adapter.
    pub enum NotificationCacheError {
        /// Cache backend is unavailable or timing out.
        Backend { message: String } => "notification cache backend failure: {message}",
        /// Serialisation or deserialisation of cached content failed.
        Serialization { message: String } =>
            "notification cache serialisation failed: {message}",
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationCache: Send + Sync {
    /// Read a cached copy.
    async fn get(&self, id: &NotificationId) -> Result<Option<Notification>, NotificationCacheError>;

    /// Store or replace the cached copy.
    async fn put(&self, notification: &Notification) -> Result<(), NotificationCacheError>;

    /// Drop the cached copy.
    async fn invalidate(&self, id: &NotificationId) -> Result<(), NotificationCacheError>;
}

/// Cache that never stores anything; used when no cache backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpNotificationCache;

#[async_trait]
impl NotificationCache for NoOpNotificationCache {
    async fn get(&self, _id: &NotificationId) -> Result<Option<Notification>, NotificationCacheError> {
        Ok(None)
    }

    async fn put(&self, _notification: &Notification) -> Result<(), NotificationCacheError> {
        Ok(())
    }

    async fn invalidate(&self, _id: &NotificationId) -> Result<(), NotificationCacheError> {
        Ok(())
    }
}
