//! Domain ports and supporting types for the hexagonal boundary.

mod macros;
pub(crate) use macros::define_port_error;

mod delayed_queue;
mod notification_cache;
mod notification_repository;
mod notification_sender;

#[cfg(test)]
pub use delayed_queue::{MockDelayedQueue, MockMessageHandler};
pub use delayed_queue::{
    DelayedQueue, DelayedQueueError, MessageHandler, MessageHandlerError,
    NOTIFICATION_ROUTING_KEY,
};
#[cfg(test)]
pub use notification_cache::MockNotificationCache;
pub use notification_cache::{NoOpNotificationCache, NotificationCache, NotificationCacheError};
#[cfg(test)]
pub use notification_repository::MockNotificationRepository;
pub use notification_repository::{
    NotificationRepository, NotificationRepositoryError, StatusUpdate,
};
#[cfg(test)]
pub use notification_sender::MockNotificationSender;
pub use notification_sender::{NotificationSendError, NotificationSender, SenderRegistry};
