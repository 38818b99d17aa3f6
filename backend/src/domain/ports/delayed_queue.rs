//! Port abstraction for the delayed message transport.
//!
//! A delayed queue accepts a serialised notification plus a delay and makes
//! it visible to consumers only once the delay has elapsed. Delivery is at
//! least once: a message stays queued until its handler returns `Ok`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::Notification;

use super::define_port_error;

/// Routing key binding notification deliveries to their consumers.
pub const NOTIFICATION_ROUTING_KEY: &str = "notification_key";

define_port_error! {
    /// Errors raised by delayed queue adapters.
    pub enum DelayedQueueError {
        /// Transport is unreachable or a connection was lost.
        Unavailable { message: String } => "delayed queue unavailable: {message}",
        /// The notification could not be encoded for transport.
        Encoding { message: String } => "delayed queue encoding failed: {message}",
        /// The queue has been closed and accepts no further work.
        Closed => "delayed queue is closed",
    }
}

define_port_error! {
    /// Failure reported by a message handler.
    pub enum MessageHandlerError {
        /// The message could not be processed now and must be redelivered.
        Transient { message: String } => "message handling failed transiently: {message}",
    }
}

/// Processes one delivered message body.
///
/// `Ok` acknowledges the message. `Err` leaves it for queue-level
/// redelivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a raw message body.
    async fn handle(&self, body: &[u8]) -> Result<(), MessageHandlerError>;
}

/// Delayed, at-least-once message transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DelayedQueue: Send + Sync {
    /// Idempotently declare the durable transport.
    async fn declare(&self) -> Result<(), DelayedQueueError>;

    /// Enqueue `notification`, deliverable once `delay` has elapsed.
    async fn publish(
        &self,
        notification: &Notification,
        delay: Duration,
    ) -> Result<(), DelayedQueueError>;

    /// Feed deliveries to `handler` from a worker pool until `shutdown` is
    /// cancelled, then wait for in-flight handlers and return.
    async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), DelayedQueueError>;

    /// Release transport resources.
    async fn close(&self) -> Result<(), DelayedQueueError>;
}
