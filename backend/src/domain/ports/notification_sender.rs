//! Port interface for channel senders and the registry that selects them.
//!
//! Senders perform one delivery attempt. They do not retry, back off, or
//! check idempotency; the delivery worker owns all of that.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Channel, Notification};

use super::define_port_error;

define_port_error! {
    /// Errors raised by channel senders.
    pub enum NotificationSendError {
        /// The downstream service could not be reached.
        Unavailable { message: String } => "channel unavailable: {message}",
        /// The downstream service refused the message.
        Rejected { message: String } => "channel rejected notification: {message}",
        /// The target or payload cannot be delivered on this channel.
        InvalidTarget { message: String } => "invalid delivery target: {message}",
        /// The attempt exceeded its time budget.
        Timeout { seconds: u64 } => "send timed out after {seconds}s",
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Attempt one delivery of `notification`.
    async fn send(&self, notification: &Notification) -> Result<(), NotificationSendError>;
}

/// Senders keyed by channel name, assembled at startup.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use notifier::domain::Channel;
/// use notifier::domain::ports::{NotificationSendError, NotificationSender, SenderRegistry};
/// use notifier::domain::Notification;
///
/// struct Discard;
///
/// #[async_trait]
/// impl NotificationSender for Discard {
///     async fn send(&self, _n: &Notification) -> Result<(), NotificationSendError> {
///         Ok(())
///     }
/// }
///
/// let registry = SenderRegistry::new().with_sender(Channel::email(), Arc::new(Discard));
/// assert!(registry.get(&Channel::email()).is_some());
/// assert!(registry.get(&Channel::telegram()).is_none());
/// ```
#[derive(Clone, Default)]
pub struct SenderRegistry {
    senders: BTreeMap<Channel, Arc<dyn NotificationSender>>,
}

impl SenderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sender` for `channel`, replacing any previous one.
    pub fn with_sender(mut self, channel: Channel, sender: Arc<dyn NotificationSender>) -> Self {
        self.senders.insert(channel, sender);
        self
    }

    /// Sender registered for `channel`.
    pub fn get(&self, channel: &Channel) -> Option<Arc<dyn NotificationSender>> {
        self.senders.get(channel).cloned()
    }

    /// Registered channel names in sorted order.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.senders.keys()
    }

    /// True when no sender is registered.
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl std::fmt::Debug for SenderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.senders.keys()).finish()
    }
}
