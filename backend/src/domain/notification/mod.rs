//! The notification entity and its identifiers.
//!
//! A [`Notification`] is the only persisted aggregate. Its identity, payload,
//! target, and channel are fixed at creation; status, schedule, retry count,
//! and last error evolve through the delivery lifecycle described on
//! [`NotificationStatus`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod status;
mod wire;

pub use status::{NotificationStatus, ParseNotificationStatusError};
pub use wire::{NotificationEnvelope, WireFormatError};

/// Stable notification identifier stored as a UUID.
///
/// # Example
///
/// ```
/// # use notifier::domain::NotificationId;
/// let id: NotificationId = "3fa85f64-5717-4562-b3fc-2c963f66afa6".parse().unwrap();
/// assert_eq!(id.to_string(), "3fa85f64-5717-4562-b3fc-2c963f66afa6");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(Uuid);

impl NotificationId {
    /// Generate a new random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Access the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NotificationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Validation failures for notification fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotificationValidationError {
    /// Channel names must be non-empty lowercase ASCII identifiers.
    #[error("invalid channel name '{0}'")]
    InvalidChannel(String),
    /// Targets must not be blank.
    #[error("notification target must not be empty")]
    EmptyTarget,
}

/// Name of the delivery channel that selects a sender.
///
/// Channel names are lowercase ASCII letters, digits, `-` or `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    /// SMTP e-mail delivery.
    pub const EMAIL: &'static str = "email";
    /// Telegram Bot API delivery.
    pub const TELEGRAM: &'static str = "telegram";

    /// Validate and construct a channel name.
    pub fn new(name: impl Into<String>) -> Result<Self, NotificationValidationError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(name))
        } else {
            Err(NotificationValidationError::InvalidChannel(name))
        }
    }

    /// The e-mail channel.
    pub fn email() -> Self {
        Self(Self::EMAIL.to_owned())
    }

    /// The Telegram channel.
    pub fn telegram() -> Self {
        Self(Self::TELEGRAM.to_owned())
    }

    /// Borrow the channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Channel {
    type Error = NotificationValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Channel> for String {
    fn from(value: Channel) -> Self {
        value.0
    }
}

/// A notification scheduled for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Immutable identifier.
    pub id: NotificationId,
    /// Opaque channel-interpreted body.
    pub payload: Vec<u8>,
    /// Channel-specific address (e-mail address, chat id, ...).
    pub target: String,
    /// Channel selecting the sender.
    pub channel: Channel,
    /// Current lifecycle status.
    pub status: NotificationStatus,
    /// No delivery attempt happens before this instant.
    pub scheduled_at: DateTime<Utc>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last status mutation.
    pub updated_at: DateTime<Utc>,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
    /// Most recent failure message, cleared on success.
    pub last_error: Option<String>,
}

impl Notification {
    /// Build a fresh `Pending` notification created at `now`.
    pub fn new(draft: NewNotification, now: DateTime<Utc>) -> Self {
        let NewNotification {
            id,
            payload,
            target,
            channel,
            scheduled_at,
        } = draft;
        Self {
            id: id.unwrap_or_else(NotificationId::random),
            payload,
            target,
            channel,
            status: NotificationStatus::Pending,
            scheduled_at,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Render the payload for text channels, replacing invalid UTF-8.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Caller-supplied fields for creating a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    /// Optional caller-chosen identifier; generated when absent.
    pub id: Option<NotificationId>,
    /// Opaque body.
    pub payload: Vec<u8>,
    /// Channel-specific address.
    pub target: String,
    /// Delivery channel.
    pub channel: Channel,
    /// Earliest delivery instant.
    pub scheduled_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests;
