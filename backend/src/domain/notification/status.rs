//! Delivery status of a notification and the transitions between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a notification.
///
/// ```text
/// Pending ──claim──▶ InProcess ──send ok──▶ Sent
///    ▲                  │  │
///    └─retries remain───┘  └─retries exhausted─▶ Failed
///
/// any non-absorbing status ──cancel──▶ Canceled
/// ```
///
/// `Sent` and `Canceled` are absorbing: nothing may move a row out of them.
///
/// # Example
///
/// ```
/// # use notifier::domain::NotificationStatus;
/// assert_eq!(NotificationStatus::InProcess.as_str(), "in_process");
/// assert!(NotificationStatus::Sent.is_absorbing());
/// assert!(!NotificationStatus::Failed.is_absorbing());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    /// Waiting for its scheduled time, or for a retry.
    Pending,
    /// Claimed by a scheduler and handed to the delayed queue.
    InProcess,
    /// Delivered to the channel.
    Sent,
    /// Retries exhausted.
    Failed,
    /// Cancelled explicitly.
    Canceled,
}

impl NotificationStatus {
    /// All status variants in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InProcess,
        Self::Sent,
        Self::Failed,
        Self::Canceled,
    ];

    /// Returns the database string representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProcess => "in_process",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// True for statuses that no claim, publish, or send may leave.
    pub const fn is_absorbing(self) -> bool {
        matches!(self, Self::Sent | Self::Canceled)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `InProcess → InProcess` covers a visibility-timeout reclaim. A `Failed`
    /// row may still be delivered by a late message, so it may move to `Sent`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use NotificationStatus::{Canceled, Failed, InProcess, Pending, Sent};

        if self.is_absorbing() {
            return false;
        }
        matches!(
            (self, next),
            (_, Canceled)
                | (Pending, InProcess)
                | (InProcess, InProcess | Sent | Pending | Failed)
                | (Failed, Sent | Pending | Failed)
        )
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid notification status '{input}'")]
pub struct ParseNotificationStatusError {
    /// The rejected input.
    pub input: String,
}

impl FromStr for NotificationStatus {
    type Err = ParseNotificationStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| ParseNotificationStatusError {
                input: s.to_owned(),
            })
    }
}
