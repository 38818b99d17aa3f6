//! JSON wire record carried by the delayed queue and stored in the cache.
//!
//! The record mirrors every persisted field so a worker can act on a warm
//! cache without another store round trip. Payload bytes travel as standard
//! base64.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Channel, Notification, NotificationId, NotificationStatus};

/// Failure to encode or decode a wire record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireFormatError {
    /// The bytes are not a valid record.
    #[error("malformed notification record: {message}")]
    Malformed {
        /// Decoder diagnostic.
        message: String,
    },
    /// The record could not be serialised.
    #[error("failed to encode notification record: {message}")]
    Encode {
        /// Encoder diagnostic.
        message: String,
    },
}

/// Serialised form of a [`Notification`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationEnvelope {
    id: NotificationId,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
    target: String,
    channel: Channel,
    status: NotificationStatus,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    retry_count: u32,
    #[serde(default)]
    last_error: Option<String>,
}

impl NotificationEnvelope {
    /// Identifier of the enclosed notification.
    pub const fn id(&self) -> NotificationId {
        self.id
    }

    /// Encode `notification` as JSON bytes.
    pub fn encode(notification: &Notification) -> Result<Vec<u8>, WireFormatError> {
        serde_json::to_vec(&Self::from(notification.clone())).map_err(|err| {
            WireFormatError::Encode {
                message: err.to_string(),
            }
        })
    }

    /// Decode JSON bytes produced by [`NotificationEnvelope::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, WireFormatError> {
        serde_json::from_slice(bytes).map_err(|err| WireFormatError::Malformed {
            message: err.to_string(),
        })
    }
}

impl From<Notification> for NotificationEnvelope {
    fn from(value: Notification) -> Self {
        Self {
            id: value.id,
            payload: value.payload,
            target: value.target,
            channel: value.channel,
            status: value.status,
            scheduled_at: value.scheduled_at,
            created_at: value.created_at,
            updated_at: value.updated_at,
            retry_count: value.retry_count,
            last_error: value.last_error,
        }
    }
}

impl From<NotificationEnvelope> for Notification {
    fn from(value: NotificationEnvelope) -> Self {
        Self {
            id: value.id,
            payload: value.payload,
            target: value.target,
            channel: value.channel,
            status: value.status,
            scheduled_at: value.scheduled_at,
            created_at: value.created_at,
            updated_at: value.updated_at,
            retry_count: value.retry_count,
            last_error: value.last_error,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
