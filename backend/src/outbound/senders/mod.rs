//! Channel senders and startup assembly of the sender registry.

mod email;
mod telegram;

use std::sync::Arc;

use tracing::info;

use crate::domain::Channel;
use crate::domain::ports::SenderRegistry;

pub use email::{EMAIL_SUBJECT, EmailSender, EmailSenderConfig};
pub use telegram::TelegramSender;

/// Sender construction failures; fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SenderSetupError {
    /// The configured sender address does not parse.
    #[error("invalid sender address {message}")]
    InvalidSender { message: String },
    /// The SMTP relay could not be configured.
    #[error("invalid smtp relay: {message}")]
    Relay { message: String },
}

impl SenderSetupError {
    pub(crate) fn invalid_sender(message: impl Into<String>) -> Self {
        Self::InvalidSender {
            message: message.into(),
        }
    }

    pub(crate) fn relay(message: impl Into<String>) -> Self {
        Self::Relay {
            message: message.into(),
        }
    }
}

/// Register a sender for every channel whose credentials are present.
///
/// # Errors
///
/// Propagates [`SenderSetupError`] from sender construction.
pub fn build_registry(
    email: Option<EmailSenderConfig>,
    telegram_token: Option<String>,
) -> Result<SenderRegistry, SenderSetupError> {
    let mut registry = SenderRegistry::new();
    if let Some(config) = email {
        registry = registry.with_sender(Channel::email(), Arc::new(EmailSender::new(config)?));
    }
    if let Some(token) = telegram_token {
        registry = registry.with_sender(Channel::telegram(), Arc::new(TelegramSender::new(token)));
    }
    let channels: Vec<&str> = registry.channels().map(Channel::as_str).collect();
    info!(?channels, "sender registry assembled");
    Ok(registry)
}
