//! SMTP sender built on `lettre`.
//!
//! One plain-text message per notification: the payload is the body, the
//! target is the single recipient, and the subject is fixed.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use crate::domain::Notification;
use crate::domain::ports::{NotificationSendError, NotificationSender};

use super::SenderSetupError;

/// Subject line of every notification e-mail.
pub const EMAIL_SUBJECT: &str = "Delayed Notification";

/// SMTP relay and sender identity.
#[derive(Clone)]
pub struct EmailSenderConfig {
    /// Relay host; the connection is upgraded with STARTTLS.
    pub host: String,
    /// Relay port, usually 587.
    pub port: u16,
    /// SMTP login.
    pub username: String,
    /// SMTP password.
    pub password: String,
    /// Envelope and header sender address.
    pub from_email: String,
    /// Display name shown next to `from_email`.
    pub from_name: String,
}

impl std::fmt::Debug for EmailSenderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailSenderConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("from_email", &self.from_email)
            .field("from_name", &self.from_name)
            .finish_non_exhaustive()
    }
}

/// Delivers notifications over SMTP.
#[derive(Clone)]
pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    /// Build the relay transport and validate the sender mailbox.
    ///
    /// No connection is opened until the first send.
    ///
    /// # Errors
    ///
    /// Returns [`SenderSetupError`] when the sender address does not parse or
    /// the relay host is unusable.
    pub fn new(config: EmailSenderConfig) -> Result<Self, SenderSetupError> {
        let from = sender_mailbox(&config.from_name, &config.from_email)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|err| SenderSetupError::relay(err.to_string()))?
            .port(config.port)
            .credentials(Credentials::new(config.username, config.password))
            .build();
        Ok(Self { transport, from })
    }

    fn build_message(&self, notification: &Notification) -> Result<Message, NotificationSendError> {
        let to: Mailbox = notification
            .target
            .parse()
            .map_err(|err| NotificationSendError::invalid_target(format!("{err}")))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(EMAIL_SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(notification.payload_text())
            .map_err(|err| NotificationSendError::invalid_target(err.to_string()))
    }
}

fn sender_mailbox(name: &str, email: &str) -> Result<Mailbox, SenderSetupError> {
    let address = email
        .parse()
        .map_err(|err| SenderSetupError::invalid_sender(format!("{email}: {err}")))?;
    let name = name.trim();
    Ok(Mailbox::new((!name.is_empty()).then(|| name.to_owned()), address))
}

impl std::fmt::Debug for EmailSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailSender")
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NotificationSender for EmailSender {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationSendError> {
        let message = self.build_message(notification)?;
        self.transport.send(message).await.map_err(|err| {
            debug!(error = %err, "smtp send failed");
            if err.is_permanent() {
                NotificationSendError::rejected(err.to_string())
            } else {
                NotificationSendError::unavailable(err.to_string())
            }
        })?;
        info!(notification_id = %notification.id, "email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::{fixture, rstest};

    use crate::domain::{Channel, NewNotification};

    #[fixture]
    fn config() -> EmailSenderConfig {
        EmailSenderConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "mailer".into(),
            password: "hunter2".into(),
            from_email: "noreply@example.com".into(),
            from_name: "Notifier".into(),
        }
    }

    fn addressed_to(target: &str) -> Notification {
        let now = Utc::now();
        Notification::new(
            NewNotification {
                id: None,
                payload: b"Your table is ready".to_vec(),
                target: target.into(),
                channel: Channel::email(),
                scheduled_at: now,
            },
            now,
        )
    }

    #[rstest]
    #[tokio::test]
    async fn message_carries_subject_sender_and_body(config: EmailSenderConfig) {
        let sender = EmailSender::new(config).expect("sender");
        let message = sender
            .build_message(&addressed_to("guest@example.com"))
            .expect("message");
        let raw = String::from_utf8(message.formatted()).expect("utf8");

        assert!(raw.contains("Subject: Delayed Notification"));
        assert!(raw.contains("From: Notifier <noreply@example.com>"));
        assert!(raw.contains("To: guest@example.com"));
        assert!(raw.contains("Your table is ready"));
    }

    #[rstest]
    #[tokio::test]
    async fn unparsable_target_is_invalid(config: EmailSenderConfig) {
        let sender = EmailSender::new(config).expect("sender");
        let err = sender
            .build_message(&addressed_to("not an address"))
            .expect_err("invalid");
        assert!(matches!(err, NotificationSendError::InvalidTarget { .. }));
    }

    #[rstest]
    fn bad_sender_address_fails_setup(mut config: EmailSenderConfig) {
        config.from_email = "nobody".into();
        let err = EmailSender::new(config).expect_err("invalid sender");
        assert!(matches!(err, SenderSetupError::InvalidSender { .. }));
    }

    #[rstest]
    fn debug_output_hides_password(config: EmailSenderConfig) {
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
