//! Telegram Bot API sender.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::Notification;
use crate::domain::ports::{NotificationSendError, NotificationSender};

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends the payload text to the chat named by the notification target.
#[derive(Clone)]
pub struct TelegramSender {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl TelegramSender {
    /// Sender for the public Bot API.
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, TELEGRAM_API_URL)
    }

    /// Sender for an alternative Bot API endpoint, such as a local server.
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.base_url, self.token)
    }
}

impl std::fmt::Debug for TelegramSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSender")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NotificationSender for TelegramSender {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationSendError> {
        let text = notification.payload_text();
        let response = self
            .client
            .post(self.endpoint())
            .json(&SendMessageRequest {
                chat_id: &notification.target,
                text: &text,
            })
            .send()
            .await
            // The URL embeds the bot token; keep it out of the message.
            .map_err(|err| NotificationSendError::unavailable(err.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%status, body = %body, "telegram api refused message");
            return Err(NotificationSendError::rejected(format!(
                "telegram api returned {status}"
            )));
        }

        let reply: ApiResponse = response
            .json()
            .await
            .map_err(|err| NotificationSendError::rejected(err.without_url().to_string()))?;
        if !reply.ok {
            return Err(NotificationSendError::rejected(
                reply
                    .description
                    .unwrap_or_else(|| "telegram api reported failure".to_owned()),
            ));
        }

        info!(notification_id = %notification.id, "telegram message sent");
        Ok(())
    }
}
