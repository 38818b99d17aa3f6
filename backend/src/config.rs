//! Service configuration loaded via OrthoConfig.
//!
//! Every field is optional at load time. Accessors apply defaults and build
//! the typed configuration structs consumed by the domain and adapters, so
//! nothing downstream reads raw settings.

use std::ffi::OsString;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::domain::{
    DeliveryWorkerConfig, ExhaustedRetryCount, QuadraticBackoff, RetryPolicy, SchedulerConfig,
};
use crate::outbound::persistence::PoolConfig;
use crate::outbound::queue::{InMemoryQueueConfig, PgQueueConfig};
use crate::outbound::senders::EmailSenderConfig;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_BATCH_SIZE: u32 = 100;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 300;
const DEFAULT_BACKOFF_UNIT_SECS: u64 = 60;
const DEFAULT_CONSUMER_WORKERS: usize = 4;
const DEFAULT_CONSUMER_PREFETCH: u32 = 10;
const DEFAULT_SEND_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CACHE_TTL_SECS: u64 = 3_600;
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_FROM_NAME: &str = "Delayed Notifier";

/// Problems found while loading or interpreting settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    /// A required setting is absent.
    #[error("missing required setting NOTIFIER_{name}")]
    Missing { name: &'static str },
    /// A setting has an unusable value.
    #[error("invalid value '{value}' for NOTIFIER_{name}")]
    Invalid { name: &'static str, value: String },
    /// A configuration source could not be read or parsed.
    #[error("failed to load settings: {message}")]
    Load { message: String },
}

/// Transport behind the delayed queue port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBackend {
    /// Durable queue table in the notification database.
    #[default]
    Postgres,
    /// Process-local tokio queue.
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(other.to_owned()),
        }
    }
}

/// Settings for the notifier process.
#[derive(Clone, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "NOTIFIER")]
pub struct NotifierSettings {
    /// Postgres URL for the notification store and queue table.
    pub database_url: Option<String>,
    /// Redis URL; the cache is disabled when absent.
    pub redis_url: Option<String>,
    /// `postgres` (default) or `memory`.
    pub queue_backend: Option<String>,
    /// Scheduler tick interval in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Rows claimed per tick.
    pub batch_size: Option<u32>,
    /// Failures allowed before a notification is `Failed`.
    pub max_retries: Option<u32>,
    /// Seconds a claimed row may stay in process before it is reclaimed.
    pub visibility_timeout_secs: Option<u64>,
    /// Zero the retry count when a notification is marked `Failed`.
    #[ortho_config(default = false)]
    pub reset_retry_count_on_exhaustion: bool,
    /// Backoff unit in seconds; retry `n` waits `n² × unit`.
    pub backoff_unit_secs: Option<u64>,
    /// Consumer worker tasks.
    pub consumer_workers: Option<usize>,
    /// Messages each consumer worker leases at once.
    pub consumer_prefetch: Option<u32>,
    /// Per-send timeout in seconds.
    pub send_timeout_secs: Option<u64>,
    /// Cache entry lifetime in seconds before jitter.
    pub cache_ttl_secs: Option<u64>,
    /// SMTP relay host; e-mail is disabled when absent.
    pub smtp_host: Option<String>,
    /// SMTP relay port.
    pub smtp_port: Option<u16>,
    /// SMTP login.
    pub smtp_username: Option<String>,
    /// SMTP password.
    pub smtp_password: Option<String>,
    /// Sender address for e-mail.
    pub from_email: Option<String>,
    /// Sender display name for e-mail.
    pub from_name: Option<String>,
    /// Telegram bot token; Telegram is disabled when absent.
    pub telegram_token: Option<String>,
}

impl std::fmt::Debug for NotifierSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierSettings")
            .field("queue_backend", &self.queue_backend)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .field("consumer_workers", &self.consumer_workers)
            .field("smtp_host", &self.smtp_host)
            .field("telegram_enabled", &self.telegram_token.is_some())
            .finish_non_exhaustive()
    }
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

impl NotifierSettings {
    /// Load settings from `NOTIFIER_*` variables and configuration files.
    ///
    /// Command-line flags belong to the binary, so no arguments are passed.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Load`] when a source cannot be read or parsed.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from_iter([OsString::from("notifier")]).map_err(|err| SettingsError::Load {
            message: err.to_string(),
        })
    }

    /// Store URL.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Missing`] when unset.
    pub fn database_url(&self) -> Result<&str, SettingsError> {
        non_blank(self.database_url.as_ref()).ok_or(SettingsError::Missing {
            name: "DATABASE_URL",
        })
    }

    /// Redis URL, when caching is enabled.
    pub fn redis_url(&self) -> Option<&str> {
        non_blank(self.redis_url.as_ref())
    }

    /// Selected queue transport.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Invalid`] for an unknown backend name.
    pub fn queue_backend(&self) -> Result<QueueBackend, SettingsError> {
        match non_blank(self.queue_backend.as_ref()) {
            None => Ok(QueueBackend::default()),
            Some(raw) => raw.parse().map_err(|value| SettingsError::Invalid {
                name: "QUEUE_BACKEND",
                value,
            }),
        }
    }

    /// Retry budget and exhaustion behaviour.
    pub fn retry_policy(&self) -> RetryPolicy {
        let exhausted = if self.reset_retry_count_on_exhaustion {
            ExhaustedRetryCount::Reset
        } else {
            ExhaustedRetryCount::Preserve
        };
        RetryPolicy::new(self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES), exhausted)
    }

    /// Quadratic backoff with the configured unit.
    pub fn backoff(&self) -> Arc<QuadraticBackoff> {
        Arc::new(QuadraticBackoff::new(Duration::from_secs(
            self.backoff_unit_secs.unwrap_or(DEFAULT_BACKOFF_UNIT_SECS),
        )))
    }

    /// Scheduler tick settings.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(
                self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS).max(1),
            ),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            visibility_timeout: self.visibility_timeout(),
        }
    }

    /// Worker send budget.
    pub fn delivery_worker_config(&self) -> DeliveryWorkerConfig {
        DeliveryWorkerConfig {
            send_timeout: Duration::from_secs(
                self.send_timeout_secs.unwrap_or(DEFAULT_SEND_TIMEOUT_SECS).max(1),
            ),
        }
    }

    /// Store connection pool sized for the consumer pool plus the scheduler.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Missing`] when the database URL is unset.
    pub fn pool_config(&self) -> Result<PoolConfig, SettingsError> {
        let max_size = u32::try_from(self.consumer_workers())
            .unwrap_or(u32::MAX)
            .saturating_add(4);
        Ok(PoolConfig::new(self.database_url()?).with_max_size(max_size))
    }

    /// Postgres queue tuning. The lease matches the visibility timeout.
    pub fn pg_queue_config(&self) -> PgQueueConfig {
        PgQueueConfig {
            workers: self.consumer_workers(),
            prefetch: self
                .consumer_prefetch
                .unwrap_or(DEFAULT_CONSUMER_PREFETCH)
                .max(1),
            lease: self.visibility_timeout(),
            ..PgQueueConfig::default()
        }
    }

    /// In-process queue tuning.
    pub fn in_memory_queue_config(&self) -> InMemoryQueueConfig {
        InMemoryQueueConfig {
            workers: self.consumer_workers(),
            ..InMemoryQueueConfig::default()
        }
    }

    /// Cache entry lifetime before jitter.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS))
    }

    /// SMTP settings when both the relay host and sender address are set.
    pub fn email_sender_config(&self) -> Option<EmailSenderConfig> {
        let host = non_blank(self.smtp_host.as_ref())?;
        let from_email = non_blank(self.from_email.as_ref())?;
        Some(EmailSenderConfig {
            host: host.to_owned(),
            port: self.smtp_port.unwrap_or(DEFAULT_SMTP_PORT),
            username: self.smtp_username.clone().unwrap_or_default(),
            password: self.smtp_password.clone().unwrap_or_default(),
            from_email: from_email.to_owned(),
            from_name: non_blank(self.from_name.as_ref())
                .unwrap_or(DEFAULT_FROM_NAME)
                .to_owned(),
        })
    }

    /// Telegram bot token, when configured.
    pub fn telegram_token(&self) -> Option<String> {
        non_blank(self.telegram_token.as_ref()).map(str::to_owned)
    }

    fn consumer_workers(&self) -> usize {
        self.consumer_workers
            .unwrap_or(DEFAULT_CONSUMER_WORKERS)
            .max(1)
    }

    fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(
            self.visibility_timeout_secs
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for settings parsing and typed accessors.

    use super::*;

    use env_lock::lock_env;
    use rstest::rstest;

    const VARS: [&str; 20] = [
        "NOTIFIER_DATABASE_URL",
        "NOTIFIER_REDIS_URL",
        "NOTIFIER_QUEUE_BACKEND",
        "NOTIFIER_POLL_INTERVAL_MS",
        "NOTIFIER_BATCH_SIZE",
        "NOTIFIER_MAX_RETRIES",
        "NOTIFIER_VISIBILITY_TIMEOUT_SECS",
        "NOTIFIER_RESET_RETRY_COUNT_ON_EXHAUSTION",
        "NOTIFIER_BACKOFF_UNIT_SECS",
        "NOTIFIER_CONSUMER_WORKERS",
        "NOTIFIER_CONSUMER_PREFETCH",
        "NOTIFIER_SEND_TIMEOUT_SECS",
        "NOTIFIER_CACHE_TTL_SECS",
        "NOTIFIER_SMTP_HOST",
        "NOTIFIER_SMTP_PORT",
        "NOTIFIER_SMTP_USERNAME",
        "NOTIFIER_SMTP_PASSWORD",
        "NOTIFIER_FROM_EMAIL",
        "NOTIFIER_FROM_NAME",
        "NOTIFIER_TELEGRAM_TOKEN",
    ];

    /// Clear every notifier variable, then apply `overrides`.
    fn env_with(overrides: &[(&'static str, &str)]) -> Vec<(&'static str, Option<String>)> {
        VARS.iter()
            .map(|name| {
                let value = overrides
                    .iter()
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| (*value).to_owned());
                (*name, value)
            })
            .collect()
    }

    fn load_from_empty_args() -> NotifierSettings {
        NotifierSettings::load().expect("config should load")
    }

    #[rstest]
    fn defaults_apply_when_unset() {
        let _guard = lock_env(env_with(&[]));

        let settings = load_from_empty_args();

        assert_eq!(
            settings.database_url(),
            Err(SettingsError::Missing {
                name: "DATABASE_URL"
            })
        );
        assert_eq!(settings.redis_url(), None);
        assert_eq!(settings.queue_backend(), Ok(QueueBackend::Postgres));
        assert_eq!(settings.scheduler_config(), SchedulerConfig::default());
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(
            settings.delivery_worker_config(),
            DeliveryWorkerConfig::default()
        );
        assert_eq!(settings.pg_queue_config(), PgQueueConfig::default());
        assert!(settings.email_sender_config().is_none());
        assert!(settings.telegram_token().is_none());
    }

    #[rstest]
    fn environment_overrides_are_respected() {
        let _guard = lock_env(env_with(&[
            ("NOTIFIER_DATABASE_URL", "postgres://db/notifier"),
            ("NOTIFIER_QUEUE_BACKEND", "memory"),
            ("NOTIFIER_POLL_INTERVAL_MS", "250"),
            ("NOTIFIER_BATCH_SIZE", "20"),
            ("NOTIFIER_MAX_RETRIES", "5"),
            ("NOTIFIER_VISIBILITY_TIMEOUT_SECS", "60"),
            ("NOTIFIER_RESET_RETRY_COUNT_ON_EXHAUSTION", "true"),
            ("NOTIFIER_CONSUMER_WORKERS", "2"),
            ("NOTIFIER_CONSUMER_PREFETCH", "3"),
        ]));

        let settings = load_from_empty_args();

        assert_eq!(settings.database_url(), Ok("postgres://db/notifier"));
        assert_eq!(settings.queue_backend(), Ok(QueueBackend::Memory));
        assert_eq!(
            settings.scheduler_config(),
            SchedulerConfig {
                poll_interval: Duration::from_millis(250),
                batch_size: 20,
                visibility_timeout: Duration::from_secs(60),
            }
        );
        assert_eq!(
            settings.retry_policy(),
            RetryPolicy::new(5, ExhaustedRetryCount::Reset)
        );
        let queue = settings.pg_queue_config();
        assert_eq!((queue.workers, queue.prefetch), (2, 3));
        assert_eq!(queue.lease, Duration::from_secs(60));
        assert_eq!(settings.pool_config().expect("pool").max_size(), 6);
    }

    #[rstest]
    fn unknown_queue_backend_is_rejected() {
        let _guard = lock_env(env_with(&[("NOTIFIER_QUEUE_BACKEND", "kafka")]));

        let settings = load_from_empty_args();

        assert_eq!(
            settings.queue_backend(),
            Err(SettingsError::Invalid {
                name: "QUEUE_BACKEND",
                value: "kafka".into(),
            })
        );
    }

    #[rstest]
    fn email_requires_host_and_sender() {
        let _guard = lock_env(env_with(&[
            ("NOTIFIER_SMTP_HOST", "smtp.example.com"),
            ("NOTIFIER_FROM_EMAIL", "noreply@example.com"),
            ("NOTIFIER_SMTP_USERNAME", "mailer"),
        ]));

        let settings = load_from_empty_args();
        let email = settings.email_sender_config().expect("email enabled");

        assert_eq!(email.host, "smtp.example.com");
        assert_eq!(email.port, DEFAULT_SMTP_PORT);
        assert_eq!(email.username, "mailer");
        assert_eq!(email.from_name, DEFAULT_FROM_NAME);
    }

    #[rstest]
    fn debug_output_omits_secrets() {
        let _guard = lock_env(env_with(&[
            ("NOTIFIER_SMTP_PASSWORD", "hunter2"),
            ("NOTIFIER_TELEGRAM_TOKEN", "123:abc"),
        ]));

        let rendered = format!("{:?}", load_from_empty_args());

        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("123:abc"));
    }
}
