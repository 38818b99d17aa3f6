//! Domain primitives, services, and ports.
//!
//! Purpose: model delayed notification delivery independently of storage and
//! transport. Adapters in `outbound` implement the traits in [`ports`].
//!
//! Public surface:
//! - Notification, NotificationId, Channel, NotificationStatus: the entity
//!   and its lifecycle.
//! - NotificationEnvelope: JSON wire record used by queue and cache.
//! - RetryPolicy, BackoffPolicy, QuadraticBackoff: failure accounting.
//! - Scheduler: claim-and-publish loop.
//! - DeliveryWorker: idempotent consumer.
//! - NotificationService: creation and read contract.
//! - Error, ErrorCode: transport-agnostic error payload.

pub mod delivery_worker;
pub mod error;
pub mod notification;
pub mod notification_lookup;
pub mod notification_service;
pub mod ports;
pub mod retry;
pub mod scheduler;

pub use self::delivery_worker::{
    DeliveryError, DeliveryOutcome, DeliveryWorker, DeliveryWorkerConfig, DeliveryWorkerPorts,
};
pub use self::error::{Error, ErrorCode, ErrorValidationError};
pub use self::notification::{
    Channel, NewNotification, Notification, NotificationEnvelope, NotificationId,
    NotificationStatus, NotificationValidationError, ParseNotificationStatusError,
    WireFormatError,
};
pub use self::notification_lookup::NotificationLookup;
pub use self::notification_service::NotificationService;
pub use self::retry::{
    BackoffPolicy, ExhaustedRetryCount, QuadraticBackoff, RetryDecision, RetryPolicy,
};
pub use self::scheduler::{MIN_POLL_INTERVAL, Scheduler, SchedulerConfig, TickReport};
