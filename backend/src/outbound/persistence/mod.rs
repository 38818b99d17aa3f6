//! PostgreSQL persistence adapters using Diesel ORM.
//!
//! This module provides the notification store backed by PostgreSQL via the
//! Diesel ORM with async support through `diesel-async` and `bb8` connection
//! pooling.
//!
//! # Architecture
//!
//! - **Thin adapters**: the repository only translates between Diesel models
//!   and domain types. No business logic resides here.
//! - **Internal models**: Diesel row structs (`models.rs`) and schema
//!   definitions (`schema.rs`) are never exposed to the domain layer.
//! - **Strongly typed errors**: database errors are mapped to
//!   `NotificationRepositoryError` variants.
//! - **Embedded migrations**: [`run_migrations`] applies the bundled schema on
//!   a blocking thread before the pool is used.
//!
//! # Example
//!
//! ```ignore
//! use notifier::outbound::persistence::{DbPool, DieselNotificationRepository, PoolConfig};
//!
//! let config = PoolConfig::new("postgres://localhost/notifier");
//! let pool = DbPool::new(config).await?;
//! let repo = DieselNotificationRepository::new(pool);
//! ```

mod diesel_notification_repository;
mod migrations;
mod models;
mod pool;
mod schema;

pub use diesel_notification_repository::DieselNotificationRepository;
pub use migrations::{MigrationError, run_migrations};
pub use pool::{DbPool, PoolConfig, PoolError};
