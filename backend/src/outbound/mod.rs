//! Outbound adapters implementing domain ports for external infrastructure.
//!
//! This module follows the hexagonal architecture pattern, providing concrete
//! implementations of domain port traits for various infrastructure concerns:
//!
//! - **persistence**: PostgreSQL notification store using Diesel ORM
//! - **cache**: Redis-backed read-through cache
//! - **queue**: delayed queues over a Postgres table or tokio timers
//! - **senders**: SMTP and Telegram channel senders
//!
//! Adapters are thin translators that convert between domain types and
//! infrastructure-specific representations. They contain no business logic.

pub mod cache;
pub mod persistence;
pub mod queue;
pub mod senders;
