//! Delayed queue adapters.
//!
//! - [`PgDelayedQueue`]: durable queue in a Postgres table, shared by every
//!   process pointed at the same database.
//! - [`InMemoryDelayedQueue`]: tokio timers and channels, for a single process.

mod in_memory;
mod postgres;

pub use in_memory::{InMemoryDelayedQueue, InMemoryQueueConfig};
pub use postgres::{PgDelayedQueue, PgQueueConfig};
