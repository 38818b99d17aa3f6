//! Internal Diesel row structs for database operations.
//!
//! These types are implementation details of the persistence layer and must
//! never be exposed to the domain. They exist solely to satisfy Diesel's
//! type requirements for queries and mutations.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::schema::notifications;

/// Row struct for reading from the notifications table.
///
/// Also loadable by name so the raw claim statement can return it.
#[derive(Debug, Clone, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = notifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub(crate) struct NotificationRow {
    pub id: Uuid,
    pub payload: Vec<u8>,
    pub target: String,
    pub channel: String,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

/// Insertable struct for creating notification records.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = notifications)]
pub(crate) struct NewNotificationRow<'a> {
    pub id: Uuid,
    pub payload: &'a [u8],
    pub target: &'a str,
    pub channel: &'a str,
    pub status: &'a str,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: i32,
    pub last_error: Option<&'a str>,
}

/// Changeset applied by status updates.
///
/// `scheduled_at: None` leaves the column untouched. `last_error` is always
/// written; `Some(None)` stores NULL.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = notifications)]
pub(crate) struct NotificationStatusChangeset<'a> {
    pub status: &'a str,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<Option<&'a str>>,
}
