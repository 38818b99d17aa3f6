//! PostgreSQL-backed `NotificationRepository` implementation using Diesel ORM.
//!
//! # Claiming
//!
//! `claim_ready` is one statement: a CTE selects due rows with
//! `FOR UPDATE SKIP LOCKED` and the outer `UPDATE` marks them `in_process`.
//! Concurrent claimers therefore never receive the same row, and a claimer
//! never waits on rows another transaction holds.
//!
//! # Time
//!
//! Due-ness, visibility timeouts, and `updated_at` all use the database clock
//! (`NOW()`), so schedulers on hosts with skewed clocks agree.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel_async::RunQueryDsl;
use tracing::debug;

use crate::domain::ports::{NotificationRepository, NotificationRepositoryError, StatusUpdate};
use crate::domain::{Channel, Notification, NotificationId, NotificationStatus};

use super::models::{NewNotificationRow, NotificationRow, NotificationStatusChangeset};
use super::pool::{DbPool, PoolError};
use super::schema::notifications;

const CLAIM_READY_SQL: &str = r"
WITH ready AS (
    SELECT id
    FROM notifications
    WHERE (status = 'pending' AND scheduled_at <= NOW())
       OR (status = 'in_process'
           AND updated_at <= NOW() - ($2::double precision * INTERVAL '1 millisecond'))
    ORDER BY scheduled_at ASC
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE notifications AS n
SET status = 'in_process', updated_at = NOW()
FROM ready
WHERE n.id = ready.id
RETURNING n.id, n.payload, n.target, n.channel, n.status, n.scheduled_at,
          n.created_at, n.updated_at, n.retry_count, n.last_error
";

/// Diesel-backed implementation of the `NotificationRepository` port.
#[derive(Clone)]
pub struct DieselNotificationRepository {
    pool: DbPool,
}

impl DieselNotificationRepository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Map pool errors to repository errors.
fn map_pool_error(error: PoolError) -> NotificationRepositoryError {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => {
            NotificationRepositoryError::connection(message)
        }
    }
}

/// Map Diesel errors to repository errors.
fn map_diesel_error(error: diesel::result::Error) -> NotificationRepositoryError {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    match &error {
        DieselError::DatabaseError(kind, info) => {
            debug!(?kind, message = info.message(), "diesel operation failed");
        }
        _ => debug!(error = %error, "diesel operation failed"),
    }

    match error {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
            NotificationRepositoryError::connection("database connection error")
        }
        DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => {
            NotificationRepositoryError::query("serialization failure, retry later")
        }
        DieselError::QueryBuilderError(_) => {
            NotificationRepositoryError::query("database query error")
        }
        _ => NotificationRepositoryError::query("database error"),
    }
}

fn is_unique_violation(error: &diesel::result::Error) -> bool {
    matches!(
        error,
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _
        )
    )
}

fn to_i32(value: u32, field: &str) -> Result<i32, NotificationRepositoryError> {
    i32::try_from(value)
        .map_err(|_| NotificationRepositoryError::query(format!("{field} out of range: {value}")))
}

fn to_i64(value: u128, field: &str) -> Result<i64, NotificationRepositoryError> {
    i64::try_from(value)
        .map_err(|_| NotificationRepositoryError::query(format!("{field} out of range: {value}")))
}

/// Convert a database row to a domain notification.
fn row_to_notification(row: NotificationRow) -> Result<Notification, NotificationRepositoryError> {
    let channel = Channel::new(row.channel).map_err(|err| {
        NotificationRepositoryError::query(format!("invalid channel in database: {err}"))
    })?;
    let status = NotificationStatus::from_str(&row.status).map_err(|err| {
        NotificationRepositoryError::query(format!("invalid status in database: {err}"))
    })?;
    let retry_count = u32::try_from(row.retry_count).map_err(|_| {
        NotificationRepositoryError::query(format!(
            "negative retry count in database: {}",
            row.retry_count
        ))
    })?;

    Ok(Notification {
        id: NotificationId::from_uuid(row.id),
        payload: row.payload,
        target: row.target,
        channel,
        status,
        scheduled_at: row.scheduled_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
        retry_count,
        last_error: row.last_error,
    })
}

#[async_trait]
impl NotificationRepository for DieselNotificationRepository {
    async fn create(&self, notification: &Notification) -> Result<(), NotificationRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        let new_row = NewNotificationRow {
            id: *notification.id.as_uuid(),
            payload: &notification.payload,
            target: &notification.target,
            channel: notification.channel.as_str(),
            status: notification.status.as_str(),
            scheduled_at: notification.scheduled_at,
            created_at: notification.created_at,
            updated_at: notification.updated_at,
            retry_count: to_i32(notification.retry_count, "retry_count")?,
            last_error: notification.last_error.as_deref(),
        };

        diesel::insert_into(notifications::table)
            .values(&new_row)
            .execute(&mut conn)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    NotificationRepositoryError::already_exists(notification.id)
                } else {
                    map_diesel_error(err)
                }
            })?;

        Ok(())
    }

    async fn get_by_id(
        &self,
        id: &NotificationId,
    ) -> Result<Notification, NotificationRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        let row: Option<NotificationRow> = notifications::table
            .find(id.as_uuid())
            .select(NotificationRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;

        row.map_or_else(
            || Err(NotificationRepositoryError::not_found(*id)),
            row_to_notification,
        )
    }

    async fn update_status(
        &self,
        update: &StatusUpdate,
    ) -> Result<Notification, NotificationRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        let changeset = NotificationStatusChangeset {
            status: update.status.as_str(),
            scheduled_at: update.scheduled_at,
            retry_count: to_i32(update.retry_count, "retry_count")?,
            last_error: Some(update.last_error.as_deref()),
        };
        let absorbing: Vec<&str> = NotificationStatus::ALL
            .iter()
            .filter(|status| status.is_absorbing())
            .map(|status| status.as_str())
            .collect();

        let updated: Option<NotificationRow> = diesel::update(
            notifications::table
                .filter(notifications::id.eq(update.id.as_uuid()))
                .filter(notifications::status.ne_all(absorbing)),
        )
        .set((changeset, notifications::updated_at.eq(diesel::dsl::now)))
        .returning(NotificationRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()
        .map_err(map_diesel_error)?;

        if let Some(row) = updated {
            return row_to_notification(row);
        }

        // Nothing matched: tell a vanished row from a final one.
        let status: Option<String> = notifications::table
            .find(update.id.as_uuid())
            .select(notifications::status)
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?;

        match status {
            None => Err(NotificationRepositoryError::not_found(update.id)),
            Some(raw) => {
                let status = NotificationStatus::from_str(&raw).map_err(|err| {
                    NotificationRepositoryError::query(format!("invalid status in database: {err}"))
                })?;
                Err(NotificationRepositoryError::terminal_state(update.id, status))
            }
        }
    }

    async fn delete_by_id(&self, id: &NotificationId) -> Result<(), NotificationRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        diesel::delete(notifications::table.find(id.as_uuid()))
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;

        Ok(())
    }

    async fn claim_ready(
        &self,
        limit: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<Notification>, NotificationRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        let rows: Vec<NotificationRow> = diesel::sql_query(CLAIM_READY_SQL)
            .bind::<BigInt, _>(i64::from(limit))
            .bind::<BigInt, _>(to_i64(visibility_timeout.as_millis(), "visibility_timeout")?)
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;

        // RETURNING does not preserve the CTE ordering.
        let mut claimed = rows
            .into_iter()
            .map(row_to_notification)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|notification| (notification.scheduled_at, notification.id));
        Ok(claimed)
    }

    async fn list(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Notification>, NotificationRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;

        let rows: Vec<NotificationRow> = notifications::table
            .order((notifications::scheduled_at.asc(), notifications::id.asc()))
            .limit(i64::from(limit))
            .offset(i64::from(offset))
            .select(NotificationRow::as_select())
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?;

        rows.into_iter().map(row_to_notification).collect()
    }
}
