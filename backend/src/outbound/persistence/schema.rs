//! Diesel table definitions for the PostgreSQL schema.
//!
//! These definitions must match the database migrations exactly. They are used
//! by Diesel for compile-time query validation and type-safe SQL generation.
//!
//! # Maintenance
//!
//! When migrations change the schema, this file should be regenerated or
//! manually updated to reflect those changes. The `diesel print-schema`
//! command can generate these definitions from a live database.

diesel::table! {
    /// Scheduled notifications and their delivery state.
    ///
    /// The `id` column is the primary key (UUID). `status` holds the
    /// snake-case lifecycle name and is constrained by a CHECK.
    notifications (id) {
        /// Primary key: caller-supplied or generated UUID.
        id -> Uuid,
        /// Opaque channel-interpreted body.
        payload -> Bytea,
        /// Channel-specific address.
        target -> Text,
        /// Sender selector.
        channel -> Text,
        /// Lifecycle status (`pending`, `in_process`, `sent`, `failed`, `canceled`).
        status -> Text,
        /// Earliest delivery instant.
        scheduled_at -> Timestamptz,
        /// Record creation timestamp.
        created_at -> Timestamptz,
        /// Last status mutation; drives the visibility timeout.
        updated_at -> Timestamptz,
        /// Failed attempts so far.
        retry_count -> Int4,
        /// Most recent failure message.
        last_error -> Nullable<Text>,
    }
}
