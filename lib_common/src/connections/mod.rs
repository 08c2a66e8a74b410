//! # Connections Module
//!
//! PostgreSQL-backed implementations of the core's storage seams. All stores
//! share one `deadpool_postgres` pool created by [`db_postgres::Database`].

/// Connection pool and schema management.
pub mod db_postgres;

/// Reservation ledger on the `match_history` table.
pub mod pg_reservations;

/// Settings and per-owner country sets.
pub mod pg_settings;

pub use db_postgres::Database;
pub use pg_reservations::PgReservationStore;
pub use pg_settings::PgSettingsStore;
