//! `PostgreSQL` adapters for the boxoffice booking coordinator.
//!
//! This crate provides:
//!
//! - [`PostgresLedgerStore`]: the Ledger Store. Booking rows, the unique request id
//!   constraint that backs idempotency, checked status transitions, and the reservation
//!   intent journal.
//! - [`PostgresReconciliationLog`]: the durable, append-only Reconciliation Log, with the
//!   operator workflow (list, resolve, discard).
//!
//! Both share one connection pool. Schema lives in `migrations/` and is applied with
//! [`migrate`].
//!
//! # Example
//!
//! ```no_run
//! use boxoffice_postgres::{PostgresLedgerStore, PostgresReconciliationLog, connect, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/boxoffice", 10).await?;
//! migrate(&pool).await?;
//! let ledger = PostgresLedgerStore::new(pool.clone());
//! let log = PostgresReconciliationLog::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use boxoffice_core::StoreError;
use sqlx::postgres::PgPoolOptions;

mod ledger;
mod reconciliation_log;

pub use ledger::{PgLedgerTransaction, PostgresLedgerStore};
pub use reconciliation_log::PostgresReconciliationLog;
pub use sqlx::PgPool;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Failed to connect to ledger database: {e}")))
}

/// Apply the bundled schema migrations.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("Migration failed: {e}")))?;
    tracing::info!("Ledger schema is up to date");
    Ok(())
}

/// Translate a driver error into the adapter-level taxonomy.
///
/// Connection-level failures are transient; decode failures mean the row itself is
/// bad. Constraint violations are mapped by the caller, which knows which constraint
/// it was guarding.
pub(crate) fn store_error(context: &str, error: &sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("{context}: {error}"))
        }
        _ => StoreError::Unavailable(format!("{context}: {error}")),
    }
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_is_not_found() {
        assert_eq!(store_error("find", &sqlx::Error::RowNotFound), StoreError::NotFound);
    }

    #[test]
    fn pool_exhaustion_is_transient() {
        let error = store_error("begin", &sqlx::Error::PoolTimedOut);
        assert!(error.is_transient());
        assert!(error.to_string().contains("begin"));
    }

    #[test]
    fn missing_column_is_corrupt() {
        let error = store_error("decode", &sqlx::Error::ColumnNotFound("tickets".to_string()));
        assert!(matches!(error, StoreError::Corrupt(_)));
        assert!(!is_unique_violation(&sqlx::Error::PoolClosed));
    }
}
