//! Durable reconciliation log.
//!
//! Outcomes are inserted once and never deleted. The only permitted change is the
//! operator workflow: a `pending` row may move to `resolved` or `discarded`, carrying
//! who closed it and why. A trigger in the schema enforces this even for writers that
//! bypass this type.

use crate::ledger::decode;
use crate::store_error;
use boxoffice_core::reconciliation::{
    CompensationOutcome, ReconciliationEntry, ReconciliationId, ReconciliationSink, ReconciliationStatus,
    Severity,
};
use boxoffice_core::{BoxFuture, DateTime, StoreError, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgRow;

const ENTRY_COLUMNS: &str = "id, kind, severity, event_id, outcome, status, recorded_at, \
                             resolved_at, resolved_by, resolution_notes";

/// `PostgreSQL`-backed reconciliation log.
///
/// # Example
///
/// ```no_run
/// use boxoffice_postgres::PostgresReconciliationLog;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let log = PostgresReconciliationLog::new(pool);
///
/// for entry in log.list_pending(100).await? {
///     println!("{} {:?}", entry.id, entry.outcome);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PostgresReconciliationLog {
    pool: PgPool,
}

impl PostgresReconciliationLog {
    /// Create a log over the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be decoded.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<ReconciliationEntry>, StoreError> {
        self.list_by_status(ReconciliationStatus::Pending, limit).await
    }

    /// Entries in the given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be decoded.
    pub async fn list_by_status(
        &self,
        status: ReconciliationStatus,
        limit: usize,
    ) -> Result<Vec<ReconciliationEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM reconciliation_log \
             WHERE status = $1 ORDER BY recorded_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("Failed to list reconciliation entries", &e))?;

        rows.iter().map(row_to_entry).collect()
    }

    /// A single entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the row cannot be decoded.
    pub async fn get_by_id(&self, id: ReconciliationId) -> Result<Option<ReconciliationEntry>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM reconciliation_log WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("Failed to load reconciliation entry", &e))?;

        row.as_ref().map(row_to_entry).transpose()
    }

    /// Close a pending entry after the discrepancy was repaired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no pending entry has this id.
    pub async fn mark_resolved(
        &self,
        id: ReconciliationId,
        resolved_by: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<ReconciliationEntry, StoreError> {
        let entry = self
            .close(id, ReconciliationStatus::Resolved, resolved_by, notes, at)
            .await?;

        tracing::info!(reconciliation_id = id, resolved_by, "Reconciliation entry resolved");
        metrics::counter!("reconciliation_closed_total", "status" => "resolved").increment(1);
        Ok(entry)
    }

    /// Close a pending entry without repair, e.g. a confirmed false positive.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no pending entry has this id.
    pub async fn mark_discarded(
        &self,
        id: ReconciliationId,
        resolved_by: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<ReconciliationEntry, StoreError> {
        let entry = self
            .close(id, ReconciliationStatus::Discarded, resolved_by, Some(reason), at)
            .await?;

        tracing::warn!(reconciliation_id = id, resolved_by, reason, "Reconciliation entry discarded");
        metrics::counter!("reconciliation_closed_total", "status" => "discarded").increment(1);
        Ok(entry)
    }

    /// Number of entries awaiting an operator.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn count_pending(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reconciliation_log WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_error("Failed to count pending reconciliation entries", &e))?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn close(
        &self,
        id: ReconciliationId,
        status: ReconciliationStatus,
        resolved_by: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<ReconciliationEntry, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE reconciliation_log \
             SET status = $2, resolved_at = $3, resolved_by = $4, resolution_notes = $5 \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(at)
        .bind(resolved_by)
        .bind(notes)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to close reconciliation entry", &e))?;

        row.as_ref().map(row_to_entry).transpose()?.ok_or(StoreError::NotFound)
    }
}

impl ReconciliationSink for PostgresReconciliationLog {
    fn record(
        &self,
        outcome: CompensationOutcome,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<ReconciliationId, StoreError>> {
        Box::pin(async move {
            let payload = serde_json::to_value(&outcome)
                .map_err(|e| StoreError::Corrupt(format!("Failed to serialize outcome: {e}")))?;
            let severity = outcome.severity();

            let (id,): (i64,) = sqlx::query_as(
                r"
                INSERT INTO reconciliation_log (kind, severity, event_id, outcome, status, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id
                ",
            )
            .bind(outcome.kind())
            .bind(severity.as_str())
            .bind(*outcome.event_id().as_uuid())
            .bind(payload)
            .bind(outcome.initial_status().as_str())
            .bind(at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_error("Failed to record reconciliation entry", &e))?;

            if outcome.requires_action() {
                tracing::warn!(
                    reconciliation_id = id,
                    kind = outcome.kind(),
                    severity = severity.as_str(),
                    event_id = %outcome.event_id(),
                    "Reconciliation entry recorded"
                );
            } else {
                tracing::info!(reconciliation_id = id, kind = outcome.kind(), "Reconciliation entry recorded");
            }
            metrics::counter!("reconciliation_log_inserts_total", "kind" => outcome.kind()).increment(1);

            Ok(id)
        })
    }
}

fn row_to_entry(row: &PgRow) -> Result<ReconciliationEntry, StoreError> {
    let kind: String = decode(row, "kind")?;
    let severity: String = decode(row, "severity")?;
    let status: String = decode(row, "status")?;
    let payload: serde_json::Value = decode(row, "outcome")?;

    let outcome: CompensationOutcome = serde_json::from_value(payload)
        .map_err(|e| StoreError::Corrupt(format!("Invalid outcome payload: {e}")))?;
    if outcome.kind() != kind {
        return Err(StoreError::Corrupt(format!(
            "Outcome payload is {} but row kind is {kind}",
            outcome.kind()
        )));
    }

    Ok(ReconciliationEntry {
        id: decode(row, "id")?,
        outcome,
        severity: Severity::parse(&severity)?,
        status: ReconciliationStatus::parse(&status)?,
        recorded_at: decode(row, "recorded_at")?,
        resolved_at: decode(row, "resolved_at")?,
        resolved_by: decode(row, "resolved_by")?,
        resolution_notes: decode(row, "resolution_notes")?,
    })
}
