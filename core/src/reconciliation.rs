//! Reconciliation log types.
//!
//! The reconciliation log is a durable, append-only record of every compensation
//! attempt and its outcome. It is the safety net for the one case the saga cannot
//! repair on its own: capacity was taken, no booking exists, and giving the capacity
//! back failed as well.

use crate::error::StoreError;
use crate::types::{BookingId, EventId, RequestId, UserId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Identifier of a reconciliation log entry.
pub type ReconciliationId = i64;

/// How urgently an outcome needs a human.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Recorded for the audit trail; nothing to do
    Info,
    /// Capacity may be under-counted; reconciliation will heal it
    Warning,
    /// Capacity is under-counted with no booking to show for it
    Critical,
}

impl Severity {
    /// Convert severity to its string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// Parse severity from its string representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            _ => Err(StoreError::Corrupt(format!("Invalid severity: {s}"))),
        }
    }
}

/// What happened, as recorded in the reconciliation log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompensationOutcome {
    /// Ledger write failed, capacity was restored
    Compensated {
        /// Booking request
        request_id: RequestId,
        /// Event whose capacity was restored
        event_id: EventId,
        /// Tickets restored
        tickets: u32,
        /// Why the ledger write failed
        ledger_error: String,
    },
    /// Ledger write failed and restoring capacity failed too
    CompensationFailed {
        /// Booking request
        request_id: RequestId,
        /// Event whose capacity is under-counted
        event_id: EventId,
        /// Requester
        user_id: UserId,
        /// Tickets that were not returned
        tickets: u32,
        /// Why the ledger write failed
        ledger_error: String,
        /// Why the restore failed
        restore_error: String,
    },
    /// Booking was cancelled but its tickets could not be returned
    CancellationRestoreFailed {
        /// Cancelled booking
        booking_id: BookingId,
        /// Event whose capacity is under-counted
        event_id: EventId,
        /// Tickets that were not returned
        tickets: u32,
        /// Why the restore failed
        restore_error: String,
    },
    /// A stale intent with no booking row: capacity may have been taken and never recorded
    OrphanedReservation {
        /// Booking request
        request_id: RequestId,
        /// Event whose capacity may be under-counted
        event_id: EventId,
        /// Requester
        user_id: UserId,
        /// Tickets possibly taken
        tickets: u32,
        /// When the intent was written
        intent_created_at: DateTime<Utc>,
    },
    /// Capacity counter disagrees with the ledger at audit time
    CapacityDrift {
        /// Audited event
        event_id: EventId,
        /// Event total
        total: u32,
        /// Event available counter
        available: u32,
        /// Sum of tickets over confirmed bookings
        confirmed: u64,
    },
}

impl CompensationOutcome {
    /// Severity of this outcome
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Compensated { .. } => Severity::Info,
            Self::CancellationRestoreFailed { .. } | Self::CapacityDrift { .. } => Severity::Warning,
            Self::CompensationFailed { .. } | Self::OrphanedReservation { .. } => Severity::Critical,
        }
    }

    /// Whether an operator has to look at this entry
    #[must_use]
    pub const fn requires_action(&self) -> bool {
        !matches!(self.severity(), Severity::Info)
    }

    /// Short stable label, used for storage and metrics tags
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Compensated { .. } => "compensated",
            Self::CompensationFailed { .. } => "compensation_failed",
            Self::CancellationRestoreFailed { .. } => "cancellation_restore_failed",
            Self::OrphanedReservation { .. } => "orphaned_reservation",
            Self::CapacityDrift { .. } => "capacity_drift",
        }
    }

    /// Event concerned by this outcome
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        match self {
            Self::Compensated { event_id, .. }
            | Self::CompensationFailed { event_id, .. }
            | Self::CancellationRestoreFailed { event_id, .. }
            | Self::OrphanedReservation { event_id, .. }
            | Self::CapacityDrift { event_id, .. } => *event_id,
        }
    }

    /// Status a freshly recorded entry starts in
    #[must_use]
    pub const fn initial_status(&self) -> ReconciliationStatus {
        if self.requires_action() {
            ReconciliationStatus::Pending
        } else {
            ReconciliationStatus::Resolved
        }
    }
}

/// Status of a reconciliation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    /// Awaiting investigation/repair
    Pending,
    /// Repaired, or informational only
    Resolved,
    /// Closed without repair (e.g. confirmed false positive)
    Discarded,
}

impl ReconciliationStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::Corrupt(format!("Invalid reconciliation status: {s}"))),
        }
    }
}

/// A recorded outcome plus its review metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationEntry {
    /// Entry identifier
    pub id: ReconciliationId,
    /// What happened
    pub outcome: CompensationOutcome,
    /// Severity at record time
    pub severity: Severity,
    /// Review status
    pub status: ReconciliationStatus,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
    /// When it was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Resolution notes
    pub resolution_notes: Option<String>,
}

/// Append-only sink for compensation outcomes.
///
/// A failed `record` must never be ignored by the caller: for critical outcomes it
/// means a discrepancy exists that nobody will find.
pub trait ReconciliationSink: Send + Sync {
    /// Durably append an outcome and return its entry id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the entry could not be made durable.
    fn record(
        &self,
        outcome: CompensationOutcome,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<ReconciliationId, StoreError>>;
}
