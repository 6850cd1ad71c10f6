//! Recovery sweep and capacity audit.
//!
//! A process that dies between the capacity decrement and the ledger commit leaves a
//! `Pending` reservation intent behind. [`RecoverySweep::sweep`] finds those intents
//! once they are older than the configured grace period:
//!
//! - a booking row with the same request id exists: the intent is marked `Completed`;
//! - no booking row: an `OrphanedReservation` entry is written to the reconciliation
//!   log and the intent is marked `Orphaned`.
//!
//! The sweep never restores capacity itself. It cannot know whether the decrement
//! actually landed, so the repair is left to an operator (or to an audit).
//!
//! [`RecoverySweep::audit`] checks one event's counter against the ledger:
//! `available + confirmed tickets == total`, and records `CapacityDrift` otherwise.

use crate::coordinator::BookingCoordinator;
use boxoffice_core::ledger::{IntentState, ReservationIntent};
use boxoffice_core::reconciliation::{CompensationOutcome, ReconciliationId};
use boxoffice_core::{BookingError, DateTime, EventId, EventSnapshot, StoreError, Utc};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// Intents examined per sweep call.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Stale intents looked at
    pub examined: usize,
    /// Intents whose booking turned out to exist
    pub completed: usize,
    /// Intents flagged as orphaned reservations
    pub orphaned: usize,
    /// Orphans that could not be recorded (left pending for the next sweep)
    pub unrecorded: usize,
}

/// Result of auditing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Event state at audit time
    pub event: EventSnapshot,
    /// Tickets held by confirmed bookings
    pub confirmed: u64,
    /// `total - available - confirmed`; positive means capacity is under-counted
    pub drift: i64,
    /// Reconciliation entry written for a non-zero drift
    pub reconciliation_id: Option<ReconciliationId>,
}

impl AuditReport {
    /// Whether counter and ledger agree
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.drift == 0
    }
}

/// Finds reservations that never reached a terminal state.
#[derive(Debug, Clone)]
pub struct RecoverySweep {
    coordinator: BookingCoordinator,
    batch_size: u32,
}

impl RecoverySweep {
    /// Create a sweep over the coordinator's stores.
    #[must_use]
    pub const fn new(coordinator: BookingCoordinator) -> Self {
        Self {
            coordinator,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Change how many intents one sweep examines.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Examine pending intents older than the grace period.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the intents cannot be listed. Failures on individual
    /// intents are logged and left for the next sweep.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let coordinator = &self.coordinator;
        let grace = TimeDelta::from_std(coordinator.config().intent_grace).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(grace).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale = coordinator
            .timed("ledger", "stale_intents", coordinator.ledger().stale_intents(cutoff, self.batch_size))
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };
        for intent in stale {
            match self.settle(intent, now).await {
                Ok(Settled::Completed) => report.completed += 1,
                Ok(Settled::Orphaned) => report.orphaned += 1,
                Ok(Settled::Unrecorded) => report.unrecorded += 1,
                Err(error) => tracing::warn!(%error, "Could not settle reservation intent"),
            }
        }

        if report.orphaned > 0 || report.unrecorded > 0 {
            tracing::warn!(?report, "Recovery sweep found orphaned reservations");
        } else {
            tracing::info!(?report, "Recovery sweep finished");
        }
        Ok(report)
    }

    async fn settle(&self, intent: ReservationIntent, now: DateTime<Utc>) -> Result<Settled, StoreError> {
        let coordinator = &self.coordinator;
        let booking = coordinator
            .timed(
                "ledger",
                "find_by_request_id",
                coordinator.ledger().find_by_request_id(&intent.request_id),
            )
            .await?;

        if booking.is_some() {
            coordinator
                .timed(
                    "ledger",
                    "resolve_intent",
                    coordinator
                        .ledger()
                        .resolve_intent(&intent.request_id, IntentState::Completed, now),
                )
                .await?;
            return Ok(Settled::Completed);
        }

        let outcome = CompensationOutcome::OrphanedReservation {
            request_id: intent.request_id.clone(),
            event_id: intent.event_id,
            user_id: intent.user_id,
            tickets: intent.tickets.get(),
            intent_created_at: intent.created_at,
        };
        if coordinator.record_discrepancy(outcome).await.is_none() {
            return Ok(Settled::Unrecorded);
        }
        coordinator
            .timed(
                "ledger",
                "resolve_intent",
                coordinator
                    .ledger()
                    .resolve_intent(&intent.request_id, IntentState::Orphaned, now),
            )
            .await?;
        Ok(Settled::Orphaned)
    }

    /// Compare one event's counter with the ledger.
    ///
    /// Only meaningful at quiescence: in-flight bookings show up as transient drift.
    ///
    /// # Errors
    ///
    /// [`BookingError::EventNotFound`] or [`BookingError::Persistence`].
    #[tracing::instrument(skip(self))]
    pub async fn audit(&self, event_id: EventId) -> Result<AuditReport, BookingError> {
        let coordinator = &self.coordinator;
        let event = coordinator
            .timed("capacity", "get", coordinator.capacity().get(event_id))
            .await?
            .ok_or(BookingError::EventNotFound(event_id))?;
        let confirmed = coordinator
            .timed("ledger", "confirmed_tickets", coordinator.ledger().confirmed_tickets(event_id))
            .await?;

        let drift = i64::from(event.total) - i64::from(event.available) - i64::try_from(confirmed).unwrap_or(i64::MAX);
        let mut report = AuditReport {
            event: event.snapshot(),
            confirmed,
            drift,
            reconciliation_id: None,
        };
        if drift != 0 {
            tracing::warn!(
                total = event.total,
                available = event.available,
                confirmed,
                drift,
                "Capacity counter disagrees with the ledger"
            );
            report.reconciliation_id = coordinator
                .record_discrepancy(CompensationOutcome::CapacityDrift {
                    event_id,
                    total: event.total,
                    available: event.available,
                    confirmed,
                })
                .await;
        }
        Ok(report)
    }

    /// Time the sweep considers "now"
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.coordinator.clock().now()
    }
}

enum Settled {
    Completed,
    Orphaned,
    Unrecorded,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn audit_report_consistency() {
        let event = boxoffice_core::Event::new(EventId::new(), 10, Utc::now()).unwrap();
        let report = AuditReport {
            event: event.snapshot(),
            confirmed: 0,
            drift: 0,
            reconciliation_id: None,
        };
        assert!(report.is_consistent());
        assert!(!AuditReport { drift: 2, ..report }.is_consistent());
    }
}
