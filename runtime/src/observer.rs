//! Observability hooks for the coordinator.
//!
//! The coordinator never logs through a global sink of its own; it reports to the
//! [`BookingObserver`] it was constructed with. [`TracingObserver`] is the default and
//! turns every hook into a `tracing` event plus the matching Prometheus counter.

use crate::metrics::{BookingMetrics, ReconciliationMetrics, StoreMetrics};
use crate::saga::BookingStage;
use boxoffice_core::reconciliation::{CompensationOutcome, ReconciliationId, Severity};
use boxoffice_core::{Booking, BookingError, BookingReceipt, ErrorClass, RequestId, StoreError};
use std::time::Duration;

/// Receives saga progress and outcomes.
///
/// Every method has an empty default so implementations only override what they need.
pub trait BookingObserver: Send + Sync {
    /// A booking operation moved between stages.
    fn stage_changed(&self, _request_id: &RequestId, _from: BookingStage, _to: BookingStage) {}

    /// A booking succeeded (freshly, or replayed from an earlier request).
    fn booking_confirmed(&self, _receipt: &BookingReceipt, _elapsed: Duration) {}

    /// A booking failed.
    fn booking_failed(&self, _error: &BookingError, _elapsed: Duration) {}

    /// A booking was cancelled.
    fn booking_cancelled(&self, _booking: &Booking) {}

    /// A compensation or recovery outcome was written to the reconciliation log.
    fn discrepancy_recorded(&self, _outcome: &CompensationOutcome, _id: ReconciliationId) {}

    /// A compensation or recovery outcome could not be written anywhere.
    fn discrepancy_unrecorded(&self, _outcome: &CompensationOutcome, _error: &StoreError) {}

    /// A store call exceeded its deadline.
    fn store_timeout(&self, _store: &'static str, _operation: &'static str, _after: Duration) {}
}

/// Observer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl BookingObserver for NoopObserver {}

/// Default observer: `tracing` events and Prometheus counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl BookingObserver for TracingObserver {
    fn stage_changed(&self, request_id: &RequestId, from: BookingStage, to: BookingStage) {
        tracing::debug!(%request_id, %from, %to, "Booking stage changed");
    }

    fn booking_confirmed(&self, receipt: &BookingReceipt, elapsed: Duration) {
        if receipt.replayed {
            BookingMetrics::record_replayed();
            tracing::info!(
                booking_id = %receipt.booking.id,
                request_id = %receipt.booking.request_id,
                "Booking replayed from earlier request"
            );
        } else {
            BookingMetrics::record_confirmed(elapsed);
            tracing::info!(
                booking_id = %receipt.booking.id,
                event_id = %receipt.booking.event_id,
                tickets = receipt.booking.tickets.get(),
                available = receipt.event.available,
                elapsed_ms = elapsed.as_millis(),
                "Booking confirmed"
            );
        }
    }

    fn booking_failed(&self, error: &BookingError, elapsed: Duration) {
        BookingMetrics::record_rejected(error.kind());
        match error.class() {
            // Business outcomes are not failures of the system
            ErrorClass::Rejected => {
                tracing::debug!(reason = error.kind(), %error, "Booking rejected");
            }
            ErrorClass::Transient => {
                tracing::warn!(%error, elapsed_ms = elapsed.as_millis(), "Booking failed on a store error");
            }
            ErrorClass::Critical => {
                tracing::error!(%error, alert = true, "Booking left capacity and ledger out of step");
            }
        }
    }

    fn booking_cancelled(&self, booking: &Booking) {
        BookingMetrics::record_cancelled();
        tracing::info!(
            booking_id = %booking.id,
            event_id = %booking.event_id,
            tickets = booking.tickets.get(),
            "Booking cancelled"
        );
    }

    fn discrepancy_recorded(&self, outcome: &CompensationOutcome, id: ReconciliationId) {
        ReconciliationMetrics::record_entry(outcome.kind());
        match outcome {
            CompensationOutcome::Compensated { .. } => BookingMetrics::record_compensation("restored"),
            CompensationOutcome::CompensationFailed { .. } => BookingMetrics::record_compensation("failed"),
            _ => {}
        }
        match outcome.severity() {
            Severity::Info => tracing::info!(reconciliation_id = id, kind = outcome.kind(), "Reconciliation entry recorded"),
            Severity::Warning => tracing::warn!(
                reconciliation_id = id,
                kind = outcome.kind(),
                event_id = %outcome.event_id(),
                "Reconciliation entry recorded"
            ),
            Severity::Critical => tracing::error!(
                reconciliation_id = id,
                kind = outcome.kind(),
                event_id = %outcome.event_id(),
                alert = true,
                "Critical reconciliation entry recorded"
            ),
        }
    }

    fn discrepancy_unrecorded(&self, outcome: &CompensationOutcome, error: &StoreError) {
        ReconciliationMetrics::record_unrecorded(outcome.kind());
        if matches!(outcome, CompensationOutcome::CompensationFailed { .. }) {
            BookingMetrics::record_compensation("failed");
        }
        tracing::error!(
            alert = true,
            kind = outcome.kind(),
            event_id = %outcome.event_id(),
            %error,
            ?outcome,
            "Discrepancy could not be written to the reconciliation log"
        );
    }

    fn store_timeout(&self, store: &'static str, operation: &'static str, after: Duration) {
        StoreMetrics::record_timeout(store);
        tracing::warn!(store, operation, timeout_ms = after.as_millis(), "Store call timed out");
    }
}
