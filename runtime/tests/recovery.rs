//! Recovery sweep over stale reservation intents, and the capacity audit.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use boxoffice_core::capacity::CapacityStore;
use boxoffice_core::ledger::{IntentState, ReservationIntent};
use boxoffice_core::reconciliation::{CompensationOutcome, ReconciliationStatus, Severity};
use boxoffice_core::{AttemptId, BookingError, BookingId, EventId, NewBooking, RequestId, TicketCount, UserId};
use boxoffice_runtime::SweepReport;
use boxoffice_testing::faults::unavailable;
use boxoffice_testing::helpers::next_request_id;
use common::Harness;

/// Leave behind what a process killed right after reserving would leave.
async fn crashed_reservation(h: &Harness, event_id: EventId, tickets: u32) -> ReservationIntent {
    let tickets = TicketCount::new(tickets).unwrap();
    let intent = ReservationIntent::pending(
        RequestId::new(next_request_id()).unwrap(),
        event_id,
        UserId::new(),
        tickets,
        h.now(),
    );
    h.stores.ledger.insert_intent(intent.clone());
    h.stores
        .capacity
        .reserve(event_id, tickets, &intent.request_id, AttemptId::new())
        .await
        .unwrap();
    intent
}

fn past_grace(h: &Harness) {
    h.clock.advance(chrono::Duration::minutes(6));
}

#[tokio::test]
async fn orphaned_reservation_is_flagged() {
    let h = Harness::new();
    let event_id = h.stores.event_with_capacity(10);
    let intent = crashed_reservation(&h, event_id, 3).await;
    past_grace(&h);

    let sweep = h.coordinator.recovery_sweep();
    let report = sweep.sweep(sweep.now()).await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            examined: 1,
            completed: 0,
            orphaned: 1,
            unrecorded: 0,
        }
    );
    let pending = h.stores.reconciliation.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].severity, Severity::Critical);
    assert_eq!(
        pending[0].outcome,
        CompensationOutcome::OrphanedReservation {
            request_id: intent.request_id.clone(),
            event_id,
            user_id: intent.user_id,
            tickets: 3,
            intent_created_at: intent.created_at,
        }
    );
    assert_eq!(
        h.stores.ledger.intent(&intent.request_id).unwrap().state,
        IntentState::Orphaned
    );
    // The sweep flags, it does not repair
    assert_eq!(h.available(event_id), 7);

    let again = sweep.sweep(sweep.now()).await.unwrap();
    assert_eq!(again.examined, 0);
    assert_eq!(h.stores.reconciliation.len(), 1);
}

#[tokio::test]
async fn intent_with_a_booking_is_completed() {
    let h = Harness::new();
    let event_id = h.stores.event_with_capacity(10);
    let intent = crashed_reservation(&h, event_id, 2).await;
    h.stores.ledger.insert_booking(
        NewBooking {
            id: BookingId::new(),
            event_id,
            user_id: intent.user_id,
            tickets: intent.tickets,
            request_id: intent.request_id.clone(),
            created_at: intent.created_at,
        }
        .into_booking(),
    );
    past_grace(&h);

    let sweep = h.coordinator.recovery_sweep();
    let report = sweep.sweep(sweep.now()).await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(report.orphaned, 0);
    assert!(h.stores.reconciliation.is_empty());
    assert_eq!(
        h.stores.ledger.intent(&intent.request_id).unwrap().state,
        IntentState::Completed
    );
    h.assert_invariant(event_id).await;
}

#[tokio::test]
async fn recent_intents_are_left_alone() {
    let h = Harness::new();
    let event_id = h.stores.event_with_capacity(10);
    let intent = crashed_reservation(&h, event_id, 1).await;
    h.clock.advance(chrono::Duration::seconds(30));

    let sweep = h.coordinator.recovery_sweep();
    let report = sweep.sweep(sweep.now()).await.unwrap();

    assert_eq!(report, SweepReport::default());
    assert!(h.stores.ledger.intent(&intent.request_id).unwrap().state.is_pending());
}

#[tokio::test]
async fn resolved_intents_are_never_swept() {
    let h = Harness::new();
    let event_id = h.stores.event_with_capacity(10);
    h.coordinator.book_tickets(h.request(event_id, 2)).await.unwrap();
    h.coordinator.book_tickets(h.request(event_id, 9)).await.unwrap_err();
    past_grace(&h);

    let sweep = h.coordinator.recovery_sweep();
    let report = sweep.sweep(sweep.now()).await.unwrap();

    assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn unrecordable_orphan_stays_pending_for_next_sweep() {
    let h = Harness::new();
    let event_id = h.stores.event_with_capacity(10);
    let intent = crashed_reservation(&h, event_id, 4).await;
    past_grace(&h);
    h.stores.reconciliation.faults().fail_next(unavailable("log volume gone"));

    let sweep = h.coordinator.recovery_sweep();
    let first = sweep.sweep(sweep.now()).await.unwrap();
    assert_eq!(first.unrecorded, 1);
    assert!(h.stores.ledger.intent(&intent.request_id).unwrap().state.is_pending());
    assert_eq!(h.observer.unrecorded.lock().unwrap().len(), 1);

    let second = sweep.sweep(sweep.now()).await.unwrap();
    assert_eq!(second.orphaned, 1);
    assert_eq!(h.stores.reconciliation.pending().len(), 1);
}

#[tokio::test]
async fn sweep_honours_batch_size() {
    let h = Harness::new();
    let event_id = h.stores.event_with_capacity(10);
    for _ in 0..3 {
        crashed_reservation(&h, event_id, 1).await;
        h.clock.advance(chrono::Duration::seconds(1));
    }
    past_grace(&h);

    let sweep = h.coordinator.recovery_sweep().with_batch_size(2);
    assert_eq!(sweep.sweep(sweep.now()).await.unwrap().orphaned, 2);
    assert_eq!(sweep.sweep(sweep.now()).await.unwrap().orphaned, 1);
    assert_eq!(sweep.sweep(sweep.now()).await.unwrap().examined, 0);
}

#[tokio::test]
async fn failed_reserve_call_leaves_an_intent_for_the_sweep() {
    let h = Harness::new();
    let event_id = h.stores.event_with_capacity(10);
    h.stores.capacity.faults().reserve.fail_next(unavailable("connection reset"));
    let request = h.request(event_id, 2);

    let error = h.coordinator.book_tickets(request.clone()).await.unwrap_err();
    assert!(error.is_retryable());
    past_grace(&h);

    let sweep = h.coordinator.recovery_sweep();
    let report = sweep.sweep(sweep.now()).await.unwrap();

    // The decrement never happened, but the sweep cannot know that
    assert_eq!(report.orphaned, 1);
    assert_eq!(h.available(event_id), 10);
}

#[tokio::test]
async fn listing_failure_is_reported() {
    let h = Harness::new();
    h.stores.ledger.faults().read.fail_next(unavailable("replica down"));

    let sweep = h.coordinator.recovery_sweep();
    assert!(sweep.sweep(sweep.now()).await.is_err());
}

#[tokio::test]
async fn audit_of_a_healthy_event() {
    let h = Harness::new();
    let event_id = h.stores.event_with_capacity(10);
    h.coordinator.book_tickets(h.request(event_id, 3)).await.unwrap();
    h.coordinator.book_tickets(h.request(event_id, 4)).await.unwrap();

    let report = h.coordinator.recovery_sweep().audit(event_id).await.unwrap();

    assert!(report.is_consistent());
    assert_eq!(report.confirmed, 7);
    assert_eq!(report.event.available, 3);
    assert_eq!(report.reconciliation_id, None);
    assert!(h.stores.reconciliation.is_empty());
}

#[tokio::test]
async fn audit_records_drift() {
    let h = Harness::new();
    let event_id = h.stores.event_with_capacity(10);
    h.coordinator.book_tickets(h.request(event_id, 3)).await.unwrap();
    h.stores.capacity.force_available(event_id, 5);

    let report = h.coordinator.recovery_sweep().audit(event_id).await.unwrap();

    assert_eq!(report.drift, 2);
    assert_eq!(report.reconciliation_id, Some(1));
    let entries = h.stores.reconciliation.entries();
    assert_eq!(entries[0].status, ReconciliationStatus::Pending);
    assert_eq!(entries[0].severity, Severity::Warning);
    assert_eq!(
        entries[0].outcome,
        CompensationOutcome::CapacityDrift {
            event_id,
            total: 10,
            available: 5,
            confirmed: 3,
        }
    );
}

#[tokio::test]
async fn audit_of_unknown_event() {
    let h = Harness::new();
    let missing = EventId::new();

    let error = h.coordinator.recovery_sweep().audit(missing).await.unwrap_err();

    assert_eq!(error, BookingError::EventNotFound(missing));
}
