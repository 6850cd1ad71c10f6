//! Shared fixtures for the coordinator integration tests.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
#![allow(dead_code)] // Not every test binary uses every fixture

use boxoffice_core::reconciliation::{CompensationOutcome, ReconciliationId};
use boxoffice_core::environment::Clock;
use boxoffice_core::{BookingError, BookingReceipt, DateTime, EventId, RequestId, StoreError, Utc, UserId};
use boxoffice_runtime::{BookingCoordinator, BookingObserver, BookingRequest, BookingStage, CoordinatorConfig, RetryPolicy};
use boxoffice_testing::helpers::{TestStores, init_tracing, next_request_id};
use boxoffice_testing::mocks::test_epoch;
use boxoffice_testing::ManualClock;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything the observer was told.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub stages: Mutex<Vec<(RequestId, BookingStage, BookingStage)>>,
    pub confirmed: Mutex<Vec<BookingReceipt>>,
    pub failed: Mutex<Vec<BookingError>>,
    pub recorded: Mutex<Vec<(CompensationOutcome, ReconciliationId)>>,
    pub unrecorded: Mutex<Vec<CompensationOutcome>>,
    pub timeouts: Mutex<Vec<(&'static str, &'static str)>>,
}

impl RecordingObserver {
    /// Stages visited by one request, starting with `Start`.
    pub fn path(&self, request_id: &str) -> Vec<BookingStage> {
        let stages = self.stages.lock().unwrap();
        let mut path = vec![BookingStage::Start];
        path.extend(
            stages
                .iter()
                .filter(|(id, _, _)| id.as_str() == request_id)
                .map(|(_, _, to)| *to),
        );
        path
    }
}

impl BookingObserver for RecordingObserver {
    fn stage_changed(&self, request_id: &RequestId, from: BookingStage, to: BookingStage) {
        self.stages.lock().unwrap().push((request_id.clone(), from, to));
    }

    fn booking_confirmed(&self, receipt: &BookingReceipt, _elapsed: Duration) {
        self.confirmed.lock().unwrap().push(receipt.clone());
    }

    fn booking_failed(&self, error: &BookingError, _elapsed: Duration) {
        self.failed.lock().unwrap().push(error.clone());
    }

    fn discrepancy_recorded(&self, outcome: &CompensationOutcome, id: ReconciliationId) {
        self.recorded.lock().unwrap().push((outcome.clone(), id));
    }

    fn discrepancy_unrecorded(&self, outcome: &CompensationOutcome, _error: &StoreError) {
        self.unrecorded.lock().unwrap().push(outcome.clone());
    }

    fn store_timeout(&self, store: &'static str, operation: &'static str, _after: Duration) {
        self.timeouts.lock().unwrap().push((store, operation));
    }
}

/// Tight timeouts and near-zero backoff so failure tests stay fast.
pub fn fast_config() -> CoordinatorConfig {
    let quick = RetryPolicy::builder()
        .max_retries(3)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(false)
        .build();
    CoordinatorConfig {
        store_timeout: Duration::from_millis(200),
        retry: quick.clone(),
        compensation_retry: quick,
        intent_journal: true,
        intent_grace: Duration::from_secs(300),
        abort_on_unrecorded_discrepancy: false,
    }
}

pub struct Harness {
    pub stores: TestStores,
    pub clock: Arc<ManualClock>,
    pub observer: Arc<RecordingObserver>,
    pub coordinator: BookingCoordinator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        init_tracing();
        let stores = TestStores::new();
        let clock = Arc::new(ManualClock::new(test_epoch()));
        let observer = Arc::new(RecordingObserver::default());
        let coordinator = BookingCoordinator::new(
            Arc::new(stores.capacity.clone()),
            Arc::new(stores.ledger.clone()),
            Arc::new(stores.reconciliation.clone()),
            clock.clone(),
        )
        .with_observer(observer.clone())
        .with_config(config);

        Self {
            stores,
            clock,
            observer,
            coordinator,
        }
    }

    /// Fresh user, fresh request id.
    pub fn request(&self, event_id: EventId, tickets: u32) -> BookingRequest {
        BookingRequest {
            event_id,
            user_id: UserId::new(),
            tickets,
            request_id: next_request_id(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn available(&self, event_id: EventId) -> u32 {
        self.stores.capacity.available(event_id).unwrap()
    }

    pub async fn assert_invariant(&self, event_id: EventId) {
        assert!(
            self.stores.invariant_holds(event_id).await,
            "available + confirmed != total for {event_id}"
        );
    }
}
