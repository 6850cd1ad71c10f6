//! # Boxoffice Testing
//!
//! Testing utilities for the booking coordinator.
//!
//! This crate provides:
//! - In-memory implementations of every store trait, with fault injection
//! - Deterministic clocks
//! - Fixtures for events and booking requests
//! - proptest strategies for ticket operations
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_testing::{helpers::TestStores, test_clock};
//! use boxoffice_runtime::{BookingCoordinator, BookingRequest};
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn sells_out() {
//!     let stores = TestStores::new();
//!     let event_id = stores.event_with_capacity(5);
//!     let coordinator = BookingCoordinator::new(
//!         Arc::new(stores.capacity.clone()),
//!         Arc::new(stores.ledger.clone()),
//!         Arc::new(stores.reconciliation.clone()),
//!         Arc::new(test_clock()),
//!     );
//!
//!     coordinator
//!         .book_tickets(BookingRequest { event_id, user_id, tickets: 5, request_id: "r1".into() })
//!         .await
//!         .unwrap();
//!     assert_eq!(stores.capacity.available(event_id), Some(0));
//! }
//! ```

use boxoffice_core::environment::Clock;
use chrono::{DateTime, Utc};

/// In-memory Capacity Store
pub mod capacity;

/// Fault injection switches
pub mod faults;

/// In-memory Ledger Store
pub mod ledger;

/// In-memory Reconciliation Log
pub mod reconciliation;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::Mutex;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use boxoffice_testing::mocks::FixedClock;
    /// use boxoffice_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Used to age reservation intents past the sweep's grace period.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        #[allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// The instant [`test_clock`] is pinned to.
    ///
    /// # Panics
    ///
    /// Never in practice; the timestamp is a constant.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }
}

/// Test helpers and fixtures.
pub mod helpers {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
    #![allow(clippy::missing_panics_doc)] // Fixtures only panic on invalid constants

    use crate::capacity::InMemoryCapacityStore;
    use crate::ledger::InMemoryLedgerStore;
    use crate::mocks::test_epoch;
    use crate::reconciliation::InMemoryReconciliationLog;
    use boxoffice_core::{DateTime, Event, EventId, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// One of each in-memory store.
    #[derive(Clone, Debug, Default)]
    pub struct TestStores {
        /// Capacity Store
        pub capacity: InMemoryCapacityStore,
        /// Ledger Store
        pub ledger: InMemoryLedgerStore,
        /// Reconciliation Log
        pub reconciliation: InMemoryReconciliationLog,
    }

    impl TestStores {
        /// Fresh, empty stores
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Register an event 30 days after the test epoch.
        #[must_use]
        pub fn event_with_capacity(&self, total: u32) -> EventId {
            self.event_on(total, test_epoch() + chrono::Duration::days(30))
        }

        /// Register an event on a given date.
        #[must_use]
        pub fn event_on(&self, total: u32, date: DateTime<Utc>) -> EventId {
            let event = Event::new(EventId::new(), total, date).unwrap();
            let id = event.id;
            self.capacity.register_event(event);
            id
        }

        /// Quiescent invariant: `available + confirmed == total`.
        pub async fn invariant_holds(&self, event_id: EventId) -> bool {
            use boxoffice_core::ledger::LedgerStore;
            let event = self.capacity.event(event_id).unwrap();
            let confirmed = self.ledger.confirmed_tickets(event_id).await.unwrap();
            u64::from(event.available) + confirmed == u64::from(event.total)
        }
    }

    /// Unique request id per call within a test binary.
    #[must_use]
    pub fn next_request_id() -> String {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        format!("req-{}", NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Install a `tracing` subscriber that writes through the test harness.
    ///
    /// Safe to call from every test; only the first call installs it.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use boxoffice_core::types::MAX_TICKETS_PER_BOOKING;
    use proptest::prelude::*;

    /// One step of a random workload against a single event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TicketOp {
        /// Book this many tickets
        Book(u32),
        /// Cancel the n-th confirmed booking (modulo the number of bookings)
        Cancel(usize),
        /// Fail the next ledger commit, forcing a compensation
        FailNextCommit,
    }

    /// Valid ticket counts.
    pub fn ticket_count() -> impl Strategy<Value = u32> {
        1..=MAX_TICKETS_PER_BOOKING
    }

    /// Random workload step.
    pub fn ticket_op() -> impl Strategy<Value = TicketOp> {
        prop_oneof![
            6 => ticket_count().prop_map(TicketOp::Book),
            3 => any::<usize>().prop_map(TicketOp::Cancel),
            1 => Just(TicketOp::FailNextCommit),
        ]
    }

    /// Random workload.
    pub fn ticket_ops(max_len: usize) -> impl Strategy<Value = Vec<TicketOp>> {
        prop::collection::vec(ticket_op(), 1..max_len)
    }
}

// Re-export commonly used items
pub use capacity::InMemoryCapacityStore;
pub use ledger::InMemoryLedgerStore;
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use reconciliation::InMemoryReconciliationLog;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(mocks::test_epoch());
        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(clock.now(), mocks::test_epoch() + chrono::Duration::minutes(10));
    }
}
