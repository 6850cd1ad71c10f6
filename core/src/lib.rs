//! # Boxoffice Core
//!
//! Domain types, error taxonomy and store traits for booking tickets across two
//! independently transactional stores.
//!
//! ## Core Concepts
//!
//! - **Capacity Store**: store of record for an event's total/available ticket counts.
//!   Its atomic conditional decrement is the only serialization point for bookings.
//!   Each decrement is held per request, so a retried reserve or restore applies once.
//! - **Ledger Store**: transactional store of record for booking rows.
//! - **Reconciliation Sink**: append-only record of compensation outcomes.
//! - **Saga**: reserve capacity, write the ledger row, compensate on failure.
//!
//! The coordinator that drives the saga lives in `boxoffice-runtime`; adapters live in
//! `boxoffice-postgres` (ledger, reconciliation log) and `boxoffice-redis` (capacity).
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_core::capacity::{CapacityStore, ReserveOutcome};
//!
//! async fn take_two<C: CapacityStore + ?Sized>(
//!     store: &C,
//!     event: EventId,
//!     request_id: &RequestId,
//! ) -> Result<(), StoreError> {
//!     match store.reserve(event, TicketCount::new(2)?, request_id, AttemptId::new()).await? {
//!         ReserveOutcome::Reserved { available } => println!("{available} left"),
//!         ReserveOutcome::Insufficient { available } => println!("only {available} left"),
//!         ReserveOutcome::HeldByOtherAttempt => println!("already in flight"),
//!         ReserveOutcome::NotFound => println!("no such event"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod capacity;
pub mod error;
pub mod ledger;
pub mod reconciliation;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use futures::future::BoxFuture;

pub use error::{BookingError, ErrorClass, StoreError, ValidationError};
pub use types::{
    AttemptId, Booking, BookingId, BookingReceipt, BookingStatus, Event, EventId, EventSnapshot, NewBooking,
    Page, RequestId, RequesterRole, TicketCount, UserId,
};

/// Environment module - injected dependencies that are not stores.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Event expiry and intent staleness are both judged against this clock, so tests
    /// can pin "now" instead of racing the wall clock.
    ///
    /// # Examples
    ///
    /// ```
    /// use boxoffice_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
