//! Ledger Store abstraction.
//!
//! The Ledger Store keeps one row per booking and offers local ACID transactions.
//! Booking rows are created only after capacity has been reserved, and the only
//! mutation they ever see is the checked `Confirmed -> Cancelled` transition.
//!
//! # Transactions
//!
//! [`LedgerStore::begin`] hands out a [`LedgerTransaction`]. Nothing it writes is
//! visible until [`LedgerTransaction::commit`]; dropping it uncommitted rolls it back.
//! Use [`with_transaction`] to get commit-on-`Ok` / rollback-on-`Err` for free:
//!
//! ```ignore
//! let booking = with_transaction(ledger.as_ref(), |tx| {
//!     Box::pin(async move { tx.create_booking(new_booking).await })
//! })
//! .await?;
//! ```
//!
//! # Reservation intents
//!
//! Before capacity is decremented the coordinator can journal a [`ReservationIntent`].
//! A crash between the decrement and the ledger commit then leaves a `Pending` intent
//! behind that a recovery sweep can find, instead of leaving no trace at all.

use crate::error::StoreError;
use crate::types::{Booking, BookingId, BookingStatus, EventId, NewBooking, Page, RequestId, TicketCount, UserId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An open ledger transaction.
///
/// Implementations roll back on drop if neither `commit` nor `rollback` was called.
pub trait LedgerTransaction: Send {
    /// Insert a CONFIRMED booking row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateRequest`] when a row with the same request id
    /// exists (committed or concurrently being inserted), or a transient error.
    fn create_booking(&mut self, booking: NewBooking) -> BoxFuture<'_, Result<Booking, StoreError>>;

    /// Checked status transition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the booking does not exist and
    /// [`StoreError::StatusConflict`] if it is not currently in `from`.
    fn set_status(
        &mut self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Booking, StoreError>>;

    /// Read a booking inside this transaction.
    ///
    /// # Errors
    ///
    /// Returns a transient [`StoreError`] if the read fails.
    fn find_by_id(&mut self, id: BookingId) -> BoxFuture<'_, Result<Option<Booking>, StoreError>>;

    /// Make every write of this transaction durable and visible.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails; nothing was written in that case
    /// unless the error is a [`StoreError::Timeout`], whose outcome is unknown.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;

    /// Discard every write of this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store could not be told; the writes are
    /// discarded anyway once the connection goes away.
    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;
}

/// Ledger Store abstraction.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to be shared across concurrent requests.
pub trait LedgerStore: Send + Sync {
    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when no connection could be obtained.
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn LedgerTransaction>, StoreError>>;

    /// Load a booking by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find_by_id(&self, id: BookingId) -> BoxFuture<'_, Result<Option<Booking>, StoreError>>;

    /// Load the booking created by a given request, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find_by_request_id<'a>(
        &'a self,
        request_id: &'a RequestId,
    ) -> BoxFuture<'a, Result<Option<Booking>, StoreError>>;

    /// List a user's bookings, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find_by_user(&self, user_id: UserId, page: Page) -> BoxFuture<'_, Result<Vec<Booking>, StoreError>>;

    /// Sum of tickets over CONFIRMED bookings for an event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn confirmed_tickets(&self, event_id: EventId) -> BoxFuture<'_, Result<u64, StoreError>>;

    /// Durably journal a reservation intent.
    ///
    /// An intent already journaled under the same request id is reset to
    /// `Pending` only when [`IntentState::is_reopenable`] holds; any other
    /// existing intent is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn record_intent(&self, intent: ReservationIntent) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Move an intent to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no intent exists for the request.
    fn resolve_intent<'a>(
        &'a self,
        request_id: &'a RequestId,
        state: IntentState,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Intents still `Pending` that were created before `older_than`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn stale_intents(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<ReservationIntent>, StoreError>>;
}

/// Run `f` inside a ledger transaction.
///
/// Commits when `f` returns `Ok`, rolls back when it returns `Err`. If the returned
/// future is dropped mid-way the transaction is dropped too, which rolls it back.
///
/// # Errors
///
/// Returns the error from `begin`, from `f`, or from `commit`. A rollback failure
/// after `f` failed is swallowed in favor of `f`'s error.
pub async fn with_transaction<S, T, F>(store: &S, f: F) -> Result<T, StoreError>
where
    S: LedgerStore + ?Sized,
    T: Send,
    F: for<'t> FnOnce(&'t mut dyn LedgerTransaction) -> BoxFuture<'t, Result<T, StoreError>> + Send,
{
    let mut tx = store.begin().await?;
    let result = f(tx.as_mut()).await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => {
            // The store discards uncommitted writes when the connection is released
            let _ = tx.rollback().await;
            Err(error)
        }
    }
}

/// Lifecycle of a reservation intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentState {
    /// Written before the capacity decrement; outcome not yet known
    Pending,
    /// Booking row committed
    Completed,
    /// Capacity store refused the reservation; nothing to undo
    Rejected,
    /// Ledger write failed and capacity was restored
    Compensated,
    /// Ledger write failed and capacity could not be restored
    Unreconciled,
    /// Found stale by the recovery sweep with no booking row; flagged for review
    Orphaned,
}

impl IntentState {
    /// Convert state to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Compensated => "compensated",
            Self::Unreconciled => "unreconciled",
            Self::Orphaned => "orphaned",
        }
    }

    /// Parse state from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the string doesn't match a known state.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            "compensated" => Ok(Self::Compensated),
            "unreconciled" => Ok(Self::Unreconciled),
            "orphaned" => Ok(Self::Orphaned),
            _ => Err(StoreError::Corrupt(format!("Invalid intent state: {s}"))),
        }
    }

    /// Whether the intent still awaits an outcome
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Whether a retry of the same request may journal the intent afresh.
    ///
    /// Only outcomes that left no tickets held qualify.
    #[must_use]
    pub const fn is_reopenable(&self) -> bool {
        matches!(self, Self::Rejected | Self::Compensated)
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a booking attempt, written before capacity is touched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationIntent {
    /// Idempotency key of the attempt
    pub request_id: RequestId,
    /// Event whose capacity is about to be reserved
    pub event_id: EventId,
    /// Who is booking
    pub user_id: UserId,
    /// Tickets about to be reserved
    pub tickets: TicketCount,
    /// Current state
    pub state: IntentState,
    /// When the intent was written
    pub created_at: DateTime<Utc>,
    /// When the intent left `Pending`
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReservationIntent {
    /// A fresh `Pending` intent
    #[must_use]
    pub const fn pending(
        request_id: RequestId,
        event_id: EventId,
        user_id: UserId,
        tickets: TicketCount,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            event_id,
            user_id,
            tickets,
            state: IntentState::Pending,
            created_at,
            resolved_at: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn intent_state_roundtrip() {
        for state in [
            IntentState::Pending,
            IntentState::Completed,
            IntentState::Rejected,
            IntentState::Compensated,
            IntentState::Unreconciled,
            IntentState::Orphaned,
        ] {
            assert_eq!(IntentState::parse(state.as_str()).unwrap(), state);
        }
    }

    #[test]
    fn only_ticketless_outcomes_reopen() {
        let reopenable: Vec<_> = [
            IntentState::Pending,
            IntentState::Completed,
            IntentState::Rejected,
            IntentState::Compensated,
            IntentState::Unreconciled,
            IntentState::Orphaned,
        ]
        .into_iter()
        .filter(IntentState::is_reopenable)
        .collect();
        assert_eq!(reopenable, vec![IntentState::Rejected, IntentState::Compensated]);
    }

    #[test]
    fn intent_state_invalid() {
        assert!(IntentState::parse("lost").is_err());
    }

    #[test]
    fn new_intents_are_pending() {
        let intent = ReservationIntent::pending(
            RequestId::new("req-9").unwrap(),
            EventId::new(),
            UserId::new(),
            TicketCount::new(2).unwrap(),
            Utc::now(),
        );
        assert!(intent.state.is_pending());
        assert!(intent.resolved_at.is_none());
    }
}
