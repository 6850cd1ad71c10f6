//! The booking coordinator.
//!
//! Books tickets across two stores that share no transaction: the Capacity Store
//! (atomic conditional decrement of an event's `available` counter) and the Ledger
//! Store (one row per booking). The coordinator runs a saga:
//!
//! 1. Replay: an earlier booking with the same request id is returned as-is.
//! 2. Load the event; refuse events that already took place.
//! 3. Journal a reservation intent (optional, on by default).
//! 4. Reserve capacity under a hold for this request and attempt. `Insufficient` ends
//!    the operation without touching the ledger.
//! 5. Insert the booking row in a ledger transaction and commit.
//! 6. If step 5 fails, restore the reserved capacity (with retries). If that fails as
//!    well, the discrepancy goes to the reconciliation log and the caller gets
//!    [`BookingError::CompensationFailure`].
//!
//! Once capacity is reserved the saga always runs to completion or compensation, even
//! if the caller stops waiting: it executes on its own Tokio task.
//!
//! # Unknown outcomes
//!
//! A store call that times out may have been applied. Reservations and restores are
//! keyed by a hold (see [`boxoffice_core::capacity`]), so repeating them is safe: a
//! retry of the same attempt finds its tickets already taken, and a repeated restore
//! finds them already given back. A different attempt for a request whose tickets are
//! still held gets a retryable [`StoreError::DuplicateRequest`] and touches nothing.
//!
//! # Ordering
//!
//! Concurrent bookings for the same event are ordered only by the Capacity Store's
//! conditional decrement. There is no FIFO fairness: a request sent earlier can still
//! be refused with `InsufficientCapacity` if a later one reaches the store first.

use crate::config::CoordinatorConfig;
use crate::observer::{BookingObserver, TracingObserver};
use crate::recovery::RecoverySweep;
use crate::retry::retry_with_predicate;
use crate::saga::{BookingSaga, BookingStage};
use boxoffice_core::capacity::{CapacityStore, Release, ReserveOutcome, ResizeOutcome, RestoreOutcome};
use boxoffice_core::environment::Clock;
use boxoffice_core::ledger::{IntentState, LedgerStore, ReservationIntent, with_transaction};
use boxoffice_core::reconciliation::{CompensationOutcome, ReconciliationId, ReconciliationSink, Severity};
use boxoffice_core::{
    AttemptId, Booking, BookingError, BookingId, BookingReceipt, BookingStatus, Event, EventId, EventSnapshot,
    NewBooking, Page, RequestId, RequesterRole, StoreError, TicketCount, UserId, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

const CAPACITY: &str = "capacity";
const LEDGER: &str = "ledger";
const RECONCILIATION: &str = "reconciliation";

/// Raw booking input as received from the request layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    /// Event to book
    pub event_id: EventId,
    /// Who is booking
    pub user_id: UserId,
    /// Requested tickets (validated to `1..=10`)
    pub tickets: u32,
    /// Idempotency key
    pub request_id: String,
}

/// Saga coordinator for booking and cancelling tickets.
///
/// Cheap to clone; every clone shares the same stores.
#[derive(Clone)]
pub struct BookingCoordinator {
    capacity: Arc<dyn CapacityStore>,
    ledger: Arc<dyn LedgerStore>,
    reconciliation: Arc<dyn ReconciliationSink>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn BookingObserver>,
    config: CoordinatorConfig,
}

impl BookingCoordinator {
    /// Create a coordinator with the default configuration and [`TracingObserver`].
    #[must_use]
    pub fn new(
        capacity: Arc<dyn CapacityStore>,
        ledger: Arc<dyn LedgerStore>,
        reconciliation: Arc<dyn ReconciliationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            capacity,
            ledger,
            reconciliation,
            clock,
            observer: Arc::new(TracingObserver),
            config: CoordinatorConfig::default(),
        }
    }

    /// Replace the observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn BookingObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// A recovery sweep sharing this coordinator's stores and settings.
    #[must_use]
    pub fn recovery_sweep(&self) -> RecoverySweep {
        RecoverySweep::new(self.clone())
    }

    /// Book tickets for an event.
    ///
    /// A retry with the same `request_id` and parameters returns the original booking
    /// with `replayed = true`; the same id with different parameters is a
    /// [`BookingError::Conflict`].
    ///
    /// # Errors
    ///
    /// - [`BookingError::Validation`] for a ticket count outside `1..=10` or a bad request id
    /// - [`BookingError::EventNotFound`], [`BookingError::EventExpired`]
    /// - [`BookingError::InsufficientCapacity`] with the availability seen by the store
    /// - [`BookingError::Persistence`] on a store failure, or while another attempt for
    ///   the same request id still holds tickets
    /// - [`BookingError::CompensationFailure`] when the reserved capacity could not be
    ///   given back; this is critical and recorded in the reconciliation log
    pub async fn book_tickets(&self, request: BookingRequest) -> Result<BookingReceipt, BookingError> {
        self.book_attempt(request, AttemptId::new()).await
    }

    /// [`Self::book_tickets`], retried with backoff while it fails with a transient
    /// store error. Every attempt reuses the same request id, so a retry can never
    /// create a second booking, and the same attempt id, so a reservation that landed
    /// without an acknowledgement is picked up instead of taken again.
    ///
    /// # Errors
    ///
    /// Returns the last error once it is not retryable or the retry budget is spent.
    pub async fn book_tickets_with_retry(&self, request: BookingRequest) -> Result<BookingReceipt, BookingError> {
        let attempt = AttemptId::new();
        retry_with_predicate(
            self.config.retry.clone(),
            || self.book_attempt(request.clone(), attempt),
            BookingError::is_retryable,
        )
        .await
    }

    #[tracing::instrument(
        name = "book_tickets",
        skip(self, request),
        fields(
            event_id = %request.event_id,
            user_id = %request.user_id,
            tickets = request.tickets,
            request_id = %request.request_id,
        )
    )]
    async fn book_attempt(&self, request: BookingRequest, attempt: AttemptId) -> Result<BookingReceipt, BookingError> {
        let started = Instant::now();
        let this = self.clone();
        let task = tokio::spawn(
            async move { this.run_booking(request, attempt).await }.instrument(tracing::Span::current()),
        );
        let result = match task.await {
            Ok(result) => result,
            Err(join_error) => Err(BookingError::Persistence(StoreError::Unavailable(format!(
                "booking task failed: {join_error}"
            )))),
        };

        match &result {
            Ok(receipt) => self.observer.booking_confirmed(receipt, started.elapsed()),
            Err(error) => self.observer.booking_failed(error, started.elapsed()),
        }
        result
    }

    async fn run_booking(&self, request: BookingRequest, attempt: AttemptId) -> Result<BookingReceipt, BookingError> {
        let tickets = TicketCount::new(request.tickets)?;
        let request_id = RequestId::new(&request.request_id)?;
        let event_id = request.event_id;
        let user_id = request.user_id;
        let mut saga = BookingSaga::new(request_id.clone());

        let existing = self
            .timed(LEDGER, "find_by_request_id", self.ledger.find_by_request_id(&request_id))
            .await;
        match existing {
            Ok(Some(booking)) => {
                self.advance(&mut saga, BookingStage::Replayed);
                return self.replay(booking, event_id, user_id, tickets).await;
            }
            Ok(None) => {}
            Err(error) => {
                self.advance(&mut saga, BookingStage::Aborted);
                return Err(error.into());
            }
        }

        let event = match self.load_event(event_id).await {
            Ok(event) => event,
            Err(error) => {
                self.advance(&mut saga, BookingStage::Aborted);
                return Err(error);
            }
        };
        let now = self.clock.now();
        if event.has_started(now) {
            self.advance(&mut saga, BookingStage::EventExpired);
            return Err(BookingError::EventExpired {
                event_id,
                date: event.date,
            });
        }

        if self.config.intent_journal {
            let intent = ReservationIntent::pending(request_id.clone(), event_id, user_id, tickets, now);
            if let Err(error) = self
                .timed(LEDGER, "record_intent", self.ledger.record_intent(intent))
                .await
            {
                self.advance(&mut saga, BookingStage::Aborted);
                return Err(error.into());
            }
        }

        let reserved = self
            .timed(
                CAPACITY,
                "reserve",
                self.capacity.reserve(event_id, tickets, &request_id, attempt),
            )
            .await;
        let available = match reserved {
            Ok(ReserveOutcome::Reserved { available }) => available,
            Ok(ReserveOutcome::Insufficient { available }) => {
                self.advance(&mut saga, BookingStage::InsufficientCapacity);
                self.resolve_intent(&request_id, IntentState::Rejected).await;
                return Err(BookingError::InsufficientCapacity {
                    event_id,
                    requested: tickets.get(),
                    available,
                });
            }
            Ok(ReserveOutcome::NotFound) => {
                self.advance(&mut saga, BookingStage::Aborted);
                self.resolve_intent(&request_id, IntentState::Rejected).await;
                return Err(BookingError::EventNotFound(event_id));
            }
            Ok(ReserveOutcome::HeldByOtherAttempt) => {
                // The intent belongs to the attempt holding the tickets
                self.advance(&mut saga, BookingStage::Aborted);
                tracing::info!("Another attempt holds tickets for this request");
                return Err(BookingError::Persistence(StoreError::DuplicateRequest(request_id)));
            }
            Err(error) => {
                // Outcome unknown: the intent stays pending for the recovery sweep
                self.advance(&mut saga, BookingStage::Aborted);
                return Err(error.into());
            }
        };
        self.advance(&mut saga, BookingStage::Reserved);
        tracing::debug!(available, "Capacity reserved");

        let new_booking = NewBooking {
            id: BookingId::new(),
            event_id,
            user_id,
            tickets,
            request_id: request_id.clone(),
            created_at: now,
        };
        let booking_id = new_booking.id;
        let written = self
            .timed(
                LEDGER,
                "create_booking",
                with_transaction(self.ledger.as_ref(), move |tx| tx.create_booking(new_booking)),
            )
            .await;

        let ledger_error = match written {
            Ok(booking) => return Ok(self.confirm(&mut saga, booking, &event, available).await),
            Err(error) if error.is_transient() => {
                // A lost acknowledgement does not mean the commit did not land
                match self.find_landed_booking(&request_id, booking_id).await {
                    Some(booking) => return Ok(self.confirm(&mut saga, booking, &event, available).await),
                    None => error,
                }
            }
            Err(error) => error,
        };

        self.advance(&mut saga, BookingStage::LedgerFailed);
        tracing::warn!(error = %ledger_error, "Ledger write failed after reservation, compensating");
        let release = Release::Attempt {
            request_id: request_id.clone(),
            attempt,
        };
        self.compensate(&mut saga, user_id, tickets, event_id, &release, ledger_error)
            .await
    }

    async fn confirm(
        &self,
        saga: &mut BookingSaga,
        booking: Booking,
        event: &Event,
        available: u32,
    ) -> BookingReceipt {
        self.advance(saga, BookingStage::LedgerWritten);
        self.resolve_intent(&booking.request_id, IntentState::Completed).await;
        self.advance(saga, BookingStage::Done);
        BookingReceipt {
            booking,
            event: EventSnapshot {
                available,
                ..event.snapshot()
            },
            replayed: false,
        }
    }

    async fn find_landed_booking(&self, request_id: &RequestId, booking_id: BookingId) -> Option<Booking> {
        match self
            .timed(LEDGER, "find_by_request_id", self.ledger.find_by_request_id(request_id))
            .await
        {
            Ok(Some(booking)) if booking.id == booking_id => Some(booking),
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(%error, "Could not check whether the failed commit landed");
                None
            }
        }
    }

    async fn compensate(
        &self,
        saga: &mut BookingSaga,
        user_id: UserId,
        tickets: TicketCount,
        event_id: EventId,
        release: &Release,
        ledger_error: StoreError,
    ) -> Result<BookingReceipt, BookingError> {
        self.advance(saga, BookingStage::Compensating);
        let request_id = saga.request_id().clone();

        let lost_race = matches!(ledger_error, StoreError::DuplicateRequest(_));
        match self.restore_capacity(event_id, tickets, release).await {
            Ok(available) => {
                self.advance(saga, BookingStage::Compensated);
                tracing::info!(available, "Reserved capacity restored");
                if !lost_race {
                    // The intent row is shared with the winner of a same-key race
                    self.resolve_intent(&request_id, IntentState::Compensated).await;
                }
                self.record_discrepancy(CompensationOutcome::Compensated {
                    request_id: request_id.clone(),
                    event_id,
                    tickets: tickets.get(),
                    ledger_error: ledger_error.to_string(),
                })
                .await;

                if lost_race {
                    let winner = self
                        .timed(LEDGER, "find_by_request_id", self.ledger.find_by_request_id(&request_id))
                        .await?;
                    if let Some(booking) = winner {
                        self.advance(saga, BookingStage::Replayed);
                        return self.replay(booking, event_id, user_id, tickets).await;
                    }
                    // Winner has not committed yet; a retry will replay it
                }
                Err(BookingError::Persistence(ledger_error))
            }
            Err(restore_error) => {
                self.advance(saga, BookingStage::CompensationFailed);
                let reconciliation_id = self
                    .record_discrepancy(CompensationOutcome::CompensationFailed {
                        request_id: request_id.clone(),
                        event_id,
                        user_id,
                        tickets: tickets.get(),
                        ledger_error: ledger_error.to_string(),
                        restore_error: restore_error.to_string(),
                    })
                    .await;
                if !lost_race {
                    self.resolve_intent(&request_id, IntentState::Unreconciled).await;
                }
                Err(BookingError::CompensationFailure {
                    event_id,
                    tickets: tickets.get(),
                    request_id,
                    ledger_error,
                    restore_error,
                    reconciliation_id,
                })
            }
        }
    }

    async fn replay(
        &self,
        booking: Booking,
        event_id: EventId,
        user_id: UserId,
        tickets: TicketCount,
    ) -> Result<BookingReceipt, BookingError> {
        if !booking.matches_request(event_id, user_id, tickets) {
            return Err(BookingError::Conflict {
                request_id: booking.request_id,
            });
        }
        let event = self.load_event(event_id).await?;
        Ok(BookingReceipt {
            booking,
            event: event.snapshot(),
            replayed: true,
        })
    }

    /// Cancel a booking and give its tickets back.
    ///
    /// Only the owner or a privileged requester may cancel. If the ledger flip commits
    /// but the capacity restore fails, the cancellation still succeeds and the missing
    /// restore is written to the reconciliation log.
    ///
    /// # Errors
    ///
    /// - [`BookingError::BookingNotFound`]
    /// - [`BookingError::Forbidden`] when the requester is neither owner nor admin
    /// - [`BookingError::AlreadyCancelled`], including when a concurrent cancel won
    /// - [`BookingError::Persistence`] when the ledger could not be read or written
    #[tracing::instrument(skip_all, fields(booking_id = %booking_id, requester = %requester, ?role))]
    pub async fn cancel_booking(
        &self,
        booking_id: BookingId,
        requester: UserId,
        role: RequesterRole,
    ) -> Result<Booking, BookingError> {
        let this = self.clone();
        let task = tokio::spawn(
            async move { this.run_cancellation(booking_id, requester, role).await }
                .instrument(tracing::Span::current()),
        );
        let result = match task.await {
            Ok(result) => result,
            Err(join_error) => Err(BookingError::Persistence(StoreError::Unavailable(format!(
                "cancellation task failed: {join_error}"
            )))),
        };
        if let Ok(booking) = &result {
            self.observer.booking_cancelled(booking);
        }
        result
    }

    async fn run_cancellation(
        &self,
        booking_id: BookingId,
        requester: UserId,
        role: RequesterRole,
    ) -> Result<Booking, BookingError> {
        let booking = self
            .timed(LEDGER, "find_by_id", self.ledger.find_by_id(booking_id))
            .await?
            .ok_or(BookingError::BookingNotFound(booking_id))?;

        if !booking.is_owned_by(requester) && !role.is_privileged() {
            return Err(BookingError::Forbidden { booking_id, requester });
        }
        if booking.status == BookingStatus::Cancelled {
            return Err(BookingError::AlreadyCancelled(booking_id));
        }

        let now = self.clock.now();
        let cancelled = self
            .timed(
                LEDGER,
                "set_status",
                with_transaction(self.ledger.as_ref(), move |tx| {
                    tx.set_status(booking_id, BookingStatus::Confirmed, BookingStatus::Cancelled, now)
                }),
            )
            .await
            .map_err(|error| match error {
                StoreError::StatusConflict { .. } => BookingError::AlreadyCancelled(booking_id),
                StoreError::NotFound => BookingError::BookingNotFound(booking_id),
                other => BookingError::Persistence(other),
            })?;

        let release = Release::Booking {
            request_id: cancelled.request_id.clone(),
        };
        if let Err(restore_error) = self
            .restore_capacity(cancelled.event_id, cancelled.tickets, &release)
            .await
        {
            tracing::warn!(error = %restore_error, "Cancelled booking but could not restore capacity");
            self.record_discrepancy(CompensationOutcome::CancellationRestoreFailed {
                booking_id,
                event_id: cancelled.event_id,
                tickets: cancelled.tickets.get(),
                restore_error: restore_error.to_string(),
            })
            .await;
        }
        Ok(cancelled)
    }

    /// Load a booking by id.
    ///
    /// # Errors
    ///
    /// [`BookingError::BookingNotFound`] or [`BookingError::Persistence`].
    pub async fn get_booking(&self, booking_id: BookingId) -> Result<Booking, BookingError> {
        self.timed(LEDGER, "find_by_id", self.ledger.find_by_id(booking_id))
            .await?
            .ok_or(BookingError::BookingNotFound(booking_id))
    }

    /// A user's bookings, newest first.
    ///
    /// # Errors
    ///
    /// [`BookingError::Persistence`] when the ledger cannot be read.
    pub async fn list_bookings(&self, user_id: UserId, page: Page) -> Result<Vec<Booking>, BookingError> {
        Ok(self
            .timed(LEDGER, "find_by_user", self.ledger.find_by_user(user_id, page))
            .await?)
    }

    /// Current capacity of an event.
    ///
    /// # Errors
    ///
    /// [`BookingError::EventNotFound`] or [`BookingError::Persistence`].
    pub async fn event_snapshot(&self, event_id: EventId) -> Result<EventSnapshot, BookingError> {
        Ok(self.load_event(event_id).await?.snapshot())
    }

    /// Change an event's total capacity without undercutting tickets already sold.
    ///
    /// # Errors
    ///
    /// - [`BookingError::Validation`] for a zero total
    /// - [`BookingError::CapacityBelowSold`] when `new_total` is below the sold count
    /// - [`BookingError::EventNotFound`], [`BookingError::Persistence`]
    #[tracing::instrument(skip_all, fields(event_id = %event_id, new_total))]
    pub async fn resize_capacity(&self, event_id: EventId, new_total: u32) -> Result<EventSnapshot, BookingError> {
        if new_total == 0 {
            return Err(ValidationError::ZeroCapacity.into());
        }
        match self
            .timed(CAPACITY, "resize", self.capacity.resize(event_id, new_total))
            .await?
        {
            ResizeOutcome::Resized(event) => {
                tracing::info!(total = event.total, available = event.available, "Event capacity changed");
                Ok(event.snapshot())
            }
            ResizeOutcome::BelowSold { sold } => Err(BookingError::CapacityBelowSold {
                event_id,
                requested_total: new_total,
                sold,
            }),
            ResizeOutcome::NotFound => Err(BookingError::EventNotFound(event_id)),
        }
    }

    // ------------------------------------------------------------------------
    // Shared plumbing (also used by the recovery sweep)
    // ------------------------------------------------------------------------

    pub(crate) fn capacity(&self) -> &dyn CapacityStore {
        self.capacity.as_ref()
    }

    pub(crate) fn ledger(&self) -> &dyn LedgerStore {
        self.ledger.as_ref()
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Run one store call under the configured deadline.
    pub(crate) async fn timed<T, F>(&self, store: &'static str, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let deadline = self.config.store_timeout;
        if let Ok(result) = tokio::time::timeout(deadline, call).await {
            result
        } else {
            self.observer.store_timeout(store, operation, deadline);
            Err(StoreError::Timeout(deadline))
        }
    }

    /// Write an outcome to the reconciliation log.
    ///
    /// Returns `None` when the write failed; the observer has been told. For critical
    /// outcomes the process is aborted if configured so.
    pub(crate) async fn record_discrepancy(&self, outcome: CompensationOutcome) -> Option<ReconciliationId> {
        let recorded = self
            .timed(
                RECONCILIATION,
                "record",
                self.reconciliation.record(outcome.clone(), self.clock.now()),
            )
            .await;
        match recorded {
            Ok(id) => {
                self.observer.discrepancy_recorded(&outcome, id);
                Some(id)
            }
            Err(error) => {
                self.observer.discrepancy_unrecorded(&outcome, &error);
                if self.config.abort_on_unrecorded_discrepancy && outcome.severity() == Severity::Critical {
                    std::process::abort();
                }
                None
            }
        }
    }

    async fn load_event(&self, event_id: EventId) -> Result<Event, BookingError> {
        self.timed(CAPACITY, "get", self.capacity.get(event_id))
            .await?
            .ok_or(BookingError::EventNotFound(event_id))
    }

    /// Give a hold back. Retrying after a timeout is safe: a restore that already
    /// landed reports `AlreadyRestored` and changes nothing.
    async fn restore_capacity(&self, event_id: EventId, tickets: TicketCount, release: &Release) -> Result<u32, StoreError> {
        retry_with_predicate(
            self.config.compensation_retry.clone(),
            || async move {
                match self
                    .timed(CAPACITY, "restore", self.capacity.restore(event_id, tickets, release))
                    .await?
                {
                    RestoreOutcome::Restored { available } => Ok(available),
                    RestoreOutcome::AlreadyRestored { available } => {
                        tracing::debug!(available, "Hold was already released");
                        Ok(available)
                    }
                    RestoreOutcome::NotFound => Err(StoreError::NotFound),
                }
            },
            StoreError::is_transient,
        )
        .await
    }

    async fn resolve_intent(&self, request_id: &RequestId, state: IntentState) {
        if !self.config.intent_journal {
            return;
        }
        let now = self.clock.now();
        if let Err(error) = self
            .timed(LEDGER, "resolve_intent", self.ledger.resolve_intent(request_id, state, now))
            .await
        {
            // A stale pending intent is re-examined by the recovery sweep
            tracing::warn!(%error, %state, "Could not resolve reservation intent");
        }
    }

    fn advance(&self, saga: &mut BookingSaga, next: BookingStage) {
        match saga.advance(next) {
            Ok(previous) => self.observer.stage_changed(saga.request_id(), previous, next),
            Err(error) => tracing::error!(%error, request_id = %saga.request_id(), "Booking saga out of order"),
        }
    }
}

impl std::fmt::Debug for BookingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn booking_request_roundtrips_through_json() {
        let request = BookingRequest {
            event_id: EventId::new(),
            user_id: UserId::new(),
            tickets: 2,
            request_id: "req-json".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: BookingRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }
}
