//! In-memory Ledger Store.
//!
//! Transactions stage their writes and apply them atomically on commit. A request id
//! claimed by an open transaction is unavailable to every other transaction until
//! that one commits or rolls back, which mirrors a unique index in a relational store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::faults::FaultSwitch;
use boxoffice_core::ledger::{IntentState, LedgerStore, LedgerTransaction, ReservationIntent};
use boxoffice_core::{
    Booking, BookingId, BookingStatus, BoxFuture, DateTime, EventId, NewBooking, Page, RequestId, StoreError,
    UserId, Utc,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Planned failures per operation.
#[derive(Debug, Default)]
pub struct LedgerFaults {
    /// `begin`
    pub begin: FaultSwitch,
    /// `create_booking`
    pub create_booking: FaultSwitch,
    /// `set_status`
    pub set_status: FaultSwitch,
    /// `commit`, before anything is applied
    pub commit: FaultSwitch,
    /// `commit`, after the writes are applied (lost acknowledgement)
    pub commit_ack: FaultSwitch,
    /// `find_by_id`, `find_by_request_id`, `find_by_user`, `confirmed_tickets`
    pub read: FaultSwitch,
    /// `record_intent`
    pub record_intent: FaultSwitch,
    /// `resolve_intent`
    pub resolve_intent: FaultSwitch,
}

#[derive(Debug, Default)]
struct LedgerState {
    bookings: HashMap<BookingId, Booking>,
    by_request: HashMap<RequestId, BookingId>,
    claimed: HashSet<RequestId>,
    intents: HashMap<RequestId, ReservationIntent>,
}

/// In-memory ledger with real transaction semantics.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
    faults: Arc<LedgerFaults>,
}

impl InMemoryLedgerStore {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Planned failures
    #[must_use]
    pub fn faults(&self) -> &LedgerFaults {
        &self.faults
    }

    /// Every committed booking, oldest first.
    #[must_use]
    pub fn bookings(&self) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self.state.lock().unwrap().bookings.values().cloned().collect();
        bookings.sort_by_key(|b| (b.created_at, *b.id.as_uuid()));
        bookings
    }

    /// Number of committed bookings.
    #[must_use]
    pub fn booking_count(&self) -> usize {
        self.state.lock().unwrap().bookings.len()
    }

    /// Committed bookings for one request id (0 or 1).
    #[must_use]
    pub fn bookings_for_request(&self, request_id: &RequestId) -> usize {
        self.state
            .lock()
            .unwrap()
            .bookings
            .values()
            .filter(|b| &b.request_id == request_id)
            .count()
    }

    /// Journal entry for a request, if any.
    #[must_use]
    pub fn intent(&self, request_id: &RequestId) -> Option<ReservationIntent> {
        self.state.lock().unwrap().intents.get(request_id).cloned()
    }

    /// Insert a committed booking directly, bypassing transactions.
    pub fn insert_booking(&self, booking: Booking) {
        let mut state = self.state.lock().unwrap();
        state.by_request.insert(booking.request_id.clone(), booking.id);
        state.bookings.insert(booking.id, booking);
    }

    /// Insert a journal entry directly.
    pub fn insert_intent(&self, intent: ReservationIntent) {
        self.state
            .lock()
            .unwrap()
            .intents
            .insert(intent.request_id.clone(), intent);
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn LedgerTransaction>, StoreError>> {
        Box::pin(async move {
            self.faults.begin.enter().await?;
            let tx: Box<dyn LedgerTransaction> = Box::new(InMemoryLedgerTransaction {
                state: Arc::clone(&self.state),
                faults: Arc::clone(&self.faults),
                inserts: Vec::new(),
                updates: Vec::new(),
                finished: false,
            });
            Ok(tx)
        })
    }

    fn find_by_id(&self, id: BookingId) -> BoxFuture<'_, Result<Option<Booking>, StoreError>> {
        Box::pin(async move {
            self.faults.read.enter().await?;
            Ok(self.state.lock().unwrap().bookings.get(&id).cloned())
        })
    }

    fn find_by_request_id<'a>(
        &'a self,
        request_id: &'a RequestId,
    ) -> BoxFuture<'a, Result<Option<Booking>, StoreError>> {
        Box::pin(async move {
            self.faults.read.enter().await?;
            let state = self.state.lock().unwrap();
            Ok(state
                .by_request
                .get(request_id)
                .and_then(|id| state.bookings.get(id))
                .cloned())
        })
    }

    fn find_by_user(&self, user_id: UserId, page: Page) -> BoxFuture<'_, Result<Vec<Booking>, StoreError>> {
        Box::pin(async move {
            self.faults.read.enter().await?;
            let mut bookings: Vec<Booking> = self
                .state
                .lock()
                .unwrap()
                .bookings
                .values()
                .filter(|b| b.user_id == user_id)
                .cloned()
                .collect();
            bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
            Ok(bookings
                .into_iter()
                .skip(page.offset as usize)
                .take(page.limit as usize)
                .collect())
        })
    }

    fn confirmed_tickets(&self, event_id: EventId) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            self.faults.read.enter().await?;
            Ok(self
                .state
                .lock()
                .unwrap()
                .bookings
                .values()
                .filter(|b| b.event_id == event_id && b.status == BookingStatus::Confirmed)
                .map(|b| u64::from(b.tickets.get()))
                .sum())
        })
    }

    fn record_intent(&self, intent: ReservationIntent) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.faults.record_intent.enter().await?;
            let mut ledger = self.state.lock().unwrap();
            if ledger
                .intents
                .get(&intent.request_id)
                .is_some_and(|existing| !existing.state.is_reopenable())
            {
                return Ok(());
            }
            let intent = ReservationIntent {
                state: IntentState::Pending,
                resolved_at: None,
                ..intent
            };
            ledger.intents.insert(intent.request_id.clone(), intent);
            Ok(())
        })
    }

    fn resolve_intent<'a>(
        &'a self,
        request_id: &'a RequestId,
        state: IntentState,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.faults.resolve_intent.enter().await?;
            let mut ledger = self.state.lock().unwrap();
            let intent = ledger.intents.get_mut(request_id).ok_or(StoreError::NotFound)?;
            intent.state = state;
            intent.resolved_at = Some(at);
            Ok(())
        })
    }

    fn stale_intents(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<ReservationIntent>, StoreError>> {
        Box::pin(async move {
            self.faults.read.enter().await?;
            let mut stale: Vec<ReservationIntent> = self
                .state
                .lock()
                .unwrap()
                .intents
                .values()
                .filter(|i| i.state.is_pending() && i.created_at < older_than)
                .cloned()
                .collect();
            stale.sort_by_key(|i| i.created_at);
            stale.truncate(limit as usize);
            Ok(stale)
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct StatusUpdate {
    id: BookingId,
    from: BookingStatus,
    to: BookingStatus,
    at: DateTime<Utc>,
}

/// Open transaction over an [`InMemoryLedgerStore`].
#[derive(Debug)]
pub struct InMemoryLedgerTransaction {
    state: Arc<Mutex<LedgerState>>,
    faults: Arc<LedgerFaults>,
    inserts: Vec<Booking>,
    updates: Vec<StatusUpdate>,
    finished: bool,
}

impl InMemoryLedgerTransaction {
    fn view(&self, id: BookingId) -> Option<Booking> {
        let mut booking = self
            .inserts
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .or_else(|| self.state.lock().unwrap().bookings.get(&id).cloned())?;
        for update in self.updates.iter().filter(|u| u.id == id) {
            booking.status = update.to;
            booking.updated_at = update.at;
        }
        Some(booking)
    }

    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Ok(mut state) = self.state.lock() {
            for booking in &self.inserts {
                state.claimed.remove(&booking.request_id);
            }
        }
    }
}

impl LedgerTransaction for InMemoryLedgerTransaction {
    fn create_booking(&mut self, booking: NewBooking) -> BoxFuture<'_, Result<Booking, StoreError>> {
        Box::pin(async move {
            self.faults.create_booking.enter().await?;
            {
                let mut state = self.state.lock().unwrap();
                if state.by_request.contains_key(&booking.request_id) || state.claimed.contains(&booking.request_id) {
                    return Err(StoreError::DuplicateRequest(booking.request_id));
                }
                state.claimed.insert(booking.request_id.clone());
            }
            let booking = booking.into_booking();
            self.inserts.push(booking.clone());
            Ok(booking)
        })
    }

    fn set_status(
        &mut self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Booking, StoreError>> {
        Box::pin(async move {
            self.faults.set_status.enter().await?;
            let mut booking = self.view(id).ok_or(StoreError::NotFound)?;
            if booking.status != from {
                return Err(StoreError::StatusConflict {
                    id,
                    expected: from,
                    actual: booking.status,
                });
            }
            self.updates.push(StatusUpdate { id, from, to, at });
            booking.status = to;
            booking.updated_at = at;
            Ok(booking)
        })
    }

    fn find_by_id(&mut self, id: BookingId) -> BoxFuture<'_, Result<Option<Booking>, StoreError>> {
        Box::pin(async move {
            self.faults.read.enter().await?;
            Ok(self.view(id))
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move {
            let mut tx = self;
            if let Err(error) = tx.faults.commit.enter().await {
                tx.release();
                return Err(error);
            }

            let applied = {
                let mut state = tx.state.lock().unwrap();
                // Row-level re-check: a concurrent transaction may have moved the row
                match status_conflict(&state, &tx.inserts, &tx.updates) {
                    Some(error) => Err(error),
                    None => {
                        for booking in &tx.inserts {
                            state.claimed.remove(&booking.request_id);
                            state.by_request.insert(booking.request_id.clone(), booking.id);
                            state.bookings.insert(booking.id, booking.clone());
                        }
                        for update in &tx.updates {
                            if let Some(booking) = state.bookings.get_mut(&update.id) {
                                booking.status = update.to;
                                booking.updated_at = update.at;
                            }
                        }
                        Ok(())
                    }
                }
            };
            if let Err(error) = applied {
                tx.release();
                return Err(error);
            }
            tx.finished = true;
            tx.faults.commit_ack.enter().await
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move {
            let mut tx = self;
            tx.release();
            Ok(())
        })
    }
}

fn status_conflict(state: &LedgerState, inserts: &[Booking], updates: &[StatusUpdate]) -> Option<StoreError> {
    updates.iter().find_map(|update| match state.bookings.get(&update.id) {
        None if !inserts.iter().any(|b| b.id == update.id) => Some(StoreError::NotFound),
        Some(booking) if booking.status != update.from => Some(StoreError::StatusConflict {
            id: update.id,
            expected: update.from,
            actual: booking.status,
        }),
        _ => None,
    })
}

impl Drop for InMemoryLedgerTransaction {
    fn drop(&mut self) {
        self.release();
    }
}
