//! In-memory Capacity Store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::faults::FaultSwitch;
use boxoffice_core::capacity::{
    CapacityStore, HoldState, Release, ReserveOutcome, ResizeOutcome, RestoreOutcome, resized_counts,
};
use boxoffice_core::{AttemptId, BoxFuture, Event, EventId, RequestId, StoreError, TicketCount};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Planned failures per operation.
#[derive(Debug, Default)]
pub struct CapacityFaults {
    /// `reserve`, before anything is applied
    pub reserve: FaultSwitch,
    /// `reserve`, after the decrement is applied (lost acknowledgement)
    pub reserve_ack: FaultSwitch,
    /// `restore`, before anything is applied
    pub restore: FaultSwitch,
    /// `restore`, after the increment is applied (lost acknowledgement)
    pub restore_ack: FaultSwitch,
    /// `get`
    pub get: FaultSwitch,
    /// `resize`
    pub resize: FaultSwitch,
}

#[derive(Debug, Default)]
struct CapacityState {
    events: HashMap<EventId, Event>,
    holds: HashMap<(EventId, RequestId), HoldState>,
}

/// Mutex-guarded map of events and holds.
///
/// The conditional decrement and the hold update happen under one lock, so they are
/// atomic in the same sense as the Redis scripts.
///
/// # Example
///
/// ```
/// use boxoffice_testing::InMemoryCapacityStore;
/// use boxoffice_core::capacity::{CapacityStore, ReserveOutcome};
/// use boxoffice_core::{AttemptId, Event, EventId, RequestId, TicketCount, Utc};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryCapacityStore::new();
/// let event = Event::new(EventId::new(), 5, Utc::now())?;
/// store.register_event(event.clone());
///
/// let request_id = RequestId::new("checkout-1")?;
/// let outcome = store
///     .reserve(event.id, TicketCount::new(3)?, &request_id, AttemptId::new())
///     .await?;
/// assert_eq!(outcome, ReserveOutcome::Reserved { available: 2 });
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCapacityStore {
    state: Arc<Mutex<CapacityState>>,
    faults: Arc<CapacityFaults>,
}

impl InMemoryCapacityStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an event.
    pub fn register_event(&self, event: Event) {
        self.state.lock().unwrap().events.insert(event.id, event);
    }

    /// Current state of an event, for assertions.
    #[must_use]
    pub fn event(&self, event_id: EventId) -> Option<Event> {
        self.state.lock().unwrap().events.get(&event_id).cloned()
    }

    /// Available tickets of an event, for assertions.
    #[must_use]
    pub fn available(&self, event_id: EventId) -> Option<u32> {
        self.event(event_id).map(|event| event.available)
    }

    /// Hold of a request on an event, for assertions.
    #[must_use]
    pub fn hold(&self, event_id: EventId, request_id: &RequestId) -> Option<HoldState> {
        self.state
            .lock()
            .unwrap()
            .holds
            .get(&(event_id, request_id.clone()))
            .copied()
    }

    /// Overwrite the available counter, bypassing the atomic primitives.
    ///
    /// Only for setting up drift scenarios.
    pub fn force_available(&self, event_id: EventId, available: u32) {
        if let Some(event) = self.state.lock().unwrap().events.get_mut(&event_id) {
            event.available = available;
        }
    }

    /// Planned failures
    #[must_use]
    pub fn faults(&self) -> &CapacityFaults {
        &self.faults
    }

    fn apply_reserve(
        &self,
        event_id: EventId,
        count: TicketCount,
        request_id: &RequestId,
        attempt: AttemptId,
    ) -> ReserveOutcome {
        let mut state = self.state.lock().unwrap();
        let CapacityState { events, holds } = &mut *state;
        let Some(event) = events.get_mut(&event_id) else {
            return ReserveOutcome::NotFound;
        };
        let key = (event_id, request_id.clone());
        match holds.get(&key) {
            Some(HoldState::Held(holder)) if *holder == attempt => {
                return ReserveOutcome::Reserved {
                    available: event.available,
                };
            }
            Some(HoldState::Held(_)) => return ReserveOutcome::HeldByOtherAttempt,
            Some(HoldState::Released) | None => {}
        }
        if event.available < count.get() {
            return ReserveOutcome::Insufficient {
                available: event.available,
            };
        }
        event.available -= count.get();
        holds.insert(key, HoldState::Held(attempt));
        ReserveOutcome::Reserved {
            available: event.available,
        }
    }

    fn apply_restore(&self, event_id: EventId, count: TicketCount, release: &Release) -> RestoreOutcome {
        let mut state = self.state.lock().unwrap();
        let CapacityState { events, holds } = &mut *state;
        let Some(event) = events.get_mut(&event_id) else {
            return RestoreOutcome::NotFound;
        };
        let key = (event_id, release.request_id().clone());
        if !HoldState::releases(holds.get(&key).copied(), release) {
            return RestoreOutcome::AlreadyRestored {
                available: event.available,
            };
        }
        event.available = event.available.saturating_add(count.get()).min(event.total);
        holds.insert(key, HoldState::Released);
        RestoreOutcome::Restored {
            available: event.available,
        }
    }
}

impl CapacityStore for InMemoryCapacityStore {
    fn reserve<'a>(
        &'a self,
        event_id: EventId,
        count: TicketCount,
        request_id: &'a RequestId,
        attempt: AttemptId,
    ) -> BoxFuture<'a, Result<ReserveOutcome, StoreError>> {
        Box::pin(async move {
            self.faults.reserve.enter().await?;
            tokio::task::yield_now().await;

            let outcome = self.apply_reserve(event_id, count, request_id, attempt);
            self.faults.reserve_ack.enter().await?;
            Ok(outcome)
        })
    }

    fn restore<'a>(
        &'a self,
        event_id: EventId,
        count: TicketCount,
        release: &'a Release,
    ) -> BoxFuture<'a, Result<RestoreOutcome, StoreError>> {
        Box::pin(async move {
            self.faults.restore.enter().await?;

            let outcome = self.apply_restore(event_id, count, release);
            self.faults.restore_ack.enter().await?;
            Ok(outcome)
        })
    }

    fn get(&self, event_id: EventId) -> BoxFuture<'_, Result<Option<Event>, StoreError>> {
        Box::pin(async move {
            self.faults.get.enter().await?;
            Ok(self.event(event_id))
        })
    }

    fn resize(&self, event_id: EventId, new_total: u32) -> BoxFuture<'_, Result<ResizeOutcome, StoreError>> {
        Box::pin(async move {
            self.faults.resize.enter().await?;

            let mut state = self.state.lock().unwrap();
            let Some(event) = state.events.get_mut(&event_id) else {
                return Ok(ResizeOutcome::NotFound);
            };
            match resized_counts(event.total, event.available, new_total) {
                Ok((total, available)) => {
                    event.total = total;
                    event.available = available;
                    Ok(ResizeOutcome::Resized(event.clone()))
                }
                Err(sold) => Ok(ResizeOutcome::BelowSold { sold }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxoffice_core::Utc;
    use std::time::Duration;

    fn store_with(total: u32) -> (InMemoryCapacityStore, EventId) {
        let store = InMemoryCapacityStore::new();
        let event = Event::new(EventId::new(), total, Utc::now()).unwrap();
        let id = event.id;
        store.register_event(event);
        (store, id)
    }

    fn count(n: u32) -> TicketCount {
        TicketCount::new(n).unwrap()
    }

    fn request(key: &str) -> RequestId {
        RequestId::new(key).unwrap()
    }

    fn compensation(request_id: &RequestId, attempt: AttemptId) -> Release {
        Release::Attempt {
            request_id: request_id.clone(),
            attempt,
        }
    }

    #[tokio::test]
    async fn reserve_refuses_when_short() {
        let (store, id) = store_with(5);
        store.reserve(id, count(3), &request("a"), AttemptId::new()).await.unwrap();
        let outcome = store.reserve(id, count(3), &request("b"), AttemptId::new()).await.unwrap();
        assert_eq!(outcome, ReserveOutcome::Insufficient { available: 2 });
        assert_eq!(store.available(id), Some(2));
    }

    #[tokio::test]
    async fn repeated_reserve_by_the_same_attempt_takes_tickets_once() {
        let (store, id) = store_with(10);
        let key = request("a");
        let attempt = AttemptId::new();

        assert_eq!(
            store.reserve(id, count(3), &key, attempt).await.unwrap(),
            ReserveOutcome::Reserved { available: 7 }
        );
        assert_eq!(
            store.reserve(id, count(3), &key, attempt).await.unwrap(),
            ReserveOutcome::Reserved { available: 7 }
        );
        assert_eq!(
            store.reserve(id, count(3), &key, AttemptId::new()).await.unwrap(),
            ReserveOutcome::HeldByOtherAttempt
        );
        assert_eq!(store.available(id), Some(7));
        assert_eq!(store.hold(id, &key), Some(HoldState::Held(attempt)));
    }

    #[tokio::test]
    async fn restore_is_clamped_to_total() {
        let (store, id) = store_with(5);
        let key = request("a");
        store.reserve(id, count(1), &key, AttemptId::new()).await.unwrap();
        let outcome = store
            .restore(id, count(4), &Release::Booking { request_id: key })
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored { available: 5 });
    }

    #[tokio::test]
    async fn repeated_restore_gives_tickets_back_once() {
        let (store, id) = store_with(10);
        let key = request("a");
        let attempt = AttemptId::new();
        store.reserve(id, count(5), &request("other"), AttemptId::new()).await.unwrap();
        store.reserve(id, count(3), &key, attempt).await.unwrap();

        let release = compensation(&key, attempt);
        assert_eq!(
            store.restore(id, count(3), &release).await.unwrap(),
            RestoreOutcome::Restored { available: 5 }
        );
        assert_eq!(
            store.restore(id, count(3), &release).await.unwrap(),
            RestoreOutcome::AlreadyRestored { available: 5 }
        );
        assert_eq!(store.hold(id, &key), Some(HoldState::Released));
    }

    #[tokio::test]
    async fn compensation_leaves_another_attempts_hold_alone() {
        let (store, id) = store_with(10);
        let key = request("a");
        let winner = AttemptId::new();
        store.reserve(id, count(2), &key, winner).await.unwrap();

        let outcome = store
            .restore(id, count(2), &compensation(&key, AttemptId::new()))
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::AlreadyRestored { available: 8 });
        assert_eq!(store.hold(id, &key), Some(HoldState::Held(winner)));
    }

    #[tokio::test]
    async fn released_hold_can_be_taken_again() {
        let (store, id) = store_with(4);
        let key = request("a");
        let first = AttemptId::new();
        store.reserve(id, count(2), &key, first).await.unwrap();
        store.restore(id, count(2), &compensation(&key, first)).await.unwrap();

        let second = AttemptId::new();
        assert_eq!(
            store.reserve(id, count(2), &key, second).await.unwrap(),
            ReserveOutcome::Reserved { available: 2 }
        );
    }

    #[tokio::test]
    async fn unknown_events() {
        let store = InMemoryCapacityStore::new();
        let id = EventId::new();
        let key = request("a");
        assert_eq!(
            store.reserve(id, count(1), &key, AttemptId::new()).await.unwrap(),
            ReserveOutcome::NotFound
        );
        assert_eq!(
            store
                .restore(id, count(1), &Release::Booking { request_id: key })
                .await
                .unwrap(),
            RestoreOutcome::NotFound
        );
        assert_eq!(store.resize(id, 3).await.unwrap(), ResizeOutcome::NotFound);
    }

    #[tokio::test]
    async fn resize_keeps_sold_tickets() {
        let (store, id) = store_with(10);
        store.reserve(id, count(4), &request("a"), AttemptId::new()).await.unwrap();
        assert_eq!(store.resize(id, 3).await.unwrap(), ResizeOutcome::BelowSold { sold: 4 });
        let outcome = store.resize(id, 12).await.unwrap();
        assert!(matches!(outcome, ResizeOutcome::Resized(_)));
        let event = store.event(id).unwrap();
        assert_eq!((event.total, event.available), (12, 8));
    }

    #[tokio::test]
    async fn injected_failure_leaves_counter_alone() {
        let (store, id) = store_with(5);
        store.faults().reserve.fail_next(crate::faults::unavailable("down"));
        assert!(store.reserve(id, count(2), &request("a"), AttemptId::new()).await.is_err());
        assert_eq!(store.available(id), Some(5));
    }

    #[tokio::test]
    async fn lost_acknowledgement_still_applies_the_change() {
        let (store, id) = store_with(5);
        let key = request("a");
        let attempt = AttemptId::new();

        store.faults().reserve_ack.fail_next(crate::faults::unavailable("reply lost"));
        assert!(store.reserve(id, count(2), &key, attempt).await.is_err());
        assert_eq!(store.available(id), Some(3));

        store.faults().restore_ack.stall_next(Duration::from_millis(200));
        let stalled = tokio::time::timeout(
            Duration::from_millis(20),
            store.restore(id, count(2), &compensation(&key, attempt)),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(store.available(id), Some(5));
    }
}
