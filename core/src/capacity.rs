//! Capacity Store abstraction.
//!
//! The Capacity Store holds one record per event with its total and available ticket
//! counts. Every mutation of `available` goes through one of the atomic primitives
//! below; nothing outside them ever reads, modifies and writes the counter.
//!
//! # Atomicity
//!
//! - [`CapacityStore::reserve`] decrements `available` by `count` only if
//!   `available >= count`, as one indivisible operation against the store. Concurrent
//!   reservations for the same event are serialized by the store itself; whichever
//!   conditional update lands first wins. There is no FIFO fairness: a request issued
//!   earlier may still lose to one that reaches the store first.
//! - [`CapacityStore::restore`] increments `available` by `count`, clamped to `total`.
//! - [`CapacityStore::resize`] changes `total` and shifts `available` by the same delta,
//!   refusing to go below the tickets already sold.
//!
//! # Holds
//!
//! A store call that times out may still have been applied. To make `reserve` and
//! `restore` safe to repeat, the store keeps one hold per event and [`RequestId`],
//! updated in the same atomic step as the counter:
//!
//! | hold state | `reserve` by attempt A | `restore` of attempt A | `restore` of the booking |
//! |---|---|---|---|
//! | none or released | decrement, held by A | no change | increment, released |
//! | held by A | no change, `Reserved` | increment, released | increment, released |
//! | held by B | no change, `HeldByOtherAttempt` | no change | increment, released |
//!
//! "No change" restores report [`RestoreOutcome::AlreadyRestored`]. A request's tickets
//! are therefore taken at most once and given back at most once, however often either
//! call is retried.
//!
//! # Implementations
//!
//! - `RedisCapacityStore` (in `boxoffice-redis`): server-side Lua scripts
//! - `InMemoryCapacityStore` (in `boxoffice-testing`): mutex-guarded map

use crate::error::StoreError;
use crate::types::{AttemptId, Event, EventId, RequestId, TicketCount};
use futures::future::BoxFuture;

/// Result of a conditional decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The attempt holds the tickets; `available` is the count left afterwards
    Reserved {
        /// Tickets left after the decrement
        available: u32,
    },
    /// Not enough tickets; nothing changed
    Insufficient {
        /// Tickets available when the decrement was refused
        available: u32,
    },
    /// Another attempt for the same request id holds tickets; nothing changed
    HeldByOtherAttempt,
    /// No such event
    NotFound,
}

/// Result of a clamped increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Tickets were returned; `available` is the count afterwards
    Restored {
        /// Tickets available after the increment
        available: u32,
    },
    /// The hold was already released; nothing changed
    AlreadyRestored {
        /// Tickets available now
        available: u32,
    },
    /// No such event
    NotFound,
}

/// Which hold a [`CapacityStore::restore`] gives back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Compensation: only the tickets this attempt took
    Attempt {
        /// Request the attempt belongs to
        request_id: RequestId,
        /// The attempt
        attempt: AttemptId,
    },
    /// Cancellation: the tickets of a committed booking, whichever attempt took them
    Booking {
        /// Request id of the booking
        request_id: RequestId,
    },
}

impl Release {
    /// Request id of the hold.
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        match self {
            Self::Attempt { request_id, .. } | Self::Booking { request_id } => request_id,
        }
    }
}

/// State of one hold, as kept by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldState {
    /// Tickets are held by this attempt
    Held(AttemptId),
    /// Tickets were given back
    Released,
}

impl HoldState {
    /// Stored form: the attempt id, or `released`.
    #[must_use]
    pub fn as_stored(&self) -> String {
        match self {
            Self::Held(attempt) => attempt.to_string(),
            Self::Released => RELEASED.to_string(),
        }
    }

    /// Whether `release` gives back tickets under this hold.
    ///
    /// `None` means the store has no hold for the request.
    #[must_use]
    pub fn releases(hold: Option<Self>, release: &Release) -> bool {
        match (hold, release) {
            (Some(Self::Released), _) | (None, Release::Attempt { .. }) => false,
            (Some(Self::Held(holder)), Release::Attempt { attempt, .. }) => holder == *attempt,
            (_, Release::Booking { .. }) => true,
        }
    }
}

/// Stored marker of a released hold.
pub const RELEASED: &str = "released";

/// Result of a capacity change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// New total applied
    Resized(Event),
    /// The new total would undercut tickets already sold; nothing changed
    BelowSold {
        /// Tickets sold at the time of the attempt
        sold: u32,
    },
    /// No such event
    NotFound,
}

/// Capacity Store abstraction.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the coordinator shares one instance across
/// every concurrent request.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be held as `Arc<dyn CapacityStore>`.
pub trait CapacityStore: Send + Sync {
    /// Atomically take `count` tickets for `attempt` if at least that many are available.
    ///
    /// Repeating the call for an attempt that already holds the tickets changes nothing
    /// and reports `Reserved` with the current count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be reached. A store error never
    /// means "insufficient"; the outcome of the call is unknown.
    fn reserve<'a>(
        &'a self,
        event_id: EventId,
        count: TicketCount,
        request_id: &'a RequestId,
        attempt: AttemptId,
    ) -> BoxFuture<'a, Result<ReserveOutcome, StoreError>>;

    /// Atomically give back the tickets of a hold, never exceeding the event total.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be reached.
    fn restore<'a>(
        &'a self,
        event_id: EventId,
        count: TicketCount,
        release: &'a Release,
    ) -> BoxFuture<'a, Result<RestoreOutcome, StoreError>>;

    /// Load an event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be reached or the record is corrupt.
    fn get(&self, event_id: EventId) -> BoxFuture<'_, Result<Option<Event>, StoreError>>;

    /// Atomically change an event's total capacity.
    ///
    /// `available` moves by the same delta as `total`, so tickets already sold stay sold.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be reached.
    fn resize(
        &self,
        event_id: EventId,
        new_total: u32,
    ) -> BoxFuture<'_, Result<ResizeOutcome, StoreError>>;
}

/// Pure form of the resize rule shared by every adapter.
///
/// Returns the new `(total, available)` pair, or `Err(sold)` when `new_total` would
/// undercut the tickets already sold.
///
/// # Errors
///
/// Returns the current sold count when the resize is refused.
pub const fn resized_counts(total: u32, available: u32, new_total: u32) -> Result<(u32, u32), u32> {
    let sold = total.saturating_sub(available);
    if new_total < sold || new_total == 0 {
        return Err(sold);
    }
    Ok((new_total, new_total - sold))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn growing_keeps_sold_tickets_sold() {
        assert_eq!(resized_counts(10, 4, 15), Ok((15, 9)));
    }

    #[test]
    fn shrinking_down_to_sold_is_allowed() {
        assert_eq!(resized_counts(10, 4, 6), Ok((6, 0)));
    }

    #[test]
    fn shrinking_below_sold_is_refused() {
        assert_eq!(resized_counts(10, 4, 5), Err(6));
    }

    #[test]
    fn zero_total_is_refused() {
        assert_eq!(resized_counts(10, 10, 0), Err(0));
    }

    #[test]
    fn compensation_releases_only_its_own_hold() {
        let request_id = RequestId::new("req-hold").unwrap();
        let mine = AttemptId::new();
        let release = Release::Attempt {
            request_id,
            attempt: mine,
        };

        assert!(HoldState::releases(Some(HoldState::Held(mine)), &release));
        assert!(!HoldState::releases(Some(HoldState::Held(AttemptId::new())), &release));
        assert!(!HoldState::releases(Some(HoldState::Released), &release));
        assert!(!HoldState::releases(None, &release));
    }

    #[test]
    fn cancellation_releases_any_live_hold_once() {
        let release = Release::Booking {
            request_id: RequestId::new("req-hold").unwrap(),
        };

        assert!(HoldState::releases(Some(HoldState::Held(AttemptId::new())), &release));
        assert!(HoldState::releases(None, &release));
        assert!(!HoldState::releases(Some(HoldState::Released), &release));
    }

    #[test]
    fn released_marker_is_not_an_attempt_id() {
        assert_eq!(HoldState::Released.as_stored(), RELEASED);
        let attempt = AttemptId::new();
        assert_eq!(HoldState::Held(attempt).as_stored(), attempt.to_string());
    }

    proptest::proptest! {
        #[test]
        fn resize_never_changes_sold(total in 1u32..10_000, sold_pct in 0u32..=100, new_total in 0u32..20_000) {
            let sold = total * sold_pct / 100;
            let available = total - sold;
            match resized_counts(total, available, new_total) {
                Ok((t, a)) => {
                    proptest::prop_assert_eq!(t, new_total);
                    proptest::prop_assert!(a <= t);
                    proptest::prop_assert_eq!(t - a, sold);
                }
                Err(current) => {
                    proptest::prop_assert_eq!(current, sold);
                    proptest::prop_assert!(new_total < sold || new_total == 0);
                }
            }
        }
    }
}
