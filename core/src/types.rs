//! Domain types for booking tickets.
//!
//! Events live in the Capacity Store, bookings in the Ledger Store. The two stores are
//! independent, so a [`Booking`] refers to its event by value ([`EventId`]), never by a
//! live handle.

use crate::error::{StoreError, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum number of tickets a single booking may hold.
pub const MAX_TICKETS_PER_BOOKING: u32 = 10;

/// Maximum accepted length (in bytes) of a caller-supplied request id.
pub const MAX_REQUEST_ID_LEN: usize = 128;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random `EventId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EventId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a booking
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BookingId(Uuid);

impl BookingId {
    /// Creates a new random `BookingId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `BookingId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BookingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for the user who requested a booking
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random `UserId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `UserId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One attempt at booking a request.
///
/// Retries of the same attempt share its id, so the Capacity Store can tell a repeated
/// reservation from a competing one for the same [`RequestId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttemptId(Uuid);

impl AttemptId {
    /// Creates a new random `AttemptId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `AttemptId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied idempotency key.
///
/// Retrying a booking with the same `RequestId` never creates a second booking row;
/// the ledger enforces uniqueness on it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Validate and wrap a request id.
    ///
    /// Surrounding whitespace is trimmed.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyRequestId`] or [`ValidationError::RequestIdTooLong`].
    pub fn new(value: impl AsRef<str>) -> Result<Self, ValidationError> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyRequestId);
        }
        if trimmed.len() > MAX_REQUEST_ID_LEN {
            return Err(ValidationError::RequestIdTooLong {
                len: trimmed.len(),
                max: MAX_REQUEST_ID_LEN,
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Value Objects
// ============================================================================

/// Number of tickets in one booking, always within `1..=MAX_TICKETS_PER_BOOKING`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct TicketCount(u32);

impl TicketCount {
    /// Validate a requested ticket count.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::TicketCount`] when outside `1..=10`.
    pub const fn new(count: u32) -> Result<Self, ValidationError> {
        if count == 0 || count > MAX_TICKETS_PER_BOOKING {
            return Err(ValidationError::TicketCount {
                requested: count,
                max: MAX_TICKETS_PER_BOOKING,
            });
        }
        Ok(Self(count))
    }

    /// Get the count
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for TicketCount {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TicketCount> for u32 {
    fn from(count: TicketCount) -> Self {
        count.0
    }
}

impl fmt::Display for TicketCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who is asking for a cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequesterRole {
    /// Regular customer, may only act on their own bookings
    Customer,
    /// Privileged operator, may act on any booking
    Admin,
}

impl RequesterRole {
    /// Whether this role may act on bookings it does not own
    #[must_use]
    pub const fn is_privileged(self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// Offset pagination for booking listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Maximum rows to return (clamped to `1..=Page::MAX_LIMIT`)
    pub limit: u32,
    /// Rows to skip
    pub offset: u32,
}

impl Page {
    /// Default page size
    pub const DEFAULT_LIMIT: u32 = 20;
    /// Hard cap on page size
    pub const MAX_LIMIT: u32 = 100;

    /// Build a page, clamping the limit into the accepted range.
    #[must_use]
    pub const fn new(limit: u32, offset: u32) -> Self {
        let limit = if limit == 0 {
            1
        } else if limit > Self::MAX_LIMIT {
            Self::MAX_LIMIT
        } else {
            limit
        };
        Self { limit, offset }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT, 0)
    }
}

// ============================================================================
// Entities
// ============================================================================

/// An event as held by the Capacity Store.
///
/// Invariant: `available <= total`. At quiescence `available` equals `total` minus the
/// tickets of every CONFIRMED booking for this event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: EventId,
    /// Total capacity (at least 1)
    pub total: u32,
    /// Tickets still available
    pub available: u32,
    /// When the event takes place
    pub date: DateTime<Utc>,
}

impl Event {
    /// Create a fresh event with all tickets available.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ZeroCapacity`] when `total` is zero.
    pub const fn new(id: EventId, total: u32, date: DateTime<Utc>) -> Result<Self, ValidationError> {
        if total == 0 {
            return Err(ValidationError::ZeroCapacity);
        }
        Ok(Self {
            id,
            total,
            available: total,
            date,
        })
    }

    /// Tickets consumed so far (`total - available`)
    #[must_use]
    pub const fn sold(&self) -> u32 {
        self.total.saturating_sub(self.available)
    }

    /// Whether the event date is at or before `now`
    #[must_use]
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.date <= now
    }

    /// Snapshot of this event for callers
    #[must_use]
    pub const fn snapshot(&self) -> EventSnapshot {
        EventSnapshot {
            event_id: self.id,
            total: self.total,
            available: self.available,
            date: self.date,
        }
    }
}

/// Point-in-time view of an event's capacity returned alongside a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSnapshot {
    /// Event identifier
    pub event_id: EventId,
    /// Total capacity
    pub total: u32,
    /// Available tickets at the time of the snapshot
    pub available: u32,
    /// When the event takes place
    pub date: DateTime<Utc>,
}

/// Status of a booking row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Tickets are held by this booking
    Confirmed,
    /// Booking was cancelled, tickets were (or are being) returned
    Cancelled,
}

impl BookingStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(StoreError::Corrupt(format!("Invalid booking status: {s}"))),
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A booking row as held by the Ledger Store.
///
/// Rows are never deleted; the only mutation is `Confirmed -> Cancelled`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking identifier
    pub id: BookingId,
    /// Event the tickets belong to
    pub event_id: EventId,
    /// Who booked
    pub user_id: UserId,
    /// Number of tickets
    pub tickets: TicketCount,
    /// Current status
    pub status: BookingStatus,
    /// Idempotency key of the request that created this booking
    pub request_id: RequestId,
    /// When the row was created
    pub created_at: DateTime<Utc>,
    /// When the row last changed
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Whether the booking was made by `user_id`
    #[must_use]
    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.user_id == user_id
    }

    /// Whether this booking matches the parameters of a (possibly retried) request
    #[must_use]
    pub fn matches_request(&self, event_id: EventId, user_id: UserId, tickets: TicketCount) -> bool {
        self.event_id == event_id && self.user_id == user_id && self.tickets == tickets
    }
}

/// Input for [`crate::ledger::LedgerTransaction::create_booking`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBooking {
    /// Pre-allocated booking identifier
    pub id: BookingId,
    /// Event the tickets belong to
    pub event_id: EventId,
    /// Who booked
    pub user_id: UserId,
    /// Number of tickets
    pub tickets: TicketCount,
    /// Idempotency key (unique in the ledger)
    pub request_id: RequestId,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl NewBooking {
    /// Materialize the CONFIRMED row this input describes
    #[must_use]
    pub fn into_booking(self) -> Booking {
        Booking {
            id: self.id,
            event_id: self.event_id,
            user_id: self.user_id,
            tickets: self.tickets,
            status: BookingStatus::Confirmed,
            request_id: self.request_id,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// Successful result of booking tickets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingReceipt {
    /// The booking row
    pub booking: Booking,
    /// Event capacity right after the reservation (or now, for a replay)
    pub event: EventSnapshot,
    /// `true` when an earlier request with the same id already produced this booking
    pub replayed: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ticket_count_bounds() {
        assert!(TicketCount::new(0).is_err());
        assert_eq!(TicketCount::new(1).unwrap().get(), 1);
        assert_eq!(TicketCount::new(10).unwrap().get(), 10);
        assert!(matches!(
            TicketCount::new(11),
            Err(ValidationError::TicketCount { requested: 11, max: 10 })
        ));
    }

    #[test]
    fn ticket_count_rejects_out_of_range_json() {
        assert!(serde_json::from_str::<TicketCount>("3").is_ok());
        assert!(serde_json::from_str::<TicketCount>("42").is_err());
    }

    #[test]
    fn request_id_is_trimmed_and_bounded() {
        assert_eq!(RequestId::new("  abc-123 ").unwrap().as_str(), "abc-123");
        assert_eq!(RequestId::new("   "), Err(ValidationError::EmptyRequestId));
        let long = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        assert!(matches!(
            RequestId::new(long),
            Err(ValidationError::RequestIdTooLong { .. })
        ));
    }

    #[test]
    fn page_limit_is_clamped() {
        assert_eq!(Page::new(0, 0).limit, 1);
        assert_eq!(Page::new(500, 10).limit, Page::MAX_LIMIT);
        assert_eq!(Page::default().limit, Page::DEFAULT_LIMIT);
    }

    #[test]
    fn event_requires_capacity() {
        let date = Utc::now() + Duration::days(1);
        assert_eq!(
            Event::new(EventId::new(), 0, date),
            Err(ValidationError::ZeroCapacity)
        );

        let mut event = Event::new(EventId::new(), 10, date).unwrap();
        assert_eq!(event.sold(), 0);
        event.available = 4;
        assert_eq!(event.sold(), 6);
    }

    #[test]
    fn event_has_started_at_its_date() {
        let now = Utc::now();
        let event = Event::new(EventId::new(), 1, now).unwrap();
        assert!(event.has_started(now));
        assert!(!event.has_started(now - Duration::seconds(1)));
    }

    #[test]
    fn booking_status_parse() {
        assert_eq!(BookingStatus::parse("confirmed").unwrap(), BookingStatus::Confirmed);
        assert_eq!(BookingStatus::parse("cancelled").unwrap(), BookingStatus::Cancelled);
        assert!(BookingStatus::parse("refunded").is_err());
    }

    #[test]
    fn only_admin_is_privileged() {
        assert!(RequesterRole::Admin.is_privileged());
        assert!(!RequesterRole::Customer.is_privileged());
    }
}
