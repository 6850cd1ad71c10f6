//! Error taxonomy for booking operations.
//!
//! Two layers:
//!
//! - [`StoreError`]: what an adapter reports about one store call.
//! - [`BookingError`]: the closed set of outcomes the coordinator hands to callers.
//!
//! Business rejections carry typed payloads (for example the availability at the time
//! of rejection) instead of formatted messages.

use crate::types::{BookingId, BookingStatus, EventId, RequestId, UserId};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during a single store call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or rejected the call for a transient reason.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured timeout.
    ///
    /// The outcome is unknown: the write may or may not have been applied.
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// A booking with this request id already exists (ledger uniqueness constraint).
    #[error("Duplicate request id: {0}")]
    DuplicateRequest(RequestId),

    /// Checked status transition found the row in a different state.
    #[error("Booking {id} is {actual}, expected {expected}")]
    StatusConflict {
        /// Booking whose status was being changed
        id: BookingId,
        /// Status the transition required
        expected: BookingStatus,
        /// Status actually found
        actual: BookingStatus,
    },

    /// The addressed row does not exist.
    #[error("Record not found")]
    NotFound,

    /// Stored data could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether repeating the call could succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Input that failed validation before any store was touched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// Ticket count outside the accepted range
    #[error("Ticket count {requested} is outside 1..={max}")]
    TicketCount {
        /// Requested count
        requested: u32,
        /// Largest accepted count
        max: u32,
    },

    /// Request id was empty or whitespace
    #[error("Request id must not be empty")]
    EmptyRequestId,

    /// Request id exceeded the maximum length
    #[error("Request id is {len} bytes, maximum is {max}")]
    RequestIdTooLong {
        /// Actual length in bytes
        len: usize,
        /// Maximum length in bytes
        max: usize,
    },

    /// Event capacity must be at least one ticket
    #[error("Event capacity must be at least 1")]
    ZeroCapacity,
}

/// How the outer layer should treat a [`BookingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected business outcome or caller mistake; nothing happened, do not retry as-is.
    Rejected,
    /// Store failure; retry with the same request id and backoff.
    Transient,
    /// Capacity and ledger disagree and could not be repaired automatically.
    /// A failure response here does not mean nothing happened.
    Critical,
}

/// Outcome of a failed booking or cancellation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Bad input shape or range
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The event does not exist in the Capacity Store
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// The booking does not exist in the Ledger Store
    #[error("Booking not found: {0}")]
    BookingNotFound(BookingId),

    /// Not enough tickets left
    #[error("Insufficient capacity for event {event_id}: requested {requested}, available {available}")]
    InsufficientCapacity {
        /// Event that was sold out (or nearly)
        event_id: EventId,
        /// Tickets requested
        requested: u32,
        /// Tickets available when the reservation was refused
        available: u32,
    },

    /// The event date is not in the future
    #[error("Event {event_id} took place at {date}")]
    EventExpired {
        /// Event that already started
        event_id: EventId,
        /// Scheduled date
        date: DateTime<Utc>,
    },

    /// The request id was already used for a different booking
    #[error("Request id {request_id} was already used with different parameters")]
    Conflict {
        /// Reused idempotency key
        request_id: RequestId,
    },

    /// Requester may not act on this booking
    #[error("User {requester} may not cancel booking {booking_id}")]
    Forbidden {
        /// Target booking
        booking_id: BookingId,
        /// Who asked
        requester: UserId,
    },

    /// Booking is already cancelled
    #[error("Booking {0} is already cancelled")]
    AlreadyCancelled(BookingId),

    /// A capacity change would leave fewer seats than were already sold
    #[error("Event {event_id} cannot shrink to {requested_total}: {sold} tickets already sold")]
    CapacityBelowSold {
        /// Event being resized
        event_id: EventId,
        /// Requested new total
        requested_total: u32,
        /// Tickets currently sold
        sold: u32,
    },

    /// Transient store failure
    #[error("Persistence error: {0}")]
    Persistence(#[source] StoreError),

    /// Capacity was reserved, the ledger write failed, and restoring capacity failed too.
    #[error(
        "Compensation failed for request {request_id} on event {event_id} ({tickets} tickets): \
         ledger error: {ledger_error}; restore error: {restore_error}"
    )]
    CompensationFailure {
        /// Event whose capacity is under-counted
        event_id: EventId,
        /// Tickets that could not be returned
        tickets: u32,
        /// Request that triggered the saga
        request_id: RequestId,
        /// Why the ledger write failed
        ledger_error: StoreError,
        /// Why the restore failed
        restore_error: StoreError,
        /// Reconciliation log entry, `None` when even recording failed
        reconciliation_id: Option<i64>,
    },
}

impl BookingError {
    /// Classify this error for the outer layer.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Persistence(_) => ErrorClass::Transient,
            Self::CompensationFailure { .. } => ErrorClass::Critical,
            _ => ErrorClass::Rejected,
        }
    }

    /// Whether the caller should retry with the same request id
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Short stable label, used as a metrics tag
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::EventNotFound(_) | Self::BookingNotFound(_) => "not_found",
            Self::InsufficientCapacity { .. } => "insufficient_capacity",
            Self::EventExpired { .. } => "event_expired",
            Self::Conflict { .. } => "conflict",
            Self::Forbidden { .. } => "forbidden",
            Self::AlreadyCancelled(_) => "already_cancelled",
            Self::CapacityBelowSold { .. } => "capacity_below_sold",
            Self::Persistence(_) => "persistence",
            Self::CompensationFailure { .. } => "compensation_failure",
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(error: StoreError) -> Self {
        Self::Persistence(error)
    }
}
