//! Stages of one booking operation.
//!
//! ```text
//! Start ──► Reserved ──► LedgerWritten ──► Done
//!   │           │              │
//!   │           └──► LedgerFailed ◄┘
//!   │                   │
//!   │               Compensating ──► Compensated ──► Replayed
//!   │                   │
//!   │                   └──► CompensationFailed
//!   │
//!   ├──► Replayed | Aborted | EventExpired | InsufficientCapacity
//! ```
//!
//! Once a booking reaches `Reserved` it can only end in `Done`, `Compensated`,
//! `CompensationFailed` or `Replayed` (after compensating a lost duplicate race).

use boxoffice_core::RequestId;
use std::fmt;
use thiserror::Error;

/// One stage of the booking saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookingStage {
    /// Nothing has happened yet
    Start,
    /// Answered from an earlier booking with the same request id
    Replayed,
    /// Failed before capacity was touched
    Aborted,
    /// The event already took place
    EventExpired,
    /// The capacity store refused the decrement
    InsufficientCapacity,
    /// Capacity was decremented
    Reserved,
    /// Booking row committed
    LedgerWritten,
    /// Booking complete
    Done,
    /// Ledger write or commit failed after the reservation
    LedgerFailed,
    /// Restoring the reserved capacity
    Compensating,
    /// Reserved capacity was restored
    Compensated,
    /// Restoring failed; capacity is under-counted
    CompensationFailed,
}

impl BookingStage {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Start,
                Self::Replayed | Self::Aborted | Self::EventExpired | Self::InsufficientCapacity | Self::Reserved
            ) | (Self::Reserved, Self::LedgerWritten | Self::LedgerFailed)
                | (Self::LedgerWritten, Self::Done)
                | (Self::LedgerFailed, Self::Compensating)
                | (Self::Compensating, Self::Compensated | Self::CompensationFailed)
                | (Self::Compensated, Self::Replayed)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Replayed
                | Self::Aborted
                | Self::EventExpired
                | Self::InsufficientCapacity
                | Self::Done
                | Self::CompensationFailed
        )
    }

    /// Whether capacity may currently be held by this operation.
    #[must_use]
    pub const fn holds_capacity(self) -> bool {
        matches!(
            self,
            Self::Reserved | Self::LedgerWritten | Self::Done | Self::LedgerFailed | Self::Compensating | Self::CompensationFailed
        )
    }

    /// Stable lowercase label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Replayed => "replayed",
            Self::Aborted => "aborted",
            Self::EventExpired => "event_expired",
            Self::InsufficientCapacity => "insufficient_capacity",
            Self::Reserved => "reserved",
            Self::LedgerWritten => "ledger_written",
            Self::Done => "done",
            Self::LedgerFailed => "ledger_failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation_failed",
        }
    }
}

impl fmt::Display for BookingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempted an illegal stage transition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal booking stage transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Current stage
    pub from: BookingStage,
    /// Rejected target
    pub to: BookingStage,
}

/// Stage tracker for one booking operation.
#[derive(Debug, Clone)]
pub struct BookingSaga {
    request_id: RequestId,
    stage: BookingStage,
}

impl BookingSaga {
    /// Start tracking a booking operation
    #[must_use]
    pub const fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            stage: BookingStage::Start,
        }
    }

    /// Current stage
    #[must_use]
    pub const fn stage(&self) -> BookingStage {
        self.stage
    }

    /// Idempotency key of the operation
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Move to `next`, returning the stage left behind.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and stays put if the transition is not legal.
    pub fn advance(&mut self, next: BookingStage) -> Result<BookingStage, InvalidTransition> {
        if !self.stage.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        let previous = self.stage;
        self.stage = next;
        Ok(previous)
    }
}
