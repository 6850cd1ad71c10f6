//! Redis Capacity Store for the boxoffice booking coordinator.
//!
//! Each event is one hash at `event:{id}` with the fields `total`, `available` and
//! `date` (RFC 3339). Every mutation of `available` runs as a server-side Lua script,
//! so the read-check-write happens inside Redis and concurrent reservations for the
//! same event are serialized there.
//!
//! Holds live in a second hash per event, `event:{id}:holds`, mapping each request id
//! to the attempt holding its tickets or `released`. The scripts read and write it in
//! the same step as the counter, so a repeated `reserve` or `restore` applies once.
//!
//! # Example
//!
//! ```no_run
//! use boxoffice_core::{AttemptId, Event, EventId, RequestId, TicketCount};
//! use boxoffice_core::capacity::CapacityStore;
//! use boxoffice_redis::RedisCapacityStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisCapacityStore::new("redis://127.0.0.1:6379").await?;
//! let event = Event::new(EventId::new(), 100, chrono::Utc::now())?;
//! store.register_event(&event).await?;
//!
//! let request_id = RequestId::new("checkout-1")?;
//! let outcome = store
//!     .reserve(event.id, TicketCount::new(2)?, &request_id, AttemptId::new())
//!     .await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod capacity;

pub use capacity::RedisCapacityStore;
