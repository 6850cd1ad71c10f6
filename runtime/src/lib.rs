//! # Boxoffice Runtime
//!
//! The booking coordinator and everything it needs at run time.
//!
//! ## Core Components
//!
//! - **`BookingCoordinator`**: the saga across the Capacity Store and the Ledger Store
//! - **`RecoverySweep`**: finds reservations a crash left behind, audits capacity
//! - **`FileReconciliationLog`**: append-only JSON-lines reconciliation log
//! - **`BookingObserver`**: injected observability hooks (`TracingObserver` by default)
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_runtime::{BookingCoordinator, BookingRequest, CoordinatorConfig};
//! use boxoffice_core::environment::SystemClock;
//! use std::sync::Arc;
//!
//! let coordinator = BookingCoordinator::new(capacity, ledger, reconciliation, Arc::new(SystemClock))
//!     .with_config(CoordinatorConfig::from_env()?);
//!
//! let receipt = coordinator
//!     .book_tickets(BookingRequest {
//!         event_id,
//!         user_id,
//!         tickets: 2,
//!         request_id: "checkout-7f3a".to_string(),
//!     })
//!     .await?;
//! println!("{} tickets left", receipt.event.available);
//! ```

/// Coordinator configuration from the environment
pub mod config;

/// The booking saga
pub mod coordinator;

/// File-backed reconciliation log
pub mod journal;

/// Prometheus metrics for observability
pub mod metrics;

/// Observability hooks
pub mod observer;

/// Recovery sweep and capacity audit
pub mod recovery;

/// Retry logic with exponential backoff
pub mod retry;

/// Booking saga stages
pub mod saga;

pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{BookingCoordinator, BookingRequest};
pub use journal::FileReconciliationLog;
pub use observer::{BookingObserver, NoopObserver, TracingObserver};
pub use recovery::{AuditReport, RecoverySweep, SweepReport};
pub use retry::RetryPolicy;
pub use saga::BookingStage;
