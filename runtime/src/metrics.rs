//! Prometheus metrics for the booking coordinator.
//!
//! This module provides metric collection for:
//! - Booking outcomes (confirmed, rejected by reason, replayed)
//! - Compensations and reconciliation entries
//! - Store call timeouts
//! - Retries
//!
//! # Example
//!
//! ```rust,no_run
//! use boxoffice_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter.
///
/// Installs the global recorder and serves `/metrics` on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Install the recorder and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime so the listener can be spawned.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a warning
    /// and returns `Ok(())`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install() {
            Ok(()) => {
                self.started = true;
                tracing::info!(
                    addr = %self.addr,
                    "Metrics exporter started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Whether this instance installed the exporter.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Booking Metrics
    describe_counter!(
        "booking_confirmed_total",
        "Total number of bookings confirmed"
    );
    describe_counter!(
        "booking_replayed_total",
        "Total number of booking requests answered from an earlier identical request"
    );
    describe_counter!(
        "booking_rejected_total",
        "Total number of booking requests rejected, by reason"
    );
    describe_counter!(
        "booking_cancelled_total",
        "Total number of bookings cancelled"
    );
    describe_histogram!(
        "booking_duration_seconds",
        "Time taken to run a booking saga end to end"
    );

    // Compensation Metrics
    describe_counter!(
        "booking_compensations_total",
        "Total number of compensations attempted, by outcome"
    );
    describe_counter!(
        "reconciliation_entries_total",
        "Total number of reconciliation log entries recorded, by kind"
    );
    describe_counter!(
        "reconciliation_unrecorded_total",
        "Discrepancies that could not be written to the reconciliation log"
    );
    describe_counter!(
        "reconciliation_log_inserts_total",
        "Rows inserted into the durable reconciliation log, by kind"
    );
    describe_counter!(
        "reconciliation_closed_total",
        "Reconciliation entries closed by an operator, by status"
    );

    // Store Metrics
    describe_counter!(
        "store_call_timeouts_total",
        "Total number of store calls that exceeded their timeout, by store"
    );

    // Retry Metrics
    describe_counter!(
        "retry_attempts_total",
        "Total number of retry attempts"
    );
    describe_counter!(
        "retry_successes_total",
        "Total number of successful retries"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Booking metrics recorder.
pub struct BookingMetrics;

impl BookingMetrics {
    /// Record a confirmed booking.
    pub fn record_confirmed(duration: Duration) {
        counter!("booking_confirmed_total").increment(1);
        histogram!("booking_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a replayed booking.
    pub fn record_replayed() {
        counter!("booking_replayed_total").increment(1);
    }

    /// Record a rejected booking.
    pub fn record_rejected(reason: &'static str) {
        counter!("booking_rejected_total", "reason" => reason).increment(1);
    }

    /// Record a cancellation.
    pub fn record_cancelled() {
        counter!("booking_cancelled_total").increment(1);
    }

    /// Record a compensation attempt.
    pub fn record_compensation(outcome: &'static str) {
        counter!("booking_compensations_total", "outcome" => outcome).increment(1);
    }
}

/// Reconciliation metrics recorder.
pub struct ReconciliationMetrics;

impl ReconciliationMetrics {
    /// Record a written reconciliation entry.
    pub fn record_entry(kind: &'static str) {
        counter!("reconciliation_entries_total", "kind" => kind).increment(1);
    }

    /// Record a discrepancy that could not be written.
    pub fn record_unrecorded(kind: &'static str) {
        counter!("reconciliation_unrecorded_total", "kind" => kind).increment(1);
    }
}

/// Store call metrics recorder.
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record a store call timeout.
    pub fn record_timeout(store: &'static str) {
        counter!("store_call_timeouts_total", "store" => store).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let server = MetricsServer::new(addr);
        assert!(!server.is_started());
    }

    #[test]
    fn recorders_are_safe_without_an_installed_recorder() {
        BookingMetrics::record_confirmed(Duration::from_millis(12));
        BookingMetrics::record_rejected("insufficient_capacity");
        ReconciliationMetrics::record_entry("compensated");
        StoreMetrics::record_timeout("capacity");
        RetryMetrics::record_attempt();
    }
}
