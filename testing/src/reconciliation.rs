//! In-memory Reconciliation Log.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::faults::FaultSwitch;
use boxoffice_core::reconciliation::{
    CompensationOutcome, ReconciliationEntry, ReconciliationId, ReconciliationSink, ReconciliationStatus,
};
use boxoffice_core::{BoxFuture, DateTime, StoreError, Utc};
use std::sync::{Arc, Mutex};

/// Vector-backed reconciliation log with an injectable write failure.
#[derive(Clone, Debug, Default)]
pub struct InMemoryReconciliationLog {
    entries: Arc<Mutex<Vec<ReconciliationEntry>>>,
    record_faults: Arc<FaultSwitch>,
}

impl InMemoryReconciliationLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Planned failures for `record`
    #[must_use]
    pub fn faults(&self) -> &FaultSwitch {
        &self.record_faults
    }

    /// Every recorded entry, in order.
    #[must_use]
    pub fn entries(&self) -> Vec<ReconciliationEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Recorded outcomes, in order.
    #[must_use]
    pub fn outcomes(&self) -> Vec<CompensationOutcome> {
        self.entries().into_iter().map(|entry| entry.outcome).collect()
    }

    /// Entries awaiting an operator.
    #[must_use]
    pub fn pending(&self) -> Vec<ReconciliationEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.status == ReconciliationStatus::Pending)
            .collect()
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl ReconciliationSink for InMemoryReconciliationLog {
    fn record(
        &self,
        outcome: CompensationOutcome,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<ReconciliationId, StoreError>> {
        Box::pin(async move {
            self.record_faults.enter().await?;
            let mut entries = self.entries.lock().unwrap();
            let id = ReconciliationId::try_from(entries.len()).unwrap() + 1;
            entries.push(ReconciliationEntry {
                id,
                severity: outcome.severity(),
                status: outcome.initial_status(),
                outcome,
                recorded_at: at,
                resolved_at: None,
                resolved_by: None,
                resolution_notes: None,
            });
            Ok(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxoffice_core::{EventId, RequestId};

    #[tokio::test]
    async fn records_in_order() {
        let log = InMemoryReconciliationLog::new();
        let outcome = CompensationOutcome::Compensated {
            request_id: RequestId::new("req-1").unwrap(),
            event_id: EventId::new(),
            tickets: 2,
            ledger_error: "boom".to_string(),
        };
        assert_eq!(log.record(outcome.clone(), Utc::now()).await.unwrap(), 1);
        assert_eq!(log.record(outcome, Utc::now()).await.unwrap(), 2);
        assert_eq!(log.len(), 2);
        assert!(log.pending().is_empty());
    }

    #[tokio::test]
    async fn failed_writes_record_nothing() {
        let log = InMemoryReconciliationLog::new();
        log.faults().fail_next(crate::faults::unavailable("disk full"));
        let outcome = CompensationOutcome::CapacityDrift {
            event_id: EventId::new(),
            total: 10,
            available: 3,
            confirmed: 5,
        };
        assert!(log.record(outcome, Utc::now()).await.is_err());
        assert!(log.is_empty());
    }
}
