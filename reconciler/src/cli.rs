//! Command line definitions.

use boxoffice_core::reconciliation::ReconciliationId;
use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Recovery and review tool for the boxoffice booking stores
#[derive(Parser, Debug)]
#[command(name = "boxoffice-reconciler")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Apply the ledger schema migrations
    Migrate,

    /// Flag reservations that never reached the ledger
    Sweep {
        /// Stale intents examined per pass
        #[arg(long, default_value_t = 100)]
        batch_size: u32,

        /// Keep sweeping every N seconds until interrupted
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },

    /// Compare capacity counters with confirmed bookings
    Audit {
        /// Event to audit (repeatable)
        #[arg(long = "event", required = true)]
        events: Vec<Uuid>,
    },

    /// List reconciliation entries awaiting an operator
    Pending {
        /// Maximum entries to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Print one reconciliation entry
    Show {
        /// Entry id
        id: ReconciliationId,
    },

    /// Close an entry after repairing the discrepancy
    Resolve {
        /// Entry id
        id: ReconciliationId,

        /// Operator closing the entry
        #[arg(long)]
        by: String,

        /// What was done
        #[arg(long)]
        notes: Option<String>,
    },

    /// Close an entry without repair
    Discard {
        /// Entry id
        id: ReconciliationId,

        /// Operator closing the entry
        #[arg(long)]
        by: String,

        /// Why no repair is needed
        #[arg(long)]
        reason: String,
    },
}
