//! Subcommand implementations.
//!
//! Reports go to stdout as one JSON object per line; diagnostics go through `tracing`.

use crate::cli::Command;
use crate::config::ReconcilerConfig;
use anyhow::{Context, bail};
use boxoffice_core::EventId;
use boxoffice_core::environment::SystemClock;
use boxoffice_postgres::{PgPool, PostgresLedgerStore, PostgresReconciliationLog};
use boxoffice_redis::RedisCapacityStore;
use boxoffice_runtime::{BookingCoordinator, RecoverySweep};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(command: Command, config: &ReconcilerConfig) -> anyhow::Result<()> {
    let pool = boxoffice_postgres::connect(&config.ledger_database_url, config.ledger_pool_size)
        .await
        .context("Failed to connect to the ledger database")?;

    match command {
        Command::Migrate => boxoffice_postgres::migrate(&pool)
            .await
            .context("Failed to migrate the ledger schema"),
        Command::Sweep { batch_size, every } => {
            let sweep = recovery(config, pool).await?.with_batch_size(batch_size);
            match every {
                None => {
                    let report = sweep.sweep(sweep.now()).await.context("Recovery sweep failed")?;
                    emit(&report)
                }
                Some(secs) => watch(&sweep, Duration::from_secs(secs.max(1))).await,
            }
        }
        Command::Audit { events } => {
            let sweep = recovery(config, pool).await?;
            let mut drifted = 0;
            for event_id in events {
                let report = sweep
                    .audit(EventId::from_uuid(event_id))
                    .await
                    .with_context(|| format!("Audit of event {event_id} failed"))?;
                if !report.is_consistent() {
                    drifted += 1;
                }
                emit(&report)?;
            }
            if drifted > 0 {
                bail!("{drifted} event(s) have capacity drift");
            }
            Ok(())
        }
        Command::Pending { limit } => {
            let log = PostgresReconciliationLog::new(pool);
            let total = log.count_pending().await?;
            for entry in log.list_pending(limit).await? {
                emit(&entry)?;
            }
            tracing::info!(total, limit, "Listed pending reconciliation entries");
            Ok(())
        }
        Command::Show { id } => {
            let log = PostgresReconciliationLog::new(pool);
            match log.get_by_id(id).await? {
                Some(entry) => emit(&entry),
                None => bail!("No reconciliation entry {id}"),
            }
        }
        Command::Resolve { id, by, notes } => {
            let log = PostgresReconciliationLog::new(pool);
            let entry = log
                .mark_resolved(id, &by, notes.as_deref(), chrono::Utc::now())
                .await
                .with_context(|| format!("Failed to close reconciliation entry {id}"))?;
            emit(&entry)
        }
        Command::Discard { id, by, reason } => {
            let log = PostgresReconciliationLog::new(pool);
            let entry = log
                .mark_discarded(id, &by, &reason, chrono::Utc::now())
                .await
                .with_context(|| format!("Failed to close reconciliation entry {id}"))?;
            emit(&entry)
        }
    }
}

async fn recovery(config: &ReconcilerConfig, pool: PgPool) -> anyhow::Result<RecoverySweep> {
    let Some(redis_url) = config.capacity_redis_url.as_deref() else {
        bail!("CAPACITY_REDIS_URL is not set");
    };
    let capacity = RedisCapacityStore::new(redis_url)
        .await
        .context("Failed to connect to the capacity store")?;

    let coordinator = BookingCoordinator::new(
        Arc::new(capacity),
        Arc::new(PostgresLedgerStore::new(pool.clone())),
        Arc::new(PostgresReconciliationLog::new(pool)),
        Arc::new(SystemClock),
    )
    .with_config(config.coordinator.clone());

    Ok(coordinator.recovery_sweep())
}

async fn watch(sweep: &RecoverySweep, period: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(period);
    tracing::info!(period_secs = period.as_secs(), "Sweeping until interrupted");

    loop {
        tokio::select! {
            _ = ticker.tick() => match sweep.sweep(sweep.now()).await {
                Ok(report) => emit(&report)?,
                Err(error) => tracing::error!(%error, "Recovery sweep failed, retrying next period"),
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for interrupt")?;
                tracing::info!("Interrupted, stopping sweeps");
                return Ok(());
            }
        }
    }
}

fn emit<T: Serialize>(report: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}
