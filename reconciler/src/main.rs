//! Operator tool for the boxoffice booking stores.
//!
//! ```text
//! boxoffice-reconciler migrate
//! boxoffice-reconciler sweep --every 60
//! boxoffice-reconciler audit --event <uuid>
//! boxoffice-reconciler pending
//! boxoffice-reconciler resolve 42 --by alice --notes "restored 2 tickets"
//! boxoffice-reconciler discard 43 --by alice --reason "booking found in backup"
//! ```

mod cli;
mod commands;
mod config;

use anyhow::Context;
use boxoffice_runtime::metrics::MetricsServer;
use clap::Parser;
use cli::Cli;
use config::ReconcilerConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ReconcilerConfig::from_env().context("Invalid configuration")?;

    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr).start()?;
    }

    commands::run(cli.command, &config).await
}
