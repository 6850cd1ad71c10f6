//! Environment configuration.
//!
//! | Variable | Default |
//! |---|---|
//! | `LEDGER_DATABASE_URL` | required |
//! | `CAPACITY_REDIS_URL` | unset (sweep and audit need it) |
//! | `LEDGER_POOL_SIZE` | 5 |
//! | `METRICS_ADDR` | unset (no exporter) |
//!
//! Coordinator settings come from the `BOXOFFICE_*` variables.

use boxoffice_runtime::{ConfigError, CoordinatorConfig};
use std::net::SocketAddr;

const DEFAULT_POOL_SIZE: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    pub ledger_database_url: String,
    pub capacity_redis_url: Option<String>,
    pub ledger_pool_size: u32,
    pub metrics_addr: Option<SocketAddr>,
    pub coordinator: CoordinatorConfig,
}

impl ReconcilerConfig {
    /// Read the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable is missing or malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ledger_database_url = lookup("LEDGER_DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConfigError::Validation("LEDGER_DATABASE_URL is not set".to_string()))?;

        let ledger_pool_size = match lookup("LEDGER_POOL_SIZE") {
            Some(value) => value
                .trim()
                .parse()
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| ConfigError::Parse {
                    name: "LEDGER_POOL_SIZE".to_string(),
                    value: value.clone(),
                })?,
            None => DEFAULT_POOL_SIZE,
        };

        let metrics_addr = lookup("METRICS_ADDR")
            .map(|value| {
                value.trim().parse().map_err(|_| ConfigError::Parse {
                    name: "METRICS_ADDR".to_string(),
                    value: value.clone(),
                })
            })
            .transpose()?;

        Ok(Self {
            ledger_database_url,
            capacity_redis_url: lookup("CAPACITY_REDIS_URL").filter(|url| !url.trim().is_empty()),
            ledger_pool_size,
            metrics_addr,
            coordinator: CoordinatorConfig::from_lookup(lookup)?,
        })
    }
}
