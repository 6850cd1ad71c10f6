//! Coordinator configuration.
//!
//! Every knob has a default; `from_env` overrides them from `BOXOFFICE_*` variables.
//!
//! | variable | default |
//! |----------|---------|
//! | `BOXOFFICE_STORE_TIMEOUT_MS` | 2000 |
//! | `BOXOFFICE_RETRY_MAX` | 3 |
//! | `BOXOFFICE_RETRY_INITIAL_DELAY_MS` | 100 |
//! | `BOXOFFICE_RETRY_MAX_DELAY_MS` | 5000 |
//! | `BOXOFFICE_RETRY_JITTER` | true |
//! | `BOXOFFICE_COMPENSATION_RETRY_MAX` | 3 |
//! | `BOXOFFICE_INTENT_JOURNAL` | true |
//! | `BOXOFFICE_INTENT_GRACE_SECS` | 300 |
//! | `BOXOFFICE_ABORT_ON_UNRECORDED` | false |
//!
//! # Example
//!
//! ```no_run
//! use boxoffice_runtime::config::CoordinatorConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoordinatorConfig::from_env()?;
//! println!("store timeout: {:?}", config.store_timeout);
//! # Ok(())
//! # }
//! ```

use crate::retry::RetryPolicy;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set but could not be parsed
    #[error("Invalid value for {name}: {value:?}")]
    Parse {
        /// Variable name
        name: String,
        /// Raw value
        value: String,
    },
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Settings for [`BookingCoordinator`](crate::coordinator::BookingCoordinator).
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Deadline for every individual store call
    pub store_timeout: Duration,
    /// Policy for `book_tickets_with_retry`
    pub retry: RetryPolicy,
    /// Policy for the capacity restore during compensation
    pub compensation_retry: RetryPolicy,
    /// Journal a reservation intent before touching capacity
    pub intent_journal: bool,
    /// How long an intent may stay pending before the sweep looks at it
    pub intent_grace: Duration,
    /// Abort the process when a critical discrepancy cannot be recorded
    pub abort_on_unrecorded_discrepancy: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            compensation_retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(50))
                .max_delay(Duration::from_secs(1))
                .build(),
            intent_journal: true,
            intent_grace: Duration::from_secs(300),
            abort_on_unrecorded_discrepancy: false,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparsable value or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparsable value or the result
    /// fails validation.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let store_timeout = read::<u64, _>(&lookup, "BOXOFFICE_STORE_TIMEOUT_MS")?
            .map_or(defaults.store_timeout, Duration::from_millis);

        let retry = RetryPolicy::builder()
            .max_retries(read(&lookup, "BOXOFFICE_RETRY_MAX")?.unwrap_or(defaults.retry.max_retries))
            .initial_delay(
                read::<u64, _>(&lookup, "BOXOFFICE_RETRY_INITIAL_DELAY_MS")?
                    .map_or(defaults.retry.initial_delay, Duration::from_millis),
            )
            .max_delay(
                read::<u64, _>(&lookup, "BOXOFFICE_RETRY_MAX_DELAY_MS")?
                    .map_or(defaults.retry.max_delay, Duration::from_millis),
            )
            .multiplier(defaults.retry.multiplier)
            .jitter(read_bool(&lookup, "BOXOFFICE_RETRY_JITTER")?.unwrap_or(defaults.retry.jitter))
            .build();

        let mut compensation_retry = defaults.compensation_retry;
        if let Some(max) = read(&lookup, "BOXOFFICE_COMPENSATION_RETRY_MAX")? {
            compensation_retry.max_retries = max;
        }

        let config = Self {
            store_timeout,
            retry,
            compensation_retry,
            intent_journal: read_bool(&lookup, "BOXOFFICE_INTENT_JOURNAL")?
                .unwrap_or(defaults.intent_journal),
            intent_grace: read::<u64, _>(&lookup, "BOXOFFICE_INTENT_GRACE_SECS")?
                .map_or(defaults.intent_grace, Duration::from_secs),
            abort_on_unrecorded_discrepancy: read_bool(&lookup, "BOXOFFICE_ABORT_ON_UNRECORDED")?
                .unwrap_or(defaults.abort_on_unrecorded_discrepancy),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout.is_zero() {
            return Err(ConfigError::Validation("store_timeout must be > 0".to_string()));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::Validation(
                "retry initial delay must not exceed max delay".to_string(),
            ));
        }
        if self.intent_grace <= self.store_timeout {
            return Err(ConfigError::Validation(
                "intent_grace must be longer than store_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

fn read<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::Parse {
                name: name.to_string(),
                value: value.clone(),
            })
        })
        .transpose()
}

fn read_bool<F>(lookup: &F, name: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Parse {
                name: name.to_string(),
                value: value.clone(),
            }),
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = CoordinatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.store_timeout, Duration::from_secs(2));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.compensation_retry.max_retries, 3);
        assert!(config.intent_journal);
        assert!(!config.abort_on_unrecorded_discrepancy);
    }

    #[test]
    fn variables_override_defaults() {
        let config = CoordinatorConfig::from_lookup(lookup(&[
            ("BOXOFFICE_STORE_TIMEOUT_MS", "750"),
            ("BOXOFFICE_RETRY_MAX", "5"),
            ("BOXOFFICE_RETRY_JITTER", "off"),
            ("BOXOFFICE_COMPENSATION_RETRY_MAX", "7"),
            ("BOXOFFICE_INTENT_JOURNAL", "false"),
            ("BOXOFFICE_ABORT_ON_UNRECORDED", "1"),
        ]))
        .unwrap();

        assert_eq!(config.store_timeout, Duration::from_millis(750));
        assert_eq!(config.retry.max_retries, 5);
        assert!(!config.retry.jitter);
        assert_eq!(config.compensation_retry.max_retries, 7);
        assert!(!config.intent_journal);
        assert!(config.abort_on_unrecorded_discrepancy);
    }

    #[test]
    fn garbage_values_are_reported_by_name() {
        let err = CoordinatorConfig::from_lookup(lookup(&[("BOXOFFICE_RETRY_MAX", "many")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                name: "BOXOFFICE_RETRY_MAX".to_string(),
                value: "many".to_string(),
            }
        );
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err =
            CoordinatorConfig::from_lookup(lookup(&[("BOXOFFICE_STORE_TIMEOUT_MS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
