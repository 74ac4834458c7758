//! Configuration loading and representation.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `PROVENANCE_STORE` | `memory` | `memory` or `sqlite` |
//! | `PROVENANCE_SQLITE_URL` | `sqlite://provenance.db` | database url when `sqlite` |
//! | `PROVENANCE_STORE_TIMEOUT_MS` | `5000` | bound on every store call |
//! | `PROVENANCE_STORE_RETRIES` | `3` | registry attempts on a retryable store failure |
//! | `PROVENANCE_LEDGER_URL` | unset | JSON-RPC endpoint; unset runs the simulated ledger |
//! | `PROVENANCE_LEDGER_TIMEOUT_MS` | `10000` | per-request ledger timeout |
//! | `PROVENANCE_ANCHOR_MAX_ATTEMPTS` | `5` | submit attempts per event |
//! | `PROVENANCE_ANCHOR_BASE_DELAY_MS` | `500` | first anchor backoff delay |
//! | `PROVENANCE_ANCHOR_MAX_DELAY_MS` | `30000` | anchor backoff cap |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} is required when {when}")]
    Missing { key: &'static str, when: &'static str },
}

/// Persistence backend for products and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "in_memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(format!("unknown store backend '{other}' (expected memory or sqlite)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvenanceConfig {
    pub store: StoreBackend,
    pub sqlite_url: String,
    pub store_timeout_ms: u64,
    pub store_retries: u32,
    /// `None` runs against the simulated ledger.
    pub ledger_url: Option<String>,
    pub ledger_timeout_ms: u64,
    pub anchor_max_attempts: u32,
    pub anchor_base_delay_ms: u64,
    pub anchor_max_delay_ms: u64,
}

impl Default for ProvenanceConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Memory,
            sqlite_url: "sqlite://provenance.db".to_string(),
            store_timeout_ms: 5_000,
            store_retries: 3,
            ledger_url: None,
            ledger_timeout_ms: 10_000,
            anchor_max_attempts: 5,
            anchor_base_delay_ms: 500,
            anchor_max_delay_ms: 30_000,
        }
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

impl ProvenanceConfig {
    /// Read `PROVENANCE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("PROVENANCE_STORE") {
            config.store = parse("PROVENANCE_STORE", &raw)?;
        }
        if let Some(raw) = lookup("PROVENANCE_SQLITE_URL") {
            config.sqlite_url = raw.trim().to_string();
        }
        if let Some(raw) = lookup("PROVENANCE_STORE_TIMEOUT_MS") {
            config.store_timeout_ms = parse("PROVENANCE_STORE_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("PROVENANCE_STORE_RETRIES") {
            config.store_retries = parse("PROVENANCE_STORE_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("PROVENANCE_LEDGER_URL") {
            let raw = raw.trim();
            config.ledger_url = (!raw.is_empty()).then(|| raw.to_string());
        }
        if let Some(raw) = lookup("PROVENANCE_LEDGER_TIMEOUT_MS") {
            config.ledger_timeout_ms = parse("PROVENANCE_LEDGER_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("PROVENANCE_ANCHOR_MAX_ATTEMPTS") {
            config.anchor_max_attempts = parse("PROVENANCE_ANCHOR_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("PROVENANCE_ANCHOR_BASE_DELAY_MS") {
            config.anchor_base_delay_ms = parse("PROVENANCE_ANCHOR_BASE_DELAY_MS", &raw)?;
        }
        if let Some(raw) = lookup("PROVENANCE_ANCHOR_MAX_DELAY_MS") {
            config.anchor_max_delay_ms = parse("PROVENANCE_ANCHOR_MAX_DELAY_MS", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store == StoreBackend::Sqlite && self.sqlite_url.is_empty() {
            return Err(ConfigError::Missing {
                key: "PROVENANCE_SQLITE_URL",
                when: "PROVENANCE_STORE=sqlite",
            });
        }

        let positive = [
            ("PROVENANCE_STORE_TIMEOUT_MS", self.store_timeout_ms),
            ("PROVENANCE_LEDGER_TIMEOUT_MS", self.ledger_timeout_ms),
            ("PROVENANCE_ANCHOR_MAX_ATTEMPTS", u64::from(self.anchor_max_attempts)),
            ("PROVENANCE_STORE_RETRIES", u64::from(self.store_retries)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.anchor_base_delay_ms > self.anchor_max_delay_ms {
            return Err(ConfigError::Invalid {
                key: "PROVENANCE_ANCHOR_BASE_DELAY_MS",
                value: self.anchor_base_delay_ms.to_string(),
                reason: format!("exceeds PROVENANCE_ANCHOR_MAX_DELAY_MS ({})", self.anchor_max_delay_ms),
            });
        }

        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    /// Registry policy for retryable store failures; `store_retries` counts every attempt.
    pub fn registry_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.store_retries, Duration::from_millis(10), Duration::from_millis(500))
    }

    pub fn submit_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.anchor_max_attempts,
            Duration::from_millis(self.anchor_base_delay_ms),
            Duration::from_millis(self.anchor_max_delay_ms),
        )
    }

    /// Confirmation polling gets four polls per submit attempt.
    pub fn confirm_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.anchor_max_attempts.saturating_mul(4),
            Duration::from_millis(self.anchor_base_delay_ms),
            Duration::from_millis(self.anchor_max_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_environment_yields_defaults() {
        let config = ProvenanceConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ProvenanceConfig::default());
        assert_eq!(config.store, StoreBackend::Memory);
        assert!(config.ledger_url.is_none());
    }

    #[test]
    fn variables_override_defaults() {
        let config = ProvenanceConfig::from_lookup(lookup(&[
            ("PROVENANCE_STORE", "sqlite"),
            ("PROVENANCE_SQLITE_URL", "sqlite::memory:"),
            ("PROVENANCE_STORE_TIMEOUT_MS", "250"),
            ("PROVENANCE_LEDGER_URL", "http://localhost:8545"),
            ("PROVENANCE_ANCHOR_MAX_ATTEMPTS", "7"),
        ]))
        .unwrap();

        assert_eq!(config.store, StoreBackend::Sqlite);
        assert_eq!(config.sqlite_url, "sqlite::memory:");
        assert_eq!(config.store_timeout(), Duration::from_millis(250));
        assert_eq!(config.ledger_url.as_deref(), Some("http://localhost:8545"));
        assert_eq!(config.submit_retry().max_attempts, 7);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = ProvenanceConfig::from_lookup(lookup(&[("PROVENANCE_STORE_RETRIES", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PROVENANCE_STORE_RETRIES", .. }));

        let err = ProvenanceConfig::from_lookup(lookup(&[("PROVENANCE_STORE", "postgres")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PROVENANCE_STORE", .. }));
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        let err = ProvenanceConfig::from_lookup(lookup(&[
            ("PROVENANCE_ANCHOR_BASE_DELAY_MS", "5000"),
            ("PROVENANCE_ANCHOR_MAX_DELAY_MS", "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = ProvenanceConfig::from_lookup(lookup(&[("PROVENANCE_STORE", "sqlite"), ("PROVENANCE_SQLITE_URL", " ")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));

        let err = ProvenanceConfig::from_lookup(lookup(&[("PROVENANCE_ANCHOR_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn retry_policies_follow_the_configured_budgets() {
        let config = ProvenanceConfig {
            store_retries: 2,
            anchor_max_attempts: 3,
            anchor_base_delay_ms: 40,
            anchor_max_delay_ms: 100,
            ..ProvenanceConfig::default()
        };

        assert_eq!(config.registry_retry().max_attempts, 2);
        assert_eq!(config.registry_retry().next_delay(2), None);

        let submit = config.submit_retry();
        assert_eq!(submit.max_attempts, 3);
        assert_eq!(submit.base_delay, Duration::from_millis(40));
        assert!(submit.delay_for_attempt(10) <= Duration::from_millis(100));

        assert_eq!(config.confirm_retry().max_attempts, 12);
        assert_eq!(config.confirm_retry().max_delay, Duration::from_millis(100));
    }

    #[test]
    fn blank_ledger_url_means_simulated() {
        let config = ProvenanceConfig::from_lookup(lookup(&[("PROVENANCE_LEDGER_URL", "  ")])).unwrap();
        assert!(config.ledger_url.is_none());
    }
}
