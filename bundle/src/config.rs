//! Configuration management for the ticket service.
//!
//! Loads configuration from environment variables with sensible defaults. Only
//! `DATABASE_URL` is required.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use ticketflow_core::bus::BusConfig;
use ticketflow_runtime::{RelayConfig, RetryPolicy, RouterConfig};

/// Errors raised while loading [`Config`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is set but cannot be used
    #[error("Invalid value {value:?} for {name}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Raw value
        value: String,
        /// Why it was refused
        reason: String,
    },
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `PostgreSQL` configuration
    pub database: DatabaseConfig,
    /// Handler retry configuration
    pub retry: RetryConfig,
    /// Outbox relay configuration
    pub outbox: OutboxConfig,
    /// Router configuration
    pub router: RouterSettings,
    /// Name used for internal topics and consumer groups
    pub service_name: String,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Bounded exponential backoff wrapped around every handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries before a message is poisoned
    pub max_retries: usize,
    /// First delay in milliseconds
    pub initial_interval_ms: u64,
    /// Delay cap in milliseconds
    pub max_interval_ms: u64,
    /// Growth factor between delays
    pub multiplier: f64,
}

/// Outbox relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Sleep between polls of an empty outbox, in milliseconds
    pub poll_interval_ms: u64,
    /// Records fetched per poll
    pub batch_size: usize,
    /// Cap of the publish backoff, in milliseconds
    pub max_backoff_ms: u64,
    /// Cursor name in `outbox_offsets`
    pub relay_name: String,
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Concurrent messages per route
    pub max_in_flight: usize,
    /// Drain timeout on shutdown, in seconds
    pub shutdown_timeout_secs: u64,
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

fn positive<T: PartialOrd + Default + ToString>(name: &'static str, value: T) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        })
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Call [`dotenvy::dotenv`] first to pick up a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] without `DATABASE_URL` and [`ConfigError::Invalid`] for
    /// values that do not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let multiplier = parse(&lookup, "RETRY_MULTIPLIER", 2.0_f64)?;
        if multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                name: "RETRY_MULTIPLIER",
                value: multiplier.to_string(),
                reason: "must be at least 1.0".to_string(),
            });
        }

        Ok(Self {
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                max_connections: positive(
                    "DATABASE_MAX_CONNECTIONS",
                    parse(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
                )?,
            },
            retry: RetryConfig {
                max_retries: parse(&lookup, "RETRY_MAX_RETRIES", 10)?,
                initial_interval_ms: parse(&lookup, "RETRY_INITIAL_INTERVAL_MS", 100)?,
                max_interval_ms: parse(&lookup, "RETRY_MAX_INTERVAL_MS", 1000)?,
                multiplier,
            },
            outbox: OutboxConfig {
                poll_interval_ms: parse(&lookup, "OUTBOX_POLL_INTERVAL_MS", 100)?,
                batch_size: positive("OUTBOX_BATCH_SIZE", parse(&lookup, "OUTBOX_BATCH_SIZE", 100)?)?,
                max_backoff_ms: parse(&lookup, "OUTBOX_MAX_BACKOFF_MS", 30_000)?,
                relay_name: lookup("OUTBOX_RELAY_NAME")
                    .unwrap_or_else(|| "svc-tickets-outbox".to_string()),
            },
            router: RouterSettings {
                max_in_flight: positive(
                    "ROUTER_MAX_IN_FLIGHT",
                    parse(&lookup, "ROUTER_MAX_IN_FLIGHT", 32)?,
                )?,
                shutdown_timeout_secs: parse(&lookup, "ROUTER_SHUTDOWN_TIMEOUT_SECS", 10)?,
            },
            service_name: lookup("SERVICE_NAME").unwrap_or_else(|| "svc-tickets".to_string()),
        })
    }

    /// Topic naming for this service.
    #[must_use]
    pub fn bus_config(&self) -> BusConfig {
        BusConfig::new(&self.service_name)
    }

    /// Backoff wrapped around every handler.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.retry.max_retries)
            .initial_delay(Duration::from_millis(self.retry.initial_interval_ms))
            .max_delay(Duration::from_millis(self.retry.max_interval_ms))
            .multiplier(self.retry.multiplier)
            .build()
    }

    /// Router tuning.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            retry: self.retry_policy(),
            max_in_flight: self.router.max_in_flight,
            shutdown_timeout: Duration::from_secs(self.router.shutdown_timeout_secs),
        }
    }

    /// Relay tuning.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            relay_name: self.outbox.relay_name.clone(),
            poll_interval: Duration::from_millis(self.outbox.poll_interval_ms),
            batch_size: self.outbox.batch_size,
            backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(self.retry.initial_interval_ms))
                .max_delay(Duration::from_millis(self.outbox.max_backoff_ms))
                .multiplier(self.retry.multiplier)
                .build(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://db/tickets")])).unwrap();

        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.service_name, "svc-tickets");
        assert_eq!(config.outbox.relay_name, "svc-tickets-outbox");

        let retry = config.retry_policy();
        assert_eq!(retry.max_retries, 10);
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(1));

        let relay = config.relay_config();
        assert_eq!(relay.batch_size, 100);
        assert_eq!(relay.backoff.max_delay, Duration::from_secs(30));

        let router = config.router_config();
        assert_eq!(router.max_in_flight, 32);
        assert_eq!(router.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/tickets"),
            ("RETRY_MAX_RETRIES", "3"),
            ("ROUTER_MAX_IN_FLIGHT", " 4 "),
            ("SERVICE_NAME", "svc-vip"),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.router.max_in_flight, 4);
        assert_eq!(
            config.bus_config().consumer_group("vip_bundle.on_booking_made"),
            "svc-vip.vip_bundle.on_booking_made"
        );
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(
            Config::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }

    #[test]
    fn unparsable_and_zero_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/tickets"),
            ("OUTBOX_BATCH_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "OUTBOX_BATCH_SIZE", .. }));

        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/tickets"),
            ("ROUTER_MAX_IN_FLIGHT", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ROUTER_MAX_IN_FLIGHT", .. }));

        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/tickets"),
            ("RETRY_MULTIPLIER", "0.5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "RETRY_MULTIPLIER", .. }));
    }
}
