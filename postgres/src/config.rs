//! Connection and transaction settings.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | required |
//! | `TURNSTILE_PG_MAX_CONNECTIONS` | 10 |
//! | `TURNSTILE_PG_MIN_CONNECTIONS` | 1 |
//! | `TURNSTILE_PG_ACQUIRE_TIMEOUT_MS` | 5000 |
//! | `TURNSTILE_PG_IDLE_TIMEOUT_SECS` | 600 |
//! | `TURNSTILE_PG_STATEMENT_TIMEOUT_MS` | 30000 (0 disables) |
//! | `TURNSTILE_PG_ISOLATION` | `serializable` |

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors loading [`PostgresConfig`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    /// A variable is set but cannot be parsed
    #[error("Invalid value for {key}: {value}")]
    Invalid {
        /// Variable name
        key: &'static str,
        /// Raw value
        value: String,
    },
}

/// Transaction isolation level applied to every transaction the store opens.
///
/// Under `Serializable` the engine aborts one of two transactions that both
/// counted the same free spot. Under `ReadCommitted` the event row lock taken
/// while counting confirmed spots makes the second counter wait and then see
/// the first one's registration. `REPEATABLE READ` is not offered: its
/// snapshot predates that lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// `SERIALIZABLE`
    #[default]
    Serializable,
    /// `READ COMMITTED`
    ReadCommitted,
}

impl IsolationLevel {
    /// The statement that selects this level inside an open transaction.
    #[must_use]
    pub const fn set_transaction_sql(&self) -> &'static str {
        match self {
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "serializable" => Ok(Self::Serializable),
            "read_committed" => Ok(Self::ReadCommitted),
            _ => Err(ConfigError::Invalid {
                key: "TURNSTILE_PG_ISOLATION",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Serializable => "serializable",
            Self::ReadCommitted => "read_committed",
        })
    }
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// `PostgreSQL` connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections in the pool
    pub min_connections: u32,
    /// How long to wait for a pooled connection, in milliseconds
    pub acquire_timeout_ms: u64,
    /// Idle timeout in seconds (connections idle longer than this are closed)
    pub idle_timeout_secs: u64,
    /// Per-statement timeout in milliseconds; 0 disables it
    pub statement_timeout_ms: u64,
    /// Isolation level of every transaction
    pub isolation: IsolationLevel,
}

impl PostgresConfig {
    /// Configuration with defaults for everything but the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_ms: 5_000,
            idle_timeout_secs: 600,
            statement_timeout_ms: 30_000,
            isolation: IsolationLevel::Serializable,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`] if `DATABASE_URL` is unset
    /// - [`ConfigError::Invalid`] for an unknown isolation level
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`PostgresConfig::from_env`].
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let defaults = Self::new(url);
        let isolation = match lookup("TURNSTILE_PG_ISOLATION") {
            Some(raw) => raw.parse()?,
            None => defaults.isolation,
        };

        Ok(Self {
            max_connections: parse_or(
                &lookup,
                "TURNSTILE_PG_MAX_CONNECTIONS",
                defaults.max_connections,
            ),
            min_connections: parse_or(
                &lookup,
                "TURNSTILE_PG_MIN_CONNECTIONS",
                defaults.min_connections,
            ),
            acquire_timeout_ms: parse_or(
                &lookup,
                "TURNSTILE_PG_ACQUIRE_TIMEOUT_MS",
                defaults.acquire_timeout_ms,
            ),
            idle_timeout_secs: parse_or(
                &lookup,
                "TURNSTILE_PG_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout_secs,
            ),
            statement_timeout_ms: parse_or(
                &lookup,
                "TURNSTILE_PG_STATEMENT_TIMEOUT_MS",
                defaults.statement_timeout_ms,
            ),
            isolation,
            ..defaults
        })
    }

    /// Pool acquire timeout.
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Pool idle timeout.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn url_is_required() {
        assert_eq!(
            PostgresConfig::from_source(|_| None),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn reads_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://localhost/turnstile"),
            ("TURNSTILE_PG_MAX_CONNECTIONS", "32"),
            ("TURNSTILE_PG_ISOLATION", "Read Committed"),
        ]);
        let config =
            PostgresConfig::from_source(|key| vars.get(key).map(ToString::to_string)).unwrap();

        assert_eq!(config.url, "postgres://localhost/turnstile");
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.isolation, IsolationLevel::ReadCommitted);
        assert_eq!(config.acquire_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_unknown_isolation() {
        let err = PostgresConfig::from_source(|key| match key {
            "DATABASE_URL" => Some("postgres://db".to_string()),
            "TURNSTILE_PG_ISOLATION" => Some("repeatable read".to_string()),
            _ => None,
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
