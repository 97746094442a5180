//! Configuration for the registration core.
//!
//! Loads configuration from environment variables with sensible defaults.
//!
//! | Variable | Default |
//! |---|---|
//! | `TURNSTILE_RETRY_MAX_ATTEMPTS` | 5 |
//! | `TURNSTILE_RETRY_BASE_DELAY_MS` | 10 |
//! | `TURNSTILE_RETRY_MAX_DELAY_MS` | 1000 |
//! | `TURNSTILE_OPERATION_TIMEOUT_MS` | 5000 |

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Core configuration loaded from environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Retry orchestration
    pub retry: RetryConfig,
    /// Per-operation deadlines
    pub operation: OperationConfig,
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first
    pub max_attempts: u32,
    /// Backoff unit in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Build the [`RetryPolicy`] this configuration describes.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .build()
    }
}

/// Operation deadline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Default deadline for a boundary operation in milliseconds
    pub timeout_ms: u64,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl OperationConfig {
    /// Default deadline as a `Duration`.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl TurnstileConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            retry: RetryConfig {
                max_attempts: parse_or(
                    &lookup,
                    "TURNSTILE_RETRY_MAX_ATTEMPTS",
                    defaults.retry.max_attempts,
                ),
                base_delay_ms: parse_or(
                    &lookup,
                    "TURNSTILE_RETRY_BASE_DELAY_MS",
                    defaults.retry.base_delay_ms,
                ),
                max_delay_ms: parse_or(
                    &lookup,
                    "TURNSTILE_RETRY_MAX_DELAY_MS",
                    defaults.retry.max_delay_ms,
                ),
            },
            operation: OperationConfig {
                timeout_ms: parse_or(
                    &lookup,
                    "TURNSTILE_OPERATION_TIMEOUT_MS",
                    defaults.operation.timeout_ms,
                ),
            },
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_unset() {
        let config = TurnstileConfig::from_source(|_| None);
        assert_eq!(config, TurnstileConfig::default());
        assert_eq!(config.operation.timeout(), Duration::from_secs(5));
        assert_eq!(config.retry.policy(), RetryPolicy::default());
    }

    #[test]
    fn variables_override_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TURNSTILE_RETRY_MAX_ATTEMPTS", "8"),
            ("TURNSTILE_RETRY_BASE_DELAY_MS", "25"),
            ("TURNSTILE_OPERATION_TIMEOUT_MS", " 750 "),
            ("TURNSTILE_RETRY_MAX_DELAY_MS", "not-a-number"),
        ]);
        let config = TurnstileConfig::from_source(|key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.retry.base_delay_ms, 25);
        assert_eq!(config.retry.max_delay_ms, 1_000);
        assert_eq!(config.operation.timeout(), Duration::from_millis(750));

        let policy = config.retry.policy();
        assert_eq!(policy.max_attempts, 8);
        assert_eq!(policy.base_delay, Duration::from_millis(25));
    }
}
