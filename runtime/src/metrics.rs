//! Prometheus metrics for the registration core.
//!
//! This module describes and records:
//! - Registration outcomes (confirmed, held, capacity exceeded, idempotent replay)
//! - Payment outcomes (attached, duplicate, completed, failed, refunded)
//! - Conflicts and deadlocks observed, retries and exhausted retry budgets
//! - Transaction outcomes and durations
//! - Deadline and cancellation timeouts
//!
//! # Example
//!
//! ```rust,no_run
//! use turnstile_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = MetricsRecorder::new();
//! recorder.install()?;
//!
//! // Serve this from the process's own `/metrics` route.
//! if let Some(text) = recorder.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder with a render handle.
///
/// Nothing is served over the network; the owner of the process exposes
/// [`MetricsRecorder::render`] on whatever HTTP surface it runs.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl MetricsRecorder {
    /// Create a recorder that is not installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the call
    /// succeeds without a render handle.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            // Transactions are short; buckets favor the millisecond range
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus recorder installed, render() returns the scrape text");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this recorder did not install itself.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "turnstile_registrations_total",
        "Registration attempts by outcome (confirmed, held, capacity_exceeded, replayed)"
    );
    describe_counter!(
        "turnstile_payments_total",
        "Payment operations by outcome (attached, duplicate, completed, failed, refunded)"
    );
    describe_counter!(
        "turnstile_conflicts_total",
        "Version conflicts, serialization failures and deadlocks observed"
    );
    describe_counter!(
        "turnstile_retries_total",
        "Operations re-run after a retryable conflict"
    );
    describe_counter!(
        "turnstile_retries_exhausted_total",
        "Operations that ran out of retry budget"
    );
    describe_counter!(
        "turnstile_transactions_total",
        "Transactions by outcome (committed, rolled_back)"
    );
    describe_histogram!(
        "turnstile_transaction_duration_seconds",
        "Time from begin to commit or rollback"
    );
    describe_counter!(
        "turnstile_timeouts_total",
        "Operations abandoned because the deadline passed or the caller cancelled"
    );
}

/// Registration metrics recorder.
pub struct RegistrationMetrics;

impl RegistrationMetrics {
    /// Record a registration outcome.
    pub fn record(outcome: &'static str) {
        counter!("turnstile_registrations_total", "outcome" => outcome).increment(1);
    }
}

/// Payment metrics recorder.
pub struct PaymentMetrics;

impl PaymentMetrics {
    /// Record a payment outcome.
    pub fn record(outcome: &'static str) {
        counter!("turnstile_payments_total", "outcome" => outcome).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retryable conflict (`kind` is `conflict` or `deadlock`).
    pub fn record_conflict(operation: &'static str, kind: &'static str) {
        counter!("turnstile_conflicts_total", "operation" => operation, "kind" => kind)
            .increment(1);
    }

    /// Record a retry about to run.
    pub fn record_retry(operation: &'static str, kind: &'static str) {
        counter!("turnstile_retries_total", "operation" => operation, "kind" => kind)
            .increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted(operation: &'static str) {
        counter!("turnstile_retries_exhausted_total", "operation" => operation).increment(1);
    }
}

/// Transaction metrics recorder.
pub struct TransactionMetrics;

impl TransactionMetrics {
    /// Record a committed transaction.
    pub fn record_commit(operation: &'static str, duration: Duration) {
        counter!("turnstile_transactions_total", "outcome" => "committed").increment(1);
        histogram!("turnstile_transaction_duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
    }

    /// Record a rolled back transaction.
    pub fn record_rollback(operation: &'static str, duration: Duration) {
        counter!("turnstile_transactions_total", "outcome" => "rolled_back").increment(1);
        histogram!("turnstile_transaction_duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
    }

    /// Record an operation abandoned by deadline or cancellation.
    pub fn record_timeout(operation: &'static str) {
        counter!("turnstile_timeouts_total", "operation" => operation).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn test_recorder_renders_nothing_before_install() {
        let recorder = MetricsRecorder::new();
        assert!(recorder.handle().is_none());
        assert!(recorder.render().is_none());
    }

    #[test]
    fn test_recorder_render() {
        let mut recorder = MetricsRecorder::new();
        recorder.install().unwrap();

        RegistrationMetrics::record("confirmed");
        PaymentMetrics::record("duplicate");
        RetryMetrics::record_conflict("create_registration", "deadlock");
        TransactionMetrics::record_commit("create_registration", Duration::from_millis(3));

        // The handle is None when another test installed the recorder first;
        // recording still goes to the global recorder.
        if let Some(rendered) = recorder.render() {
            assert!(rendered.contains("turnstile_registrations_total"));
            assert!(rendered.contains("turnstile_payments_total"));
            assert!(rendered.contains("turnstile_conflicts_total"));
            assert!(rendered.contains("turnstile_transaction_duration_seconds"));
        }
    }
}
