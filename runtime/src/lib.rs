//! # Turnstile Runtime
//!
//! Orchestration for the Turnstile registration core.
//!
//! This crate turns the storage traits of `turnstile-core` into safe
//! operations under concurrent demand. No in-process locks are taken between
//! requests; isolation comes from the store's transactions.
//!
//! ## Core Components
//!
//! - **Transaction Manager**: runs a closure in one store transaction; all
//!   writes commit or none do
//! - **Concurrency Controller**: conditional writes guarded by version tokens
//! - **Capacity Allocator**: reserves spots without ever overbooking
//! - **Payment Guard**: at most one payment per registration
//! - **Retry Orchestrator**: re-runs conflicting work with jittered backoff
//! - **Registration Service**: the boundary operations, each under a
//!   deadline and an optional cancellation token
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use turnstile_runtime::{OperationContext, RegistrationService, TurnstileConfig};
//!
//! let service = RegistrationService::new(Arc::new(store), &TurnstileConfig::from_env());
//! let ctx = OperationContext::new();
//!
//! let registration = service
//!     .create_registration(event_id, user_id, 1, Some("checkout-1".into()), &ctx)
//!     .await?;
//! let availability = service.get_event_availability(event_id, &ctx).await?;
//! ```

/// Capacity allocation
pub mod allocator;

/// Conditional writes against version tokens
pub mod concurrency;

/// Environment-driven configuration
pub mod config;

/// Prometheus metrics for observability
pub mod metrics;

/// One-payment-per-registration guard
pub mod payments;

/// Retry logic with jittered exponential backoff
pub mod retry;

/// The boundary operations
pub mod service;

/// Atomic units of work, deadlines and cancellation
pub mod transaction;

// Re-export commonly used types
pub use allocator::{CapacityAllocator, Reservation, ReserveRequest};
pub use concurrency::{ConcurrencyController, Versioned};
pub use config::{OperationConfig, RetryConfig, TurnstileConfig};
pub use payments::{PaymentCompletion, PaymentGuard};
pub use retry::{RetryPolicy, RetryPolicyBuilder, with_retry};
pub use service::RegistrationService;
pub use transaction::{OperationContext, TransactionManager, UnitOfWork, run_with_deadline};
