//! # Turnstile Core
//!
//! Data model, version tokens, error taxonomy and storage traits for a
//! capacity-constrained registration and payment system.
//!
//! This crate holds no I/O. It defines:
//!
//! - **Aggregates**: [`Event`], [`Registration`], [`Payment`], [`User`], each
//!   carrying a [`Version`] token
//! - **Lifecycle rules**: the status machines and validation each aggregate
//!   enforces on itself
//! - **Errors**: [`RegistrationError`], split into retryable conflicts and
//!   final business outcomes
//! - **Storage boundary**: [`AggregateStore`] and [`StoreTransaction`]
//!
//! The orchestration (transactions, retries, capacity allocation, payment
//! guarding) lives in `turnstile-runtime`.
//!
//! ## Invariants
//!
//! - The confirmed headcount of an event is always computed from
//!   registrations, never cached on the event
//! - Every successful conditional write bumps the row's version by exactly one
//! - A registration has at most one payment
//!
//! ## Example
//!
//! ```
//! use turnstile_core::{Availability, Event};
//! use chrono::Utc;
//!
//! let event = Event::new("Rope Basics", "Intro class", "Studio A", 10, Utc::now())?;
//! let availability: Availability = event.availability(7);
//! assert_eq!(availability.available, 3);
//! assert!(!availability.can_fit(4));
//! # Ok::<(), turnstile_core::RegistrationError>(())
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod error;
pub mod ids;
pub mod model;
pub mod store;
pub mod version;

pub use error::{
    PAYMENT_REGISTRATION_CONSTRAINT, REGISTRATION_IDEMPOTENCY_CONSTRAINT, RegistrationError,
    StoreError, StoreResult,
};
pub use ids::{EntityKind, EntityRef, EventId, PaymentId, RegistrationId, UserId};
pub use model::{
    Availability, Currency, DEFAULT_CANCELLATION_REASON, Event, EventPatch, Payment,
    PaymentDetails, PaymentStatus, Registration, RegistrationStatus, User, UserPatch,
};
pub use store::{AggregateStore, StoreFuture, StoreTransaction};
pub use version::Version;

/// Environment module - Dependency injection traits
///
/// External dependencies of the core are abstracted behind traits so tests
/// can substitute deterministic implementations.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use turnstile_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time from the operating system.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
