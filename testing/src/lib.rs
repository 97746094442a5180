//! # Turnstile Testing
//!
//! Testing utilities for the Turnstile registration core.
//!
//! This crate provides:
//! - [`InMemoryStore`]: an [`AggregateStore`](turnstile_core::AggregateStore)
//!   with commit-time conflict detection and fault injection
//! - [`FixedClock`]: deterministic time
//! - [`fixtures`]: ready-made events, users, registrations and payment details
//!
//! ## Example
//!
//! ```
//! use turnstile_testing::{InMemoryStore, fixtures};
//!
//! let store = InMemoryStore::new();
//! let event = store.seed_event(fixtures::published_event(3));
//! store.seed_registration(fixtures::confirmed_registration(event.id, 2));
//! assert_eq!(store.confirmed_spots(event.id), 2);
//! ```

pub mod fixtures;
pub mod store;

/// Mock implementations of Environment traits
pub mod mocks {
    use chrono::{DateTime, Utc};
    use turnstile_core::environment::Clock;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use turnstile_testing::mocks::FixedClock;
    /// use turnstile_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Tracing setup for tests.
pub mod tracing_support {
    /// Install a test-writer subscriber honoring `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
pub use store::InMemoryStore;
pub use tracing_support::init_test_tracing;
