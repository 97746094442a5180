//! Error taxonomy.
//!
//! Two layers:
//!
//! - [`StoreError`]: what a storage engine reports (version mismatch,
//!   serialization failure, deadlock, unique violation, I/O).
//! - [`RegistrationError`]: what callers of the core see, split into
//!   retryable conflicts and final business outcomes.
//!
//! # Retry classification
//!
//! | Variant | Retryable |
//! |---|---|
//! | `Conflict` | yes |
//! | `Deadlock` | yes |
//! | `CapacityExceeded` | no |
//! | `DuplicatePayment` | no |
//! | `Timeout` | no |
//! | everything else | no |

use crate::ids::{EntityRef, EventId, PaymentId, RegistrationId};
use crate::version::Version;
use thiserror::Error;

/// Unique constraint guarding "one payment per registration".
pub const PAYMENT_REGISTRATION_CONSTRAINT: &str = "payments_registration_id_key";

/// Unique constraint guarding "one registration per (event, user, idempotency key)".
pub const REGISTRATION_IDEMPOTENCY_CONSTRAINT: &str = "registrations_idempotency_key";

/// Errors reported by an [`AggregateStore`](crate::store::AggregateStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A conditional write matched zero rows: the row moved past `expected`.
    #[error("Version conflict on {entity}: expected version {expected}, found {actual:?}")]
    VersionConflict {
        /// Row that was written
        entity: EntityRef,
        /// Version the writer last read
        expected: Version,
        /// Version currently stored, when known
        actual: Option<Version>,
    },

    /// The engine could not serialize this transaction against a concurrent one.
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// The engine aborted this transaction to break a lock cycle.
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// An insert or update violated a unique constraint.
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation {
        /// Constraint name
        constraint: String,
    },

    /// Row not found.
    #[error("Not found: {0}")]
    NotFound(EntityRef),

    /// Connection, query or driver failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be decoded into the model.
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Errors surfaced by the registration core.
///
/// Every variant carries enough context (entity, attempted version) for a
/// caller to decide whether to re-fetch and re-present state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Optimistic version mismatch or storage serialization failure. Retryable.
    #[error("Conflict on {entity:?}: {detail}")]
    Conflict {
        /// Row involved, when the store could tell
        entity: Option<EntityRef>,
        /// Version the caller attempted to write from, if any
        expected: Option<Version>,
        /// Version found in storage, if known
        actual: Option<Version>,
        /// Human-readable cause
        detail: String,
    },

    /// The storage engine broke a lock cycle by aborting this transaction. Retryable.
    #[error("Deadlock: {0}")]
    Deadlock(String),

    /// No spots remain for the requested quantity. Final.
    #[error("Capacity exceeded for event {event_id}: requested {requested}, available {available}")]
    CapacityExceeded {
        /// Event
        event_id: EventId,
        /// Spots asked for
        requested: u32,
        /// Spots left
        available: u32,
    },

    /// A payment already exists for the registration. Final.
    #[error("Registration {registration_id} already has a payment")]
    DuplicatePayment {
        /// Registration
        registration_id: RegistrationId,
        /// The winning payment, when known
        existing: Option<PaymentId>,
    },

    /// The deadline or cancellation signal fired before commit. Final.
    #[error("Operation {operation} timed out or was cancelled before commit")]
    Timeout {
        /// Boundary operation name
        operation: &'static str,
    },

    /// The retry budget ran out while conflicts kept occurring.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// The final conflict
        last: Box<RegistrationError>,
    },

    /// Referenced row does not exist.
    #[error("Not found: {0}")]
    NotFound(EntityRef),

    /// Reservations against an unpublished event are refused. Final.
    #[error("Event {0} is not open for registration")]
    EventNotPublished(EventId),

    /// Quantity must be at least one. Final.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(u32),

    /// The entity's state does not allow the action. Final.
    #[error("Cannot {action} {entity} in state {from}")]
    InvalidTransition {
        /// Row
        entity: EntityRef,
        /// Current state
        from: String,
        /// Attempted action
        action: &'static str,
    },

    /// Input failed validation. Final.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Infrastructure failure. Final.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl RegistrationError {
    /// Whether re-running the whole read-compute-write sequence may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Deadlock(_))
    }

    /// A conflict, either raw or after the retry budget was spent.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Deadlock(_) => true,
            Self::RetriesExhausted { last, .. } => last.is_conflict(),
            _ => false,
        }
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "conflict",
            Self::Deadlock(_) => "deadlock",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::DuplicatePayment { .. } => "duplicate_payment",
            Self::Timeout { .. } => "timeout",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::NotFound(_) => "not_found",
            Self::EventNotPublished(_) => "event_not_published",
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Validation(_) => "validation",
            Self::Store(_) => "store",
        }
    }

    /// Conflict raised by the concurrency controller for a stale version.
    #[must_use]
    pub fn stale_version(entity: EntityRef, expected: Version, actual: Option<Version>) -> Self {
        Self::Conflict {
            entity: Some(entity),
            expected: Some(expected),
            actual,
            detail: format!("{entity} was modified since version {expected} was read"),
        }
    }
}

impl From<StoreError> for RegistrationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::VersionConflict {
                entity,
                expected,
                actual,
            } => Self::stale_version(entity, expected, actual),
            StoreError::SerializationFailure(detail) => Self::Conflict {
                entity: None,
                expected: None,
                actual: None,
                detail,
            },
            StoreError::Deadlock(detail) => Self::Deadlock(detail),
            // Losing the idempotency race means the winner's row now exists;
            // a retry reads it back.
            StoreError::UniqueViolation { constraint }
                if constraint == REGISTRATION_IDEMPOTENCY_CONSTRAINT =>
            {
                Self::Conflict {
                    entity: None,
                    expected: None,
                    actual: None,
                    detail: format!("concurrent insert hit {constraint}"),
                }
            }
            StoreError::NotFound(entity) => Self::NotFound(entity),
            other => Self::Store(other),
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, RegistrationError>;

#[cfg(test)]
#[allow(clippy::panic)] // Test code can panic on unexpected variants
mod tests {
    use super::*;
    use crate::ids::EventId;

    #[test]
    fn version_conflict_maps_to_retryable_conflict() {
        let entity = EntityRef::event(EventId::new());
        let error: RegistrationError = StoreError::VersionConflict {
            entity,
            expected: Version::new(3),
            actual: Some(Version::new(4)),
        }
        .into();

        assert!(error.is_retryable());
        match error {
            RegistrationError::Conflict {
                entity: Some(e),
                expected,
                actual,
                ..
            } => {
                assert_eq!(e, entity);
                assert_eq!(expected, Some(Version::new(3)));
                assert_eq!(actual, Some(Version::new(4)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn deadlock_and_serialization_failures_are_retryable() {
        let deadlock: RegistrationError = StoreError::Deadlock("40P01".into()).into();
        let serialization: RegistrationError =
            StoreError::SerializationFailure("40001".into()).into();
        assert!(deadlock.is_retryable());
        assert!(serialization.is_retryable());
        assert_eq!(deadlock.kind(), "deadlock");
    }

    #[test]
    fn idempotency_violation_is_a_conflict() {
        let error: RegistrationError = StoreError::UniqueViolation {
            constraint: REGISTRATION_IDEMPOTENCY_CONSTRAINT.to_string(),
        }
        .into();
        assert!(error.is_retryable());
    }

    #[test]
    fn other_unique_violations_are_final() {
        let error: RegistrationError = StoreError::UniqueViolation {
            constraint: "users_email_key".to_string(),
        }
        .into();
        assert!(!error.is_retryable());
        assert!(matches!(error, RegistrationError::Store(_)));
    }

    #[test]
    fn business_outcomes_are_final() {
        let capacity = RegistrationError::CapacityExceeded {
            event_id: EventId::new(),
            requested: 1,
            available: 0,
        };
        let duplicate = RegistrationError::DuplicatePayment {
            registration_id: RegistrationId::new(),
            existing: None,
        };
        assert!(!capacity.is_retryable());
        assert!(!duplicate.is_retryable());
        assert!(!RegistrationError::Timeout { operation: "x" }.is_retryable());
    }

    #[test]
    fn exhausted_conflict_is_still_a_conflict() {
        let exhausted = RegistrationError::RetriesExhausted {
            attempts: 5,
            last: Box::new(RegistrationError::Deadlock("cycle".into())),
        };
        assert!(!exhausted.is_retryable());
        assert!(exhausted.is_conflict());
        assert!(exhausted.to_string().contains("after 5 attempts"));
    }

    #[test]
    fn store_results_convert_with_question_mark() {
        fn headcount(spots: StoreResult<u32>) -> Result<u32> {
            Ok(spots? + 1)
        }

        assert_eq!(headcount(Ok(2)), Ok(3));
        assert!(matches!(
            headcount(Err(StoreError::Database("connection reset".into()))),
            Err(RegistrationError::Store(StoreError::Database(_)))
        ));
    }
}
