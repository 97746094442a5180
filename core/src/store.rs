//! Aggregate store abstraction.
//!
//! This module defines the storage boundary of the core: a transactional
//! store of events, registrations, payments and users where every mutation is
//! a conditional write against a version token.
//!
//! # Design
//!
//! The traits are deliberately small. They provide exactly what the
//! allocator, payment guard and concurrency controller need:
//!
//! - Open a transaction ([`AggregateStore::begin`])
//! - Point reads by id, an event read that locks the row
//!   ([`lock_event`](StoreTransaction::lock_event)), plus three predicate reads
//!   ([`confirmed_spots`](StoreTransaction::confirmed_spots),
//!   [`payment_for_registration`](StoreTransaction::payment_for_registration),
//!   [`find_registration_by_key`](StoreTransaction::find_registration_by_key))
//! - Inserts and conditional updates/deletes
//! - Commit and rollback
//!
//! # Isolation contract
//!
//! An implementation must guarantee that a transaction which commits has not
//! been invalidated by a concurrent commit touching anything it read,
//! including predicate reads. Violations surface as
//! [`StoreError::SerializationFailure`] (or [`StoreError::Deadlock`]) at the
//! failing statement or at commit. This is what makes "read the headcount,
//! then insert" safe under contention.
//!
//! A transaction handle that is dropped without `commit` rolls back. Callers
//! rely on this for panic and cancellation safety.
//!
//! # Implementations
//!
//! - `PostgresStore` (in `turnstile-postgres`): production implementation
//! - `InMemoryStore` (in `turnstile-testing`): deterministic fake with
//!   commit-time validation and fault injection
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! transaction can travel as `Box<dyn StoreTransaction>` and the futures are
//! `Send` for use from spawned tasks.

use crate::error::StoreResult;
use crate::ids::{EventId, PaymentId, RegistrationId, UserId};
use crate::model::{Event, Payment, Registration, User};
use crate::version::Version;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// A transactional aggregate store.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one store is shared by every
/// request-handling task.
pub trait AggregateStore: Send + Sync {
    /// Open a new transaction.
    ///
    /// # Errors
    ///
    /// - `Database`: the connection could not be acquired
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTransaction>>;
}

/// An open transaction against an [`AggregateStore`].
///
/// Reads observe this transaction's own writes. Conditional writes compare
/// the stored version with `expected` and fail with
/// [`StoreError::VersionConflict`](crate::error::StoreError::VersionConflict)
/// when zero rows match; on success the stored version becomes
/// `expected + 1`.
pub trait StoreTransaction: Send {
    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Load an event.
    fn load_event(&mut self, id: EventId) -> StoreFuture<'_, Option<Event>>;

    /// Load an event and hold it against concurrent writers until this
    /// transaction ends.
    ///
    /// Every decision that compares capacity with the confirmed headcount
    /// (reserving, confirming a hold, shrinking capacity, unpublishing) takes
    /// this first, then reads [`confirmed_spots`](Self::confirmed_spots).
    /// The returned row is the latest committed one, so capacity and
    /// `published` cannot change between the check and the commit.
    fn lock_event(&mut self, id: EventId) -> StoreFuture<'_, Option<Event>>;

    /// Sum of `quantity` over the event's `Confirmed` registrations.
    ///
    /// Always a live aggregate over registrations, never a cached counter.
    /// Takes no locks.
    fn confirmed_spots(&mut self, id: EventId) -> StoreFuture<'_, u32>;

    /// Insert a new event at its current version.
    fn insert_event(&mut self, event: Event) -> StoreFuture<'_, ()>;

    /// Conditionally overwrite an event.
    fn update_event(&mut self, event: Event, expected: Version) -> StoreFuture<'_, Version>;

    // ------------------------------------------------------------------
    // Registrations
    // ------------------------------------------------------------------

    /// Load a registration.
    fn load_registration(&mut self, id: RegistrationId)
    -> StoreFuture<'_, Option<Registration>>;

    /// Find the registration created for `(event, user, key)`, if any.
    fn find_registration_by_key(
        &mut self,
        event_id: EventId,
        user_id: UserId,
        key: String,
    ) -> StoreFuture<'_, Option<Registration>>;

    /// Insert a new registration.
    ///
    /// Fails with `UniqueViolation` on
    /// [`REGISTRATION_IDEMPOTENCY_CONSTRAINT`](crate::error::REGISTRATION_IDEMPOTENCY_CONSTRAINT)
    /// when the idempotency key is already taken.
    fn insert_registration(&mut self, registration: Registration) -> StoreFuture<'_, ()>;

    /// Conditionally overwrite a registration.
    fn update_registration(
        &mut self,
        registration: Registration,
        expected: Version,
    ) -> StoreFuture<'_, Version>;

    /// Conditionally delete a registration together with its payment.
    fn delete_registration(
        &mut self,
        id: RegistrationId,
        expected: Version,
    ) -> StoreFuture<'_, ()>;

    // ------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------

    /// Load a payment.
    fn load_payment(&mut self, id: PaymentId) -> StoreFuture<'_, Option<Payment>>;

    /// The payment referencing `registration_id`, if any.
    fn payment_for_registration(
        &mut self,
        registration_id: RegistrationId,
    ) -> StoreFuture<'_, Option<Payment>>;

    /// Insert a payment.
    ///
    /// Fails with `UniqueViolation` on
    /// [`PAYMENT_REGISTRATION_CONSTRAINT`](crate::error::PAYMENT_REGISTRATION_CONSTRAINT)
    /// when the registration already has one.
    fn insert_payment(&mut self, payment: Payment) -> StoreFuture<'_, ()>;

    /// Conditionally overwrite a payment.
    fn update_payment(&mut self, payment: Payment, expected: Version) -> StoreFuture<'_, Version>;

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Load a user.
    fn load_user(&mut self, id: UserId) -> StoreFuture<'_, Option<User>>;

    /// Insert a new user.
    fn insert_user(&mut self, user: User) -> StoreFuture<'_, ()>;

    /// Conditionally overwrite a user.
    fn update_user(&mut self, user: User, expected: Version) -> StoreFuture<'_, Version>;

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Make every write of this transaction durable, or none of them.
    ///
    /// # Errors
    ///
    /// - `SerializationFailure` / `Deadlock`: a concurrent commit invalidated
    ///   this transaction; nothing was written
    /// - `UniqueViolation`: a concurrent commit took a unique key first
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;

    /// Discard every write of this transaction.
    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()>;
}
