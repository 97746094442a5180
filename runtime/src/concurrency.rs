//! Optimistic concurrency control.
//!
//! The [`ConcurrencyController`] turns "read, mutate, write back" into a
//! conditional write: the write only applies if the stored version still
//! equals the version the caller read. No locks are held in between.
//!
//! ```text
//! load(id) ──► version == expected? ──no──► Conflict { expected, actual }
//!                     │
//!                    yes
//!                     ▼
//!              mutate(&mut entity) ──Err──► domain error (nothing written)
//!                     │
//!                     ▼
//!        UPDATE … WHERE id = ? AND version = expected
//!                     │
//!          0 rows ◄───┴───► 1 row: version = expected + 1
//!            │
//!            ▼
//!        Conflict
//! ```

use crate::transaction::UnitOfWork;
use turnstile_core::{
    EntityRef, Event, EventId, Payment, PaymentId, Registration, RegistrationError,
    RegistrationId, StoreFuture, StoreTransaction, User, UserId, Version,
};

/// An aggregate that can be loaded and conditionally written.
pub trait Versioned: Clone + Send + Sized + 'static {
    /// Identifier type.
    type Id: Copy + Send + Sync + std::fmt::Display + 'static;

    /// Reference used in errors and logs.
    fn entity_ref(id: Self::Id) -> EntityRef;

    /// Current version token.
    fn version(&self) -> Version;

    /// Replace the version token after a successful write.
    fn set_version(&mut self, version: Version);

    /// Load from the store.
    fn load(tx: &mut dyn StoreTransaction, id: Self::Id) -> StoreFuture<'_, Option<Self>>;

    /// Conditionally write to the store.
    fn write(
        tx: &mut dyn StoreTransaction,
        entity: Self,
        expected: Version,
    ) -> StoreFuture<'_, Version>;
}

macro_rules! versioned {
    ($ty:ty, $id:ty, $entity_ref:path, $load:ident, $write:ident) => {
        impl Versioned for $ty {
            type Id = $id;

            fn entity_ref(id: Self::Id) -> EntityRef {
                $entity_ref(id)
            }

            fn version(&self) -> Version {
                self.version
            }

            fn set_version(&mut self, version: Version) {
                self.version = version;
            }

            fn load(tx: &mut dyn StoreTransaction, id: Self::Id) -> StoreFuture<'_, Option<Self>> {
                tx.$load(id)
            }

            fn write(
                tx: &mut dyn StoreTransaction,
                entity: Self,
                expected: Version,
            ) -> StoreFuture<'_, Version> {
                tx.$write(entity, expected)
            }
        }
    };
}

versioned!(Event, EventId, EntityRef::event, load_event, update_event);
versioned!(
    Registration,
    RegistrationId,
    EntityRef::registration,
    load_registration,
    update_registration
);
versioned!(Payment, PaymentId, EntityRef::payment, load_payment, update_payment);
versioned!(User, UserId, EntityRef::user, load_user, update_user);

/// Conditional writes against version tokens.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConcurrencyController;

impl ConcurrencyController {
    /// Create a controller.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Load `id`, check `expected`, apply `mutate`, write back conditionally.
    ///
    /// Returns the entity as stored, carrying `expected + 1`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the entity does not exist
    /// - `Conflict` if the stored version is not `expected` (checked before
    ///   and by the write)
    /// - Whatever `mutate` returns; nothing is written in that case
    pub async fn update<A, M>(
        &self,
        uow: &mut UnitOfWork,
        id: A::Id,
        expected: Version,
        mutate: M,
    ) -> Result<A, RegistrationError>
    where
        A: Versioned,
        M: FnOnce(&mut A) -> Result<(), RegistrationError> + Send,
    {
        let entity_ref = A::entity_ref(id);
        let mut entity = A::load(uow.store(), id)
            .await?
            .ok_or(RegistrationError::NotFound(entity_ref))?;

        if entity.version() != expected {
            tracing::debug!(
                entity = %entity_ref,
                expected = %expected,
                actual = %entity.version(),
                "Stale version"
            );
            return Err(RegistrationError::stale_version(
                entity_ref,
                expected,
                Some(entity.version()),
            ));
        }

        mutate(&mut entity)?;
        let version = A::write(uow.store(), entity.clone(), expected).await?;
        entity.set_version(version);

        tracing::debug!(entity = %entity_ref, version = %version, "Conditional write applied");
        Ok(entity)
    }

    /// Conditionally update an event.
    ///
    /// # Errors
    ///
    /// See [`ConcurrencyController::update`].
    pub async fn update_event<M>(
        &self,
        uow: &mut UnitOfWork,
        id: EventId,
        expected: Version,
        mutate: M,
    ) -> Result<Event, RegistrationError>
    where
        M: FnOnce(&mut Event) -> Result<(), RegistrationError> + Send,
    {
        self.update(uow, id, expected, mutate).await
    }

    /// Conditionally update a registration.
    ///
    /// # Errors
    ///
    /// See [`ConcurrencyController::update`].
    pub async fn update_registration<M>(
        &self,
        uow: &mut UnitOfWork,
        id: RegistrationId,
        expected: Version,
        mutate: M,
    ) -> Result<Registration, RegistrationError>
    where
        M: FnOnce(&mut Registration) -> Result<(), RegistrationError> + Send,
    {
        self.update(uow, id, expected, mutate).await
    }

    /// Conditionally update a payment.
    ///
    /// # Errors
    ///
    /// See [`ConcurrencyController::update`].
    pub async fn update_payment<M>(
        &self,
        uow: &mut UnitOfWork,
        id: PaymentId,
        expected: Version,
        mutate: M,
    ) -> Result<Payment, RegistrationError>
    where
        M: FnOnce(&mut Payment) -> Result<(), RegistrationError> + Send,
    {
        self.update(uow, id, expected, mutate).await
    }

    /// Conditionally update a user.
    ///
    /// # Errors
    ///
    /// See [`ConcurrencyController::update`].
    pub async fn update_user<M>(
        &self,
        uow: &mut UnitOfWork,
        id: UserId,
        expected: Version,
        mutate: M,
    ) -> Result<User, RegistrationError>
    where
        M: FnOnce(&mut User) -> Result<(), RegistrationError> + Send,
    {
        self.update(uow, id, expected, mutate).await
    }
}
