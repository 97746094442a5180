//! Capacity allocation.
//!
//! The [`CapacityAllocator`] decides whether a claim for `quantity` spots
//! fits into an event and records the claim, all inside the caller's
//! transaction:
//!
//! 1. If an idempotency key is given and a registration already exists for
//!    `(event, user, key)`, return it without allocating
//! 2. Lock the event row, then read it and its live confirmed headcount
//! 3. `available = capacity - confirmed`
//! 4. Refuse with `CapacityExceeded` if the claim does not fit, otherwise
//!    insert the registration
//!
//! The lock comes before both reads so that capacity, `published` and the
//! headcount all describe the same committed state. Two concurrent claims
//! for the last spot either queue on the lock, and the second reads
//! `available = 0`, or the store aborts one with a retryable conflict that
//! reads `available = 0` on retry.

use crate::concurrency::ConcurrencyController;
use crate::transaction::UnitOfWork;
use turnstile_core::{
    Availability, EntityRef, Event, EventId, Registration, RegistrationError, RegistrationId,
    RegistrationStatus, UserId,
};

/// A claim on spots of an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReserveRequest {
    /// Event to claim spots on
    pub event_id: EventId,
    /// User claiming them
    pub user_id: UserId,
    /// Spots requested (at least one)
    pub quantity: u32,
    /// Deduplication token for retried requests
    pub idempotency_key: Option<String>,
    /// Create a `Pending` hold that a completed payment confirms later
    pub hold: bool,
}

impl ReserveRequest {
    /// A request for confirmed spots.
    #[must_use]
    pub const fn new(event_id: EventId, user_id: UserId, quantity: u32) -> Self {
        Self {
            event_id,
            user_id,
            quantity,
            idempotency_key: None,
            hold: false,
        }
    }

    /// Set the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Ask for a pending hold instead of confirmed spots.
    #[must_use]
    pub const fn as_hold(mut self) -> Self {
        self.hold = true;
        self
    }
}

/// Result of a successful reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    /// The registration holding the spots
    pub registration_id: RegistrationId,
    /// Its status
    pub status: RegistrationStatus,
    /// Whether an earlier registration was returned for a repeated key
    pub replayed: bool,
}

/// Computes availability and reserves spots.
#[derive(Clone, Copy, Debug, Default)]
pub struct CapacityAllocator {
    controller: ConcurrencyController,
}

impl CapacityAllocator {
    /// Create an allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            controller: ConcurrencyController::new(),
        }
    }

    /// Live availability of an event, read without locking it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the event does not exist.
    pub async fn availability(
        &self,
        uow: &mut UnitOfWork,
        event_id: EventId,
    ) -> Result<Availability, RegistrationError> {
        let event = uow
            .store()
            .load_event(event_id)
            .await?
            .ok_or(RegistrationError::NotFound(EntityRef::event(event_id)))?;
        let confirmed = uow.store().confirmed_spots(event_id).await?;
        Ok(event.availability(confirmed))
    }

    /// Lock an event and read it together with its availability.
    ///
    /// # Errors
    ///
    /// `NotFound` if the event does not exist.
    pub async fn lock_availability(
        &self,
        uow: &mut UnitOfWork,
        event_id: EventId,
    ) -> Result<(Event, Availability), RegistrationError> {
        let event = uow
            .store()
            .lock_event(event_id)
            .await?
            .ok_or(RegistrationError::NotFound(EntityRef::event(event_id)))?;
        let confirmed = uow.store().confirmed_spots(event_id).await?;
        let availability = event.availability(confirmed);
        Ok((event, availability))
    }

    /// Reserve spots for `request`.
    ///
    /// # Errors
    ///
    /// - `InvalidQuantity` for a zero quantity
    /// - `NotFound` for an unknown event or user
    /// - `EventNotPublished` if the event is closed for registration
    /// - `CapacityExceeded` if the claim does not fit
    /// - `Conflict` / `Deadlock` from the store (retryable)
    #[tracing::instrument(
        skip(self, uow, request),
        fields(event_id = %request.event_id, user_id = %request.user_id, quantity = request.quantity)
    )]
    pub async fn reserve(
        &self,
        uow: &mut UnitOfWork,
        request: &ReserveRequest,
    ) -> Result<Reservation, RegistrationError> {
        if request.quantity == 0 {
            return Err(RegistrationError::InvalidQuantity(request.quantity));
        }

        if let Some(key) = &request.idempotency_key {
            let existing = uow
                .store()
                .find_registration_by_key(request.event_id, request.user_id, key.clone())
                .await?;
            if let Some(existing) = existing {
                tracing::info!(
                    registration_id = %existing.id,
                    "Idempotency key seen before, returning existing registration"
                );
                return Ok(Reservation {
                    registration_id: existing.id,
                    status: existing.status,
                    replayed: true,
                });
            }
        }

        let (event, availability) = self.lock_availability(uow, request.event_id).await?;
        if !event.published {
            return Err(RegistrationError::EventNotPublished(event.id));
        }
        if uow.store().load_user(request.user_id).await?.is_none() {
            return Err(RegistrationError::NotFound(EntityRef::user(request.user_id)));
        }

        if !availability.can_fit(request.quantity) {
            tracing::info!(
                capacity = availability.capacity,
                confirmed = availability.confirmed_count,
                "Capacity exceeded"
            );
            return Err(RegistrationError::CapacityExceeded {
                event_id: event.id,
                requested: request.quantity,
                available: availability.available,
            });
        }

        let status = if request.hold {
            RegistrationStatus::Pending
        } else {
            RegistrationStatus::Confirmed
        };
        let registration = Registration::new(
            event.id,
            request.user_id,
            request.quantity,
            status,
            request.idempotency_key.clone(),
            uow.now(),
        );
        let registration_id = registration.id;
        uow.store().insert_registration(registration).await?;

        tracing::debug!(
            %registration_id,
            status = %status,
            available_after = availability.available - request.quantity,
            "Spots reserved"
        );
        Ok(Reservation {
            registration_id,
            status,
            replayed: false,
        })
    }

    /// Confirm a pending registration if its spots still fit, otherwise
    /// move it to the waitlist.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the registration or its event is missing
    /// - `InvalidTransition` unless the registration is `Pending`
    /// - `Conflict` / `Deadlock` from the store (retryable)
    pub async fn confirm_pending(
        &self,
        uow: &mut UnitOfWork,
        registration_id: RegistrationId,
    ) -> Result<RegistrationStatus, RegistrationError> {
        let registration = uow
            .store()
            .load_registration(registration_id)
            .await?
            .ok_or(RegistrationError::NotFound(EntityRef::registration(
                registration_id,
            )))?;
        let (_, availability) = self.lock_availability(uow, registration.event_id).await?;
        let fits = availability.can_fit(registration.quantity);
        let now = uow.now();

        let updated = self
            .controller
            .update_registration(uow, registration.id, registration.version, move |r| {
                if fits {
                    r.confirm(now)
                } else {
                    r.waitlist(now)
                }
            })
            .await?;

        if fits {
            tracing::debug!(%registration_id, "Pending registration confirmed");
        } else {
            tracing::info!(
                %registration_id,
                available = availability.available,
                "Event full, registration waitlisted"
            );
        }
        Ok(updated.status)
    }
}
