//! The registration service: the boundary callers talk to.
//!
//! Every operation:
//!
//! 1. Runs under a deadline (the context's, or the configured default) and
//!    an optional cancellation token; either firing drops the in-flight
//!    transaction and yields [`RegistrationError::Timeout`]
//! 2. Runs its reads and writes in one transaction via the
//!    [`TransactionManager`]
//! 3. Records its outcome in metrics after the commit
//!
//! Operations that do not carry a caller-supplied version
//! (`create_registration`, `hold_registration`, `attach_payment`,
//! `update_event_details_with_retry`) are wrapped in [`with_retry`]: each
//! attempt re-reads current state. Operations that do carry a version report
//! a stale version as `Conflict` and leave the re-read to the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! let service = RegistrationService::new(Arc::new(store), &TurnstileConfig::from_env());
//! let ctx = OperationContext::new();
//!
//! let id = service
//!     .create_registration(event_id, user_id, 2, Some("checkout-7".into()), &ctx)
//!     .await?;
//! let payment = service
//!     .attach_payment(id, PaymentDetails::new(5_000, "USD", "ch_123"), &ctx)
//!     .await?;
//! ```

use crate::allocator::{CapacityAllocator, Reservation, ReserveRequest};
use crate::concurrency::ConcurrencyController;
use crate::config::TurnstileConfig;
use crate::metrics::{PaymentMetrics, RegistrationMetrics};
use crate::payments::{PaymentCompletion, PaymentGuard, duplicate_on_violation};
use crate::retry::{RetryPolicy, with_retry};
use crate::transaction::{OperationContext, TransactionManager, run_with_deadline};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use turnstile_core::environment::{Clock, SystemClock};
use turnstile_core::{
    AggregateStore, Availability, EntityRef, Event, EventId, EventPatch, Payment, PaymentDetails,
    PaymentId, PaymentStatus, Registration, RegistrationError, RegistrationId,
    RegistrationStatus, User, UserId, UserPatch, Version,
};

/// Capacity-constrained registration and payment operations over a store.
pub struct RegistrationService<S> {
    transactions: TransactionManager<S>,
    retry: RetryPolicy,
    default_timeout: Duration,
    controller: ConcurrencyController,
    allocator: CapacityAllocator,
    payments: PaymentGuard,
}

impl<S> Clone for RegistrationService<S> {
    fn clone(&self) -> Self {
        Self {
            transactions: self.transactions.clone(),
            retry: self.retry.clone(),
            default_timeout: self.default_timeout,
            controller: self.controller,
            allocator: self.allocator,
            payments: self.payments,
        }
    }
}

impl<S> std::fmt::Debug for RegistrationService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationService")
            .field("retry", &self.retry)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl<S: AggregateStore + 'static> RegistrationService<S> {
    /// Create a service using the system clock.
    #[must_use]
    pub fn new(store: Arc<S>, config: &TurnstileConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    /// Create a service with an injected clock.
    #[must_use]
    pub fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>, config: &TurnstileConfig) -> Self {
        Self {
            transactions: TransactionManager::new(store, clock),
            retry: config.retry.policy(),
            default_timeout: config.operation.timeout(),
            controller: ConcurrencyController::new(),
            allocator: CapacityAllocator::new(),
            payments: PaymentGuard::new(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        self.transactions.store()
    }

    async fn bounded<T, Fut>(
        &self,
        operation: &'static str,
        ctx: &OperationContext,
        future: Fut,
    ) -> Result<T, RegistrationError>
    where
        Fut: Future<Output = Result<T, RegistrationError>>,
    {
        let timeout = ctx.timeout().unwrap_or(self.default_timeout);
        run_with_deadline(operation, timeout, ctx.cancellation(), future).await
    }

    async fn reserve_with_retry(
        &self,
        operation: &'static str,
        request: ReserveRequest,
    ) -> Result<Reservation, RegistrationError> {
        let transactions = &self.transactions;
        let allocator = self.allocator;
        with_retry(&self.retry, operation, move || {
            let request = request.clone();
            async move {
                transactions
                    .run_atomic(operation, move |uow| {
                        Box::pin(async move { allocator.reserve(uow, &request).await })
                    })
                    .await
            }
        })
        .await
    }

    // ========================================================================
    // Registrations
    // ========================================================================

    /// Reserve `quantity` confirmed spots for a user.
    ///
    /// A repeated `idempotency_key` for the same user and event returns the
    /// registration created the first time, without allocating.
    ///
    /// # Errors
    ///
    /// - `CapacityExceeded` if the spots do not fit
    /// - `RetriesExhausted` if conflicts persisted through every attempt
    /// - `InvalidQuantity`, `NotFound`, `EventNotPublished`, `Timeout`
    #[tracing::instrument(skip(self, idempotency_key, ctx))]
    pub async fn create_registration(
        &self,
        event_id: EventId,
        user_id: UserId,
        quantity: u32,
        idempotency_key: Option<String>,
        ctx: &OperationContext,
    ) -> Result<RegistrationId, RegistrationError> {
        const OPERATION: &str = "create_registration";
        let request =
            ReserveRequest::new(event_id, user_id, quantity).with_idempotency_key(idempotency_key);
        let result = self
            .bounded(OPERATION, ctx, self.reserve_with_retry(OPERATION, request))
            .await;
        record_reservation(&result, "confirmed");
        result.map(|reservation| reservation.registration_id)
    }

    /// Create a `Pending` registration that a completed payment confirms.
    ///
    /// # Errors
    ///
    /// As [`RegistrationService::create_registration`].
    #[tracing::instrument(skip(self, idempotency_key, ctx))]
    pub async fn hold_registration(
        &self,
        event_id: EventId,
        user_id: UserId,
        quantity: u32,
        idempotency_key: Option<String>,
        ctx: &OperationContext,
    ) -> Result<RegistrationId, RegistrationError> {
        const OPERATION: &str = "hold_registration";
        let request = ReserveRequest::new(event_id, user_id, quantity)
            .with_idempotency_key(idempotency_key)
            .as_hold();
        let result = self
            .bounded(OPERATION, ctx, self.reserve_with_retry(OPERATION, request))
            .await;
        record_reservation(&result, "held");
        result.map(|reservation| reservation.registration_id)
    }

    /// Cancel a registration, refunding a completed payment.
    ///
    /// Returns `Refunded` when a completed payment was refunded, otherwise
    /// `Cancelled`. Without a `reason` a default one is recorded.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `expected` is stale
    /// - `InvalidTransition` if already cancelled or refunded
    /// - `NotFound`, `Timeout`
    #[tracing::instrument(skip(self, reason, ctx))]
    pub async fn cancel_registration(
        &self,
        registration_id: RegistrationId,
        expected: Version,
        reason: Option<String>,
        ctx: &OperationContext,
    ) -> Result<RegistrationStatus, RegistrationError> {
        const OPERATION: &str = "cancel_registration";
        let controller = self.controller;
        let payments = self.payments;
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                let payment = uow.store().payment_for_registration(registration_id).await?;
                let refund = payment.filter(|p| p.status == PaymentStatus::Completed);
                let now = uow.now();
                let refunded = refund.is_some();

                let registration = controller
                    .update_registration(uow, registration_id, expected, move |r| {
                        r.cancel(reason, refunded, now).map(|_| ())
                    })
                    .await?;
                if let Some(payment) = refund {
                    payments.refund(uow, &payment).await?;
                }
                Ok(registration.status)
            })
        });

        let status = self.bounded(OPERATION, ctx, work).await?;
        RegistrationMetrics::record("cancelled");
        if status == RegistrationStatus::Refunded {
            PaymentMetrics::record("refunded");
        }
        tracing::info!(%registration_id, %status, "Registration cancelled");
        Ok(status)
    }

    /// Delete a registration together with its payment.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `expected` is stale
    /// - `NotFound`, `Timeout`
    #[tracing::instrument(skip(self, ctx))]
    pub async fn delete_registration(
        &self,
        registration_id: RegistrationId,
        expected: Version,
        ctx: &OperationContext,
    ) -> Result<(), RegistrationError> {
        const OPERATION: &str = "delete_registration";
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                uow.store()
                    .delete_registration(registration_id, expected)
                    .await?;
                Ok(())
            })
        });
        self.bounded(OPERATION, ctx, work).await?;
        tracing::info!(%registration_id, "Registration deleted");
        Ok(())
    }

    /// Fetch a registration.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Timeout`.
    pub async fn get_registration(
        &self,
        registration_id: RegistrationId,
        ctx: &OperationContext,
    ) -> Result<Registration, RegistrationError> {
        const OPERATION: &str = "get_registration";
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                uow.store()
                    .load_registration(registration_id)
                    .await?
                    .ok_or(RegistrationError::NotFound(EntityRef::registration(
                        registration_id,
                    )))
            })
        });
        self.bounded(OPERATION, ctx, work).await
    }

    // ========================================================================
    // Payments
    // ========================================================================

    /// Attach a payment to a registration.
    ///
    /// Of any number of concurrent attaches for one registration exactly one
    /// succeeds; the others get `DuplicatePayment`.
    ///
    /// # Errors
    ///
    /// - `DuplicatePayment` if the registration already has a payment
    /// - `Validation`, `NotFound`, `InvalidTransition`, `Timeout`
    /// - `RetriesExhausted` if conflicts persisted through every attempt
    #[tracing::instrument(skip(self, details, ctx))]
    pub async fn attach_payment(
        &self,
        registration_id: RegistrationId,
        details: PaymentDetails,
        ctx: &OperationContext,
    ) -> Result<PaymentId, RegistrationError> {
        const OPERATION: &str = "attach_payment";
        let transactions = &self.transactions;
        let guard = self.payments;
        let work = with_retry(&self.retry, OPERATION, move || {
            let details = details.clone();
            async move {
                transactions
                    .run_atomic(OPERATION, move |uow| {
                        Box::pin(async move { guard.attach(uow, registration_id, &details).await })
                    })
                    .await
                    .map_err(|error| duplicate_on_violation(registration_id, error))
            }
        });

        let result = self.bounded(OPERATION, ctx, work).await;
        match &result {
            Ok(_) => PaymentMetrics::record("attached"),
            Err(RegistrationError::DuplicatePayment { .. }) => PaymentMetrics::record("duplicate"),
            Err(_) => {}
        }
        result
    }

    /// Mark a payment completed, confirming a held registration.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `expected` is stale
    /// - `InvalidTransition` unless the payment is pending
    /// - `NotFound`, `Timeout`
    #[tracing::instrument(skip(self, ctx))]
    pub async fn complete_payment(
        &self,
        payment_id: PaymentId,
        expected: Version,
        ctx: &OperationContext,
    ) -> Result<PaymentCompletion, RegistrationError> {
        const OPERATION: &str = "complete_payment";
        let guard = self.payments;
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move { guard.complete(uow, payment_id, expected).await })
        });
        let completion = self.bounded(OPERATION, ctx, work).await?;
        PaymentMetrics::record("completed");
        if completion.registration_status == RegistrationStatus::Waitlisted {
            RegistrationMetrics::record("waitlisted");
        }
        Ok(completion)
    }

    /// Mark a payment failed.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `expected` is stale
    /// - `InvalidTransition` unless the payment is pending
    /// - `NotFound`, `Timeout`
    #[tracing::instrument(skip(self, ctx))]
    pub async fn fail_payment(
        &self,
        payment_id: PaymentId,
        expected: Version,
        ctx: &OperationContext,
    ) -> Result<Version, RegistrationError> {
        const OPERATION: &str = "fail_payment";
        let guard = self.payments;
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move { guard.fail(uow, payment_id, expected).await })
        });
        let version = self.bounded(OPERATION, ctx, work).await?;
        PaymentMetrics::record("failed");
        Ok(version)
    }

    /// The payment attached to a registration, if any.
    ///
    /// # Errors
    ///
    /// `NotFound` if the registration does not exist, `Timeout`.
    pub async fn get_payment_for_registration(
        &self,
        registration_id: RegistrationId,
        ctx: &OperationContext,
    ) -> Result<Option<Payment>, RegistrationError> {
        const OPERATION: &str = "get_payment_for_registration";
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                if uow.store().load_registration(registration_id).await?.is_none() {
                    return Err(RegistrationError::NotFound(EntityRef::registration(
                        registration_id,
                    )));
                }
                Ok(uow.store().payment_for_registration(registration_id).await?)
            })
        });
        self.bounded(OPERATION, ctx, work).await
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Create an unpublished event.
    ///
    /// # Errors
    ///
    /// `Validation` for a blank title or zero capacity, `Timeout`.
    #[tracing::instrument(skip(self, description, location, ctx))]
    pub async fn create_event(
        &self,
        title: String,
        description: String,
        location: String,
        capacity: u32,
        ctx: &OperationContext,
    ) -> Result<Event, RegistrationError> {
        const OPERATION: &str = "create_event";
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                let event = Event::new(title, description, location, capacity, uow.now())?;
                uow.store().insert_event(event.clone()).await?;
                Ok(event)
            })
        });
        let event = self.bounded(OPERATION, ctx, work).await?;
        tracing::info!(event_id = %event.id, capacity, "Event created");
        Ok(event)
    }

    /// Apply a details patch with a single conditional write.
    ///
    /// Returns `expected + 1`.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `expected` is stale
    /// - `Validation`, `NotFound`, `Timeout`
    #[tracing::instrument(skip(self, patch, ctx))]
    pub async fn update_event_details(
        &self,
        event_id: EventId,
        patch: EventPatch,
        expected: Version,
        ctx: &OperationContext,
    ) -> Result<Version, RegistrationError> {
        const OPERATION: &str = "update_event_details";
        let controller = self.controller;
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                let now = uow.now();
                let event = controller
                    .update_event(uow, event_id, expected, move |e| e.apply_details(&patch, now))
                    .await?;
                Ok(event.version)
            })
        });
        self.bounded(OPERATION, ctx, work).await
    }

    /// Apply a details patch to whatever version is current, retrying on
    /// conflicts.
    ///
    /// # Errors
    ///
    /// - `RetriesExhausted` if conflicts persisted through every attempt
    /// - `Validation`, `NotFound`, `Timeout`
    #[tracing::instrument(skip(self, patch, ctx))]
    pub async fn update_event_details_with_retry(
        &self,
        event_id: EventId,
        patch: EventPatch,
        ctx: &OperationContext,
    ) -> Result<Version, RegistrationError> {
        const OPERATION: &str = "update_event_details_with_retry";
        let transactions = &self.transactions;
        let controller = self.controller;
        let work = with_retry(&self.retry, OPERATION, move || {
            let patch = patch.clone();
            async move {
                transactions
                    .run_atomic(OPERATION, move |uow| {
                        Box::pin(async move {
                            let current = uow
                                .store()
                                .load_event(event_id)
                                .await?
                                .ok_or(RegistrationError::NotFound(EntityRef::event(event_id)))?;
                            let now = uow.now();
                            let event = controller
                                .update_event(uow, event_id, current.version, move |e| {
                                    e.apply_details(&patch, now)
                                })
                                .await?;
                            Ok(event.version)
                        })
                    })
                    .await
            }
        });
        self.bounded(OPERATION, ctx, work).await
    }

    /// Change the capacity of an unpublished event.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `expected` is stale
    /// - `InvalidTransition` once published
    /// - `Validation` for zero or a value below the confirmed headcount
    /// - `NotFound`, `Timeout`
    #[tracing::instrument(skip(self, ctx))]
    pub async fn update_event_capacity(
        &self,
        event_id: EventId,
        capacity: u32,
        expected: Version,
        ctx: &OperationContext,
    ) -> Result<Version, RegistrationError> {
        const OPERATION: &str = "update_event_capacity";
        let controller = self.controller;
        let allocator = self.allocator;
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                let (_, availability) = allocator.lock_availability(uow, event_id).await?;
                let confirmed = availability.confirmed_count;
                let now = uow.now();
                let event = controller
                    .update_event(uow, event_id, expected, move |e| {
                        e.change_capacity(capacity, confirmed, now)
                    })
                    .await?;
                Ok(event.version)
            })
        });
        self.bounded(OPERATION, ctx, work).await
    }

    /// Open an event for registration.
    ///
    /// # Errors
    ///
    /// `Conflict`, `InvalidTransition` if already published, `NotFound`, `Timeout`.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn publish_event(
        &self,
        event_id: EventId,
        expected: Version,
        ctx: &OperationContext,
    ) -> Result<Version, RegistrationError> {
        const OPERATION: &str = "publish_event";
        let controller = self.controller;
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                let now = uow.now();
                let event = controller
                    .update_event(uow, event_id, expected, move |e| e.publish(now))
                    .await?;
                Ok(event.version)
            })
        });
        let version = self.bounded(OPERATION, ctx, work).await?;
        tracing::info!(%event_id, "Event published");
        Ok(version)
    }

    /// Close an event that has no confirmed registrations.
    ///
    /// # Errors
    ///
    /// `Conflict`, `InvalidTransition` if unpublished or still holding
    /// confirmed spots, `NotFound`, `Timeout`.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn unpublish_event(
        &self,
        event_id: EventId,
        expected: Version,
        ctx: &OperationContext,
    ) -> Result<Version, RegistrationError> {
        const OPERATION: &str = "unpublish_event";
        let controller = self.controller;
        let allocator = self.allocator;
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                let (_, availability) = allocator.lock_availability(uow, event_id).await?;
                let confirmed = availability.confirmed_count;
                let now = uow.now();
                let event = controller
                    .update_event(uow, event_id, expected, move |e| e.unpublish(confirmed, now))
                    .await?;
                Ok(event.version)
            })
        });
        let version = self.bounded(OPERATION, ctx, work).await?;
        tracing::info!(%event_id, "Event unpublished");
        Ok(version)
    }

    /// Capacity, confirmed headcount and free spots of an event.
    ///
    /// Reads without locking the event, so it never waits for reservations.
    /// A serialization failure reported by the store is retried.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Timeout`.
    pub async fn get_event_availability(
        &self,
        event_id: EventId,
        ctx: &OperationContext,
    ) -> Result<Availability, RegistrationError> {
        const OPERATION: &str = "get_event_availability";
        let transactions = &self.transactions;
        let allocator = self.allocator;
        let work = with_retry(&self.retry, OPERATION, move || async move {
            transactions
                .run_atomic(OPERATION, move |uow| {
                    Box::pin(async move { allocator.availability(uow, event_id).await })
                })
                .await
        });
        self.bounded(OPERATION, ctx, work).await
    }

    /// Fetch an event.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Timeout`.
    pub async fn get_event(
        &self,
        event_id: EventId,
        ctx: &OperationContext,
    ) -> Result<Event, RegistrationError> {
        const OPERATION: &str = "get_event";
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                uow.store()
                    .load_event(event_id)
                    .await?
                    .ok_or(RegistrationError::NotFound(EntityRef::event(event_id)))
            })
        });
        self.bounded(OPERATION, ctx, work).await
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Create a user profile.
    ///
    /// # Errors
    ///
    /// `Validation`, `Store` on a taken email, `Timeout`.
    #[tracing::instrument(skip(self, email, ctx))]
    pub async fn register_user(
        &self,
        scene_name: String,
        email: String,
        ctx: &OperationContext,
    ) -> Result<User, RegistrationError> {
        const OPERATION: &str = "register_user";
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                let user = User::new(scene_name, email, uow.now())?;
                uow.store().insert_user(user.clone()).await?;
                Ok(user)
            })
        });
        self.bounded(OPERATION, ctx, work).await
    }

    /// Apply a profile patch.
    ///
    /// # Errors
    ///
    /// `Conflict`, `Validation`, `NotFound`, `Timeout`.
    #[tracing::instrument(skip(self, patch, ctx))]
    pub async fn update_user_profile(
        &self,
        user_id: UserId,
        patch: UserPatch,
        expected: Version,
        ctx: &OperationContext,
    ) -> Result<Version, RegistrationError> {
        const OPERATION: &str = "update_user_profile";
        let controller = self.controller;
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                let now = uow.now();
                let user = controller
                    .update_user(uow, user_id, expected, move |u| u.apply_profile(&patch, now))
                    .await?;
                Ok(user.version)
            })
        });
        self.bounded(OPERATION, ctx, work).await
    }

    /// Fetch a user.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Timeout`.
    pub async fn get_user(
        &self,
        user_id: UserId,
        ctx: &OperationContext,
    ) -> Result<User, RegistrationError> {
        const OPERATION: &str = "get_user";
        let work = self.transactions.run_atomic(OPERATION, move |uow| {
            Box::pin(async move {
                uow.store()
                    .load_user(user_id)
                    .await?
                    .ok_or(RegistrationError::NotFound(EntityRef::user(user_id)))
            })
        });
        self.bounded(OPERATION, ctx, work).await
    }
}

fn record_reservation(result: &Result<Reservation, RegistrationError>, created: &'static str) {
    match result {
        Ok(reservation) if reservation.replayed => RegistrationMetrics::record("replayed"),
        Ok(_) => RegistrationMetrics::record(created),
        Err(RegistrationError::CapacityExceeded { .. }) => {
            RegistrationMetrics::record("capacity_exceeded");
        }
        Err(_) => {}
    }
}
