//! Payment idempotency guard.
//!
//! At most one payment may reference a registration. The [`PaymentGuard`]
//! enforces this twice:
//!
//! - In the transaction: look for an existing payment before inserting
//! - In storage: a unique constraint on `payments.registration_id`; a
//!   violation of it is reported as `DuplicatePayment`
//!
//! A duplicate is a final outcome. Under contention the losing attach may
//! first see a retryable conflict; the retry then finds the winner's payment
//! and reports the duplicate.

use crate::allocator::CapacityAllocator;
use crate::concurrency::ConcurrencyController;
use crate::transaction::UnitOfWork;
use turnstile_core::{
    EntityRef, PAYMENT_REGISTRATION_CONSTRAINT, Payment, PaymentDetails, PaymentId,
    PaymentStatus, RegistrationError, RegistrationId, RegistrationStatus, StoreError, Version,
};

/// Outcome of completing a payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaymentCompletion {
    /// New version of the payment
    pub payment_version: Version,
    /// Status of the paid registration afterwards
    pub registration_status: RegistrationStatus,
}

/// Translate a storage-level unique violation on the payment constraint.
#[must_use]
pub fn duplicate_on_violation(
    registration_id: RegistrationId,
    error: RegistrationError,
) -> RegistrationError {
    match error {
        RegistrationError::Store(StoreError::UniqueViolation { constraint })
            if constraint == PAYMENT_REGISTRATION_CONSTRAINT =>
        {
            RegistrationError::DuplicatePayment {
                registration_id,
                existing: None,
            }
        }
        other => other,
    }
}

/// Attaches, completes, fails and refunds payments.
#[derive(Clone, Copy, Debug, Default)]
pub struct PaymentGuard {
    controller: ConcurrencyController,
    allocator: CapacityAllocator,
}

impl PaymentGuard {
    /// Create a guard.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            controller: ConcurrencyController::new(),
            allocator: CapacityAllocator::new(),
        }
    }

    /// Attach a pending payment to a registration.
    ///
    /// # Errors
    ///
    /// - `Validation` for a non-positive amount, a bad currency or a blank reference
    /// - `NotFound` if the registration does not exist
    /// - `InvalidTransition` if the registration is cancelled or refunded
    /// - `DuplicatePayment` if the registration already has a payment
    /// - `Conflict` / `Deadlock` from the store (retryable)
    #[tracing::instrument(skip(self, uow, details), fields(%registration_id))]
    pub async fn attach(
        &self,
        uow: &mut UnitOfWork,
        registration_id: RegistrationId,
        details: &PaymentDetails,
    ) -> Result<PaymentId, RegistrationError> {
        let payment = Payment::new(registration_id, details, uow.now())?;

        let registration = uow
            .store()
            .load_registration(registration_id)
            .await?
            .ok_or(RegistrationError::NotFound(EntityRef::registration(
                registration_id,
            )))?;
        if registration.status.is_terminal() {
            return Err(RegistrationError::InvalidTransition {
                entity: EntityRef::registration(registration_id),
                from: registration.status.to_string(),
                action: "attach payment to",
            });
        }

        if let Some(existing) = uow.store().payment_for_registration(registration_id).await? {
            tracing::info!(existing = %existing.id, "Registration already has a payment");
            return Err(RegistrationError::DuplicatePayment {
                registration_id,
                existing: Some(existing.id),
            });
        }

        let payment_id = payment.id;
        uow.store()
            .insert_payment(payment)
            .await
            .map_err(|e| duplicate_on_violation(registration_id, e.into()))?;

        tracing::debug!(%payment_id, "Payment attached");
        Ok(payment_id)
    }

    /// Mark a payment completed; a pending registration is confirmed (or
    /// waitlisted if the event filled up) in the same transaction.
    ///
    /// # Errors
    ///
    /// - `NotFound` / `Conflict` from the conditional write
    /// - `InvalidTransition` unless the payment is pending
    pub async fn complete(
        &self,
        uow: &mut UnitOfWork,
        payment_id: PaymentId,
        expected: Version,
    ) -> Result<PaymentCompletion, RegistrationError> {
        let now = uow.now();
        let payment = self
            .controller
            .update_payment(uow, payment_id, expected, move |p| {
                p.transition(PaymentStatus::Completed, now)
            })
            .await?;

        let registration = uow
            .store()
            .load_registration(payment.registration_id)
            .await?
            .ok_or(RegistrationError::NotFound(EntityRef::registration(
                payment.registration_id,
            )))?;

        let registration_status = if registration.status == RegistrationStatus::Pending {
            let allocator = self.allocator;
            let registration_id = registration.id;
            uow.run_atomic(move |uow| {
                Box::pin(async move { allocator.confirm_pending(uow, registration_id).await })
            })
            .await?
        } else {
            registration.status
        };

        tracing::debug!(%payment_id, registration_status = %registration_status, "Payment completed");
        Ok(PaymentCompletion {
            payment_version: payment.version,
            registration_status,
        })
    }

    /// Mark a payment failed.
    ///
    /// # Errors
    ///
    /// - `NotFound` / `Conflict` from the conditional write
    /// - `InvalidTransition` unless the payment is pending
    pub async fn fail(
        &self,
        uow: &mut UnitOfWork,
        payment_id: PaymentId,
        expected: Version,
    ) -> Result<Version, RegistrationError> {
        let now = uow.now();
        let payment = self
            .controller
            .update_payment(uow, payment_id, expected, move |p| {
                p.transition(PaymentStatus::Failed, now)
            })
            .await?;
        Ok(payment.version)
    }

    /// Refund a completed payment.
    ///
    /// # Errors
    ///
    /// - `NotFound` / `Conflict` from the conditional write
    /// - `InvalidTransition` unless the payment is completed
    pub async fn refund(
        &self,
        uow: &mut UnitOfWork,
        payment: &Payment,
    ) -> Result<Version, RegistrationError> {
        let now = uow.now();
        let refunded = self
            .controller
            .update_payment(uow, payment.id, payment.version, move |p| {
                p.transition(PaymentStatus::Refunded, now)
            })
            .await?;
        tracing::info!(payment_id = %payment.id, "Payment refunded");
        Ok(refunded.version)
    }
}
