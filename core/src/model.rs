//! Aggregates of the registration core.
//!
//! Four aggregates are stored, each with its own [`Version`] token:
//!
//! ```text
//! Event ◄──── Registration ◄──── Payment (at most one)
//!                  │
//!                  └────► User
//! ```
//!
//! References point one way (by id). The confirmed headcount of an event is
//! never stored on the event: it is always computed from registrations at
//! read time so concurrent writers cannot race on a cached counter.

use crate::error::RegistrationError;
use crate::ids::{EntityRef, EventId, PaymentId, RegistrationId, UserId};
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default reason recorded when a caller cancels without giving one.
pub const DEFAULT_CANCELLATION_REASON: &str = "Cancelled by user";

// ============================================================================
// Event
// ============================================================================

/// An event with a fixed number of spots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: EventId,
    /// Display title (never empty)
    pub title: String,
    /// Free-form description
    pub description: String,
    /// Venue
    pub location: String,
    /// Total number of spots (always positive)
    pub capacity: u32,
    /// Whether the event accepts registrations
    pub published: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Version token
    pub version: Version,
}

impl Event {
    /// Create an unpublished event.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Validation`] if the title is blank or the
    /// capacity is zero.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        location: impl Into<String>,
        capacity: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, RegistrationError> {
        let title = title.into();
        validate_title(&title)?;
        validate_capacity(capacity)?;

        Ok(Self {
            id: EventId::new(),
            title,
            description: description.into(),
            location: location.into(),
            capacity,
            published: false,
            created_at: now,
            updated_at: now,
            version: Version::INITIAL,
        })
    }

    /// Apply a details patch (title, description, location).
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Validation`] if the patch would blank the title.
    pub fn apply_details(
        &mut self,
        patch: &EventPatch,
        now: DateTime<Utc>,
    ) -> Result<(), RegistrationError> {
        if let Some(title) = &patch.title {
            validate_title(title)?;
            self.title.clone_from(title);
        }
        if let Some(description) = &patch.description {
            self.description.clone_from(description);
        }
        if let Some(location) = &patch.location {
            self.location.clone_from(location);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Change the capacity of an unpublished event.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Validation`] for a zero capacity or one below
    ///   the current confirmed headcount
    /// - [`RegistrationError::InvalidTransition`] once the event is published
    pub fn change_capacity(
        &mut self,
        capacity: u32,
        confirmed_count: u32,
        now: DateTime<Utc>,
    ) -> Result<(), RegistrationError> {
        validate_capacity(capacity)?;
        if self.published {
            return Err(RegistrationError::InvalidTransition {
                entity: EntityRef::event(self.id),
                from: "published".to_string(),
                action: "change capacity",
            });
        }
        if capacity < confirmed_count {
            return Err(RegistrationError::Validation(format!(
                "capacity {capacity} is below the {confirmed_count} confirmed spots"
            )));
        }
        self.capacity = capacity;
        self.updated_at = now;
        Ok(())
    }

    /// Open the event for registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidTransition`] if already published.
    pub fn publish(&mut self, now: DateTime<Utc>) -> Result<(), RegistrationError> {
        if self.published {
            return Err(RegistrationError::InvalidTransition {
                entity: EntityRef::event(self.id),
                from: "published".to_string(),
                action: "publish",
            });
        }
        self.published = true;
        self.updated_at = now;
        Ok(())
    }

    /// Close the event for registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidTransition`] if the event is not
    /// published or still has confirmed registrations.
    pub fn unpublish(
        &mut self,
        confirmed_count: u32,
        now: DateTime<Utc>,
    ) -> Result<(), RegistrationError> {
        if !self.published {
            return Err(RegistrationError::InvalidTransition {
                entity: EntityRef::event(self.id),
                from: "unpublished".to_string(),
                action: "unpublish",
            });
        }
        if confirmed_count > 0 {
            return Err(RegistrationError::InvalidTransition {
                entity: EntityRef::event(self.id),
                from: format!("published with {confirmed_count} confirmed spots"),
                action: "unpublish",
            });
        }
        self.published = false;
        self.updated_at = now;
        Ok(())
    }

    /// Availability snapshot given the live confirmed headcount.
    #[must_use]
    pub const fn availability(&self, confirmed_count: u32) -> Availability {
        Availability::new(self.capacity, confirmed_count)
    }
}

fn validate_title(title: &str) -> Result<(), RegistrationError> {
    if title.trim().is_empty() {
        return Err(RegistrationError::Validation(
            "event title cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_capacity(capacity: u32) -> Result<(), RegistrationError> {
    if capacity == 0 {
        return Err(RegistrationError::Validation(
            "event capacity must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Partial update of an event's mutable details.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPatch {
    /// New title
    pub title: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New location
    pub location: Option<String>,
}

impl EventPatch {
    /// Patch that only changes the title.
    #[must_use]
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

/// Read-only capacity view of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// Total spots
    pub capacity: u32,
    /// Spots held by confirmed registrations
    pub confirmed_count: u32,
    /// Spots still free
    pub available: u32,
}

impl Availability {
    /// Derive availability; never underflows.
    #[must_use]
    pub const fn new(capacity: u32, confirmed_count: u32) -> Self {
        Self {
            capacity,
            confirmed_count,
            available: capacity.saturating_sub(confirmed_count),
        }
    }

    /// Whether `quantity` more spots fit.
    #[must_use]
    pub const fn can_fit(&self, quantity: u32) -> bool {
        quantity <= self.available
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Lifecycle state of a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationStatus {
    /// Holding a place until a payment completes; does not count toward capacity
    Pending,
    /// Holding spots; counts toward capacity
    Confirmed,
    /// Cancelled without a refund
    Cancelled,
    /// Cancelled with the attached payment refunded
    Refunded,
    /// Paid but could not be confirmed because the event filled up
    Waitlisted,
}

impl RegistrationStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::Waitlisted => "waitlisted",
        }
    }

    /// Parse from the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Validation`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, RegistrationError> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            "waitlisted" => Ok(Self::Waitlisted),
            _ => Err(RegistrationError::Validation(format!(
                "invalid registration status: {s}"
            ))),
        }
    }

    /// Cancelled or refunded registrations accept no further changes.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded)
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's claim on spots of an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Registration identifier
    pub id: RegistrationId,
    /// Event the spots belong to
    pub event_id: EventId,
    /// User holding the spots
    pub user_id: UserId,
    /// Number of spots held (at least one)
    pub quantity: u32,
    /// Lifecycle state
    pub status: RegistrationStatus,
    /// Caller-supplied deduplication token
    pub idempotency_key: Option<String>,
    /// Why the registration was cancelled
    pub cancellation_reason: Option<String>,
    /// Creation time
    pub registered_at: DateTime<Utc>,
    /// When the registration became confirmed
    pub confirmed_at: Option<DateTime<Utc>>,
    /// When the registration was cancelled or refunded
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Version token
    pub version: Version,
}

impl Registration {
    /// Create a registration in the given initial state.
    #[must_use]
    pub fn new(
        event_id: EventId,
        user_id: UserId,
        quantity: u32,
        status: RegistrationStatus,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RegistrationId::new(),
            event_id,
            user_id,
            quantity,
            status,
            idempotency_key,
            cancellation_reason: None,
            registered_at: now,
            confirmed_at: (status == RegistrationStatus::Confirmed).then_some(now),
            cancelled_at: None,
            updated_at: now,
            version: Version::INITIAL,
        }
    }

    /// Spots this registration currently holds against capacity.
    #[must_use]
    pub const fn confirmed_spots(&self) -> u32 {
        match self.status {
            RegistrationStatus::Confirmed => self.quantity,
            _ => 0,
        }
    }

    /// Confirm a pending registration.
    ///
    /// A waitlisted registration stays there until it is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidTransition`] unless pending.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> Result<(), RegistrationError> {
        if self.status != RegistrationStatus::Pending {
            return Err(self.invalid("confirm"));
        }
        self.status = RegistrationStatus::Confirmed;
        self.confirmed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Move a pending registration to the waitlist.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidTransition`] unless pending.
    pub fn waitlist(&mut self, now: DateTime<Utc>) -> Result<(), RegistrationError> {
        if self.status != RegistrationStatus::Pending {
            return Err(self.invalid("waitlist"));
        }
        self.status = RegistrationStatus::Waitlisted;
        self.updated_at = now;
        Ok(())
    }

    /// Cancel the registration, refunding when `refunded` is set.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidTransition`] if already cancelled
    /// or refunded.
    pub fn cancel(
        &mut self,
        reason: Option<String>,
        refunded: bool,
        now: DateTime<Utc>,
    ) -> Result<RegistrationStatus, RegistrationError> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.status = if refunded {
            RegistrationStatus::Refunded
        } else {
            RegistrationStatus::Cancelled
        };
        self.cancellation_reason =
            Some(reason.unwrap_or_else(|| DEFAULT_CANCELLATION_REASON.to_string()));
        self.cancelled_at = Some(now);
        self.updated_at = now;
        Ok(self.status)
    }

    fn invalid(&self, action: &'static str) -> RegistrationError {
        RegistrationError::InvalidTransition {
            entity: EntityRef::registration(self.id),
            from: self.status.to_string(),
            action,
        }
    }
}

// ============================================================================
// Payment
// ============================================================================

/// Lifecycle state of a payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Recorded, awaiting the processor's outcome
    Pending,
    /// Funds captured
    Completed,
    /// Processor declined
    Failed,
    /// Funds returned
    Refunded,
}

impl PaymentStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Parse from the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Validation`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, RegistrationError> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            _ => Err(RegistrationError::Validation(format!(
                "invalid payment status: {s}"
            ))),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ISO-4217 currency code.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Validate and normalize a currency code (three ASCII letters).
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Validation`] for anything else.
    pub fn parse(code: &str) -> Result<Self, RegistrationError> {
        let code = code.trim();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code.to_ascii_uppercase()))
        } else {
            Err(RegistrationError::Validation(format!(
                "invalid currency code: {code}"
            )))
        }
    }

    /// The upper-case code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the caller supplies when attaching a payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    /// Amount in minor units (cents)
    pub amount_minor: i64,
    /// Currency code as received
    pub currency: String,
    /// Reference assigned by the external payment processor
    pub external_txn_ref: String,
}

impl PaymentDetails {
    /// Bundle payment details.
    #[must_use]
    pub fn new(
        amount_minor: i64,
        currency: impl Into<String>,
        external_txn_ref: impl Into<String>,
    ) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
            external_txn_ref: external_txn_ref.into(),
        }
    }
}

/// A payment attached to exactly one registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment identifier
    pub id: PaymentId,
    /// Registration paid for (unique across payments)
    pub registration_id: RegistrationId,
    /// Amount in minor units
    pub amount_minor: i64,
    /// Currency
    pub currency: Currency,
    /// Processor reference
    pub external_txn_ref: String,
    /// Lifecycle state
    pub status: PaymentStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Version token
    pub version: Version,
}

impl Payment {
    /// Validate details and build a pending payment.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Validation`] for a non-positive amount, a
    /// malformed currency, or a blank processor reference.
    pub fn new(
        registration_id: RegistrationId,
        details: &PaymentDetails,
        now: DateTime<Utc>,
    ) -> Result<Self, RegistrationError> {
        if details.amount_minor <= 0 {
            return Err(RegistrationError::Validation(
                "payment amount must be greater than zero".to_string(),
            ));
        }
        if details.external_txn_ref.trim().is_empty() {
            return Err(RegistrationError::Validation(
                "external transaction reference is required".to_string(),
            ));
        }
        let currency = Currency::parse(&details.currency)?;

        Ok(Self {
            id: PaymentId::new(),
            registration_id,
            amount_minor: details.amount_minor,
            currency,
            external_txn_ref: details.external_txn_ref.clone(),
            status: PaymentStatus::Pending,
            created_at: now,
            updated_at: now,
            version: Version::INITIAL,
        })
    }

    /// Transition to `next`, enforcing the payment state machine.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidTransition`] for any move other
    /// than `Pending → Completed | Failed` and `Completed → Refunded`.
    pub fn transition(
        &mut self,
        next: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), RegistrationError> {
        let allowed = matches!(
            (self.status, next),
            (PaymentStatus::Pending, PaymentStatus::Completed | PaymentStatus::Failed)
                | (PaymentStatus::Completed, PaymentStatus::Refunded)
        );
        if !allowed {
            return Err(RegistrationError::InvalidTransition {
                entity: EntityRef::payment(self.id),
                from: self.status.to_string(),
                action: match next {
                    PaymentStatus::Pending => "reopen",
                    PaymentStatus::Completed => "complete",
                    PaymentStatus::Failed => "fail",
                    PaymentStatus::Refunded => "refund",
                },
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

// ============================================================================
// User
// ============================================================================

/// A member profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User identifier
    pub id: UserId,
    /// Public display name
    pub scene_name: String,
    /// Contact email
    pub email: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Version token
    pub version: Version,
}

impl User {
    /// Create a user profile.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Validation`] for a blank scene name or an
    /// email without `@`.
    pub fn new(
        scene_name: impl Into<String>,
        email: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, RegistrationError> {
        let scene_name = scene_name.into();
        let email = email.into();
        validate_scene_name(&scene_name)?;
        validate_email(&email)?;
        Ok(Self {
            id: UserId::new(),
            scene_name,
            email,
            created_at: now,
            updated_at: now,
            version: Version::INITIAL,
        })
    }

    /// Apply a profile patch.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Validation`] if a patched field is invalid.
    pub fn apply_profile(
        &mut self,
        patch: &UserPatch,
        now: DateTime<Utc>,
    ) -> Result<(), RegistrationError> {
        if let Some(scene_name) = &patch.scene_name {
            validate_scene_name(scene_name)?;
            self.scene_name.clone_from(scene_name);
        }
        if let Some(email) = &patch.email {
            validate_email(email)?;
            self.email.clone_from(email);
        }
        self.updated_at = now;
        Ok(())
    }
}

fn validate_scene_name(scene_name: &str) -> Result<(), RegistrationError> {
    if scene_name.trim().is_empty() {
        return Err(RegistrationError::Validation(
            "scene name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), RegistrationError> {
    if !email.contains('@') {
        return Err(RegistrationError::Validation(format!(
            "invalid email address: {email}"
        )));
    }
    Ok(())
}

/// Partial update of a user profile.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPatch {
    /// New scene name
    pub scene_name: Option<String>,
    /// New email
    pub email: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn event(capacity: u32) -> Event {
        Event::new("Rope Basics", "Intro class", "Studio A", capacity, now()).unwrap()
    }

    #[test]
    fn event_rejects_zero_capacity_and_blank_title() {
        assert!(Event::new("x", "", "", 0, now()).is_err());
        assert!(Event::new("   ", "", "", 5, now()).is_err());
    }

    #[test]
    fn new_event_is_unpublished_at_initial_version() {
        let event = event(10);
        assert!(!event.published);
        assert_eq!(event.version, Version::INITIAL);
    }

    #[test]
    fn capacity_cannot_drop_below_confirmed() {
        let mut event = event(10);
        let err = event.change_capacity(3, 4, now()).unwrap_err();
        assert!(matches!(err, RegistrationError::Validation(_)));
        event.change_capacity(4, 4, now()).unwrap();
        assert_eq!(event.capacity, 4);
    }

    #[test]
    fn capacity_is_frozen_once_published() {
        let mut event = event(10);
        event.publish(now()).unwrap();
        let err = event.change_capacity(20, 0, now()).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidTransition { .. }));
    }

    #[test]
    fn unpublish_requires_no_confirmed_registrations() {
        let mut event = event(10);
        event.publish(now()).unwrap();
        assert!(event.unpublish(1, now()).is_err());
        event.unpublish(0, now()).unwrap();
        assert!(!event.published);
    }

    #[test]
    fn details_patch_keeps_unset_fields() {
        let mut event = event(10);
        event.apply_details(&EventPatch::title("Advanced"), now()).unwrap();
        assert_eq!(event.title, "Advanced");
        assert_eq!(event.location, "Studio A");
        assert!(event.apply_details(&EventPatch::title(""), now()).is_err());
    }

    #[test]
    fn availability_saturates() {
        let availability = Availability::new(2, 5);
        assert_eq!(availability.available, 0);
        assert!(!availability.can_fit(1));
        assert!(Availability::new(3, 1).can_fit(2));
    }

    #[test]
    fn cancel_sets_default_reason_and_blocks_second_cancel() {
        let mut registration = Registration::new(
            EventId::new(),
            UserId::new(),
            1,
            RegistrationStatus::Confirmed,
            None,
            now(),
        );
        let status = registration.cancel(None, false, now()).unwrap();
        assert_eq!(status, RegistrationStatus::Cancelled);
        assert_eq!(
            registration.cancellation_reason.as_deref(),
            Some(DEFAULT_CANCELLATION_REASON)
        );
        assert_eq!(registration.confirmed_spots(), 0);
        assert!(registration.cancel(None, true, now()).is_err());
    }

    fn pending(quantity: u32) -> Registration {
        Registration::new(
            EventId::new(),
            UserId::new(),
            quantity,
            RegistrationStatus::Pending,
            None,
            now(),
        )
    }

    #[test]
    fn pending_registration_confirms() {
        let mut registration = pending(2);
        assert_eq!(registration.confirmed_spots(), 0);
        assert!(registration.confirmed_at.is_none());
        registration.confirm(now()).unwrap();
        assert_eq!(registration.confirmed_spots(), 2);
        assert!(registration.confirm(now()).is_err());
    }

    #[test]
    fn waitlisted_registration_can_only_be_cancelled() {
        let mut registration = pending(2);
        registration.waitlist(now()).unwrap();

        let err = registration.confirm(now()).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidTransition { .. }));
        assert_eq!(registration.status, RegistrationStatus::Waitlisted);
        assert_eq!(registration.confirmed_spots(), 0);

        assert_eq!(
            registration.cancel(None, true, now()).unwrap(),
            RegistrationStatus::Refunded
        );
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [
            RegistrationStatus::Pending,
            RegistrationStatus::Confirmed,
            RegistrationStatus::Cancelled,
            RegistrationStatus::Refunded,
            RegistrationStatus::Waitlisted,
        ] {
            assert_eq!(RegistrationStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PaymentStatus::parse("settled").is_err());
    }

    #[test]
    fn payment_validation() {
        let registration_id = RegistrationId::new();
        assert!(Payment::new(registration_id, &PaymentDetails::new(0, "USD", "tx"), now()).is_err());
        assert!(Payment::new(registration_id, &PaymentDetails::new(100, "US", "tx"), now()).is_err());
        assert!(Payment::new(registration_id, &PaymentDetails::new(100, "USD", " "), now()).is_err());

        let payment =
            Payment::new(registration_id, &PaymentDetails::new(5000, "usd", "ch_1"), now()).unwrap();
        assert_eq!(payment.currency.as_str(), "USD");
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[test]
    fn payment_state_machine() {
        let mut payment = Payment::new(
            RegistrationId::new(),
            &PaymentDetails::new(5000, "USD", "ch_1"),
            now(),
        )
        .unwrap();
        assert!(payment.transition(PaymentStatus::Refunded, now()).is_err());
        payment.transition(PaymentStatus::Completed, now()).unwrap();
        assert!(payment.transition(PaymentStatus::Failed, now()).is_err());
        payment.transition(PaymentStatus::Refunded, now()).unwrap();
    }

    #[test]
    fn user_profile_validation() {
        assert!(User::new("", "a@b.c", now()).is_err());
        assert!(User::new("Knot", "not-an-email", now()).is_err());
        let mut user = User::new("Knot", "knot@example.com", now()).unwrap();
        let patch = UserPatch {
            scene_name: Some("Hitch".to_string()),
            email: None,
        };
        user.apply_profile(&patch, now()).unwrap();
        assert_eq!(user.scene_name, "Hitch");
        assert_eq!(user.email, "knot@example.com");
    }

    #[test]
    fn availability_wire_shape() {
        let json = serde_json::to_value(Availability::new(10, 4)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "capacity": 10, "confirmed_count": 4, "available": 6 })
        );
    }

    proptest::proptest! {
        #[test]
        fn availability_never_underflows(
            capacity in 0_u32..1_000,
            confirmed in 0_u32..2_000,
            quantity in 0_u32..2_000,
        ) {
            let availability = Availability::new(capacity, confirmed);
            proptest::prop_assert!(availability.available <= capacity);
            if confirmed <= capacity {
                proptest::prop_assert_eq!(
                    availability.can_fit(quantity),
                    confirmed + quantity <= capacity
                );
            } else {
                proptest::prop_assert_eq!(availability.available, 0);
            }
        }
    }
}
