//! Ready-made aggregates for tests.
//!
//! Every fixture is stamped with [`test_clock`](crate::mocks::test_clock)
//! time so assertions on timestamps stay deterministic.

#![allow(clippy::expect_used)] // Fixtures use constant, known-valid input

use crate::mocks::test_clock;
use turnstile_core::environment::Clock;
use turnstile_core::{
    Event, EventId, PaymentDetails, Registration, RegistrationStatus, User, UserId,
};

/// An unpublished event with the given capacity.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn draft_event(capacity: u32) -> Event {
    Event::new(
        "Rope Basics",
        "Introduction to rope handling",
        "Studio A",
        capacity,
        test_clock().now(),
    )
    .expect("fixture event must be valid")
}

/// A published event with the given capacity.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn published_event(capacity: u32) -> Event {
    let mut event = draft_event(capacity);
    event
        .publish(test_clock().now())
        .expect("draft event can be published");
    event
}

/// A user with a unique email.
#[must_use]
pub fn user() -> User {
    let id = UserId::new();
    User::new("Knot", format!("{id}@example.com"), test_clock().now())
        .expect("fixture user must be valid")
}

/// A single-spot pending registration for a random user.
#[must_use]
pub fn pending_registration(event_id: EventId) -> Registration {
    Registration::new(
        event_id,
        UserId::new(),
        1,
        RegistrationStatus::Pending,
        None,
        test_clock().now(),
    )
}

/// A confirmed registration holding `quantity` spots for a random user.
#[must_use]
pub fn confirmed_registration(event_id: EventId, quantity: u32) -> Registration {
    Registration::new(
        event_id,
        UserId::new(),
        quantity,
        RegistrationStatus::Confirmed,
        None,
        test_clock().now(),
    )
}

/// Valid payment details (50.00 USD).
#[must_use]
pub fn payment_details() -> PaymentDetails {
    PaymentDetails::new(5_000, "USD", "ch_test_1")
}
