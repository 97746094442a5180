//! Strongly typed identifiers for the stored aggregates.
//!
//! Aggregates reference each other by id only: an event never embeds its
//! registrations and a payment never embeds its registration. Lookups go
//! through the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an event
    EventId
);
uuid_id!(
    /// Unique identifier for a registration (one claim on an event's capacity)
    RegistrationId
);
uuid_id!(
    /// Unique identifier for a payment
    PaymentId
);
uuid_id!(
    /// Unique identifier for a user
    UserId
);

/// The kind of aggregate a row belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// An [`Event`](crate::model::Event)
    Event,
    /// A [`Registration`](crate::model::Registration)
    Registration,
    /// A [`Payment`](crate::model::Payment)
    Payment,
    /// A [`User`](crate::model::User)
    User,
}

impl EntityKind {
    /// Lower-case name used in logs, metric labels and error messages.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Registration => "registration",
            Self::Payment => "payment",
            Self::User => "user",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to one stored row, carried by errors for caller context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Aggregate kind
    pub kind: EntityKind,
    /// Row id
    pub id: Uuid,
}

impl EntityRef {
    /// Reference an event row.
    #[must_use]
    pub const fn event(id: EventId) -> Self {
        Self { kind: EntityKind::Event, id: id.0 }
    }

    /// Reference a registration row.
    #[must_use]
    pub const fn registration(id: RegistrationId) -> Self {
        Self { kind: EntityKind::Registration, id: id.0 }
    }

    /// Reference a payment row.
    #[must_use]
    pub const fn payment(id: PaymentId) -> Self {
        Self { kind: EntityKind::Payment, id: id.0 }
    }

    /// Reference a user row.
    #[must_use]
    pub const fn user(id: UserId) -> Self {
        Self { kind: EntityKind::User, id: id.0 }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(EventId::new(), EventId::new());
        assert_ne!(PaymentId::new(), PaymentId::new());
    }

    #[test]
    fn entity_ref_display() {
        let id = Uuid::nil();
        let entity = EntityRef::event(EventId::from_uuid(id));
        assert_eq!(
            entity.to_string(),
            "event:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn id_roundtrips_through_uuid() {
        let uuid = Uuid::new_v4();
        let id = RegistrationId::from(uuid);
        assert_eq!(id.as_uuid(), &uuid);
        assert_eq!(EntityRef::registration(id).id, uuid);
    }
}
