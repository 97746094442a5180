//! Row decoding.

use crate::error::{codec, map_sqlx};
use sqlx::Row;
use sqlx::postgres::PgRow;
use turnstile_core::{
    Currency, Event, EventId, Payment, PaymentId, PaymentStatus, Registration, RegistrationId,
    RegistrationStatus, StoreResult, User, UserId, Version,
};
use uuid::Uuid;

pub(crate) const EVENT_COLUMNS: &str =
    "id, title, description, location, capacity, published, created_at, updated_at, version";

pub(crate) const REGISTRATION_COLUMNS: &str = "id, event_id, user_id, quantity, status, \
     idempotency_key, cancellation_reason, registered_at, confirmed_at, cancelled_at, \
     updated_at, version";

pub(crate) const PAYMENT_COLUMNS: &str = "id, registration_id, amount_minor, currency, \
     external_txn_ref, status, created_at, updated_at, version";

pub(crate) const USER_COLUMNS: &str = "id, scene_name, email, created_at, updated_at, version";

fn get<'r, T>(row: &'r PgRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(map_sqlx)
}

fn unsigned(row: &PgRow, column: &str) -> StoreResult<u32> {
    let value: i32 = get(row, column)?;
    u32::try_from(value).map_err(|e| codec(column, e))
}

fn version(row: &PgRow) -> StoreResult<Version> {
    Ok(Version::from_i64(get(row, "version")?))
}

pub(crate) fn to_i32(column: &str, value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|e| codec(column, e))
}

pub(crate) fn event(row: &PgRow) -> StoreResult<Event> {
    Ok(Event {
        id: EventId::from_uuid(get::<Uuid>(row, "id")?),
        title: get(row, "title")?,
        description: get(row, "description")?,
        location: get(row, "location")?,
        capacity: unsigned(row, "capacity")?,
        published: get(row, "published")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        version: version(row)?,
    })
}

pub(crate) fn registration(row: &PgRow) -> StoreResult<Registration> {
    let status: String = get(row, "status")?;
    Ok(Registration {
        id: RegistrationId::from_uuid(get::<Uuid>(row, "id")?),
        event_id: EventId::from_uuid(get::<Uuid>(row, "event_id")?),
        user_id: UserId::from_uuid(get::<Uuid>(row, "user_id")?),
        quantity: unsigned(row, "quantity")?,
        status: RegistrationStatus::parse(&status).map_err(|e| codec("status", e))?,
        idempotency_key: get(row, "idempotency_key")?,
        cancellation_reason: get(row, "cancellation_reason")?,
        registered_at: get(row, "registered_at")?,
        confirmed_at: get(row, "confirmed_at")?,
        cancelled_at: get(row, "cancelled_at")?,
        updated_at: get(row, "updated_at")?,
        version: version(row)?,
    })
}

pub(crate) fn payment(row: &PgRow) -> StoreResult<Payment> {
    let status: String = get(row, "status")?;
    let currency: String = get(row, "currency")?;
    Ok(Payment {
        id: PaymentId::from_uuid(get::<Uuid>(row, "id")?),
        registration_id: RegistrationId::from_uuid(get::<Uuid>(row, "registration_id")?),
        amount_minor: get(row, "amount_minor")?,
        currency: Currency::parse(&currency).map_err(|e| codec("currency", e))?,
        external_txn_ref: get(row, "external_txn_ref")?,
        status: PaymentStatus::parse(&status).map_err(|e| codec("status", e))?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        version: version(row)?,
    })
}

pub(crate) fn user(row: &PgRow) -> StoreResult<User> {
    Ok(User {
        id: UserId::from_uuid(get::<Uuid>(row, "id")?),
        scene_name: get(row, "scene_name")?,
        email: get(row, "email")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        version: version(row)?,
    })
}
