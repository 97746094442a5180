//! `PostgreSQL` implementation of [`AggregateStore`].
//!
//! Every transaction is opened with the configured isolation level and an
//! optional `statement_timeout`. Conditional writes are single
//! `UPDATE ... WHERE id = $1 AND version = $n RETURNING version` statements;
//! when they match nothing, one follow-up read tells a stale version apart
//! from a missing row.
//!
//! # Capacity checks
//!
//! [`lock_event`](StoreTransaction::lock_event) reads the event with
//! `SELECT ... FOR UPDATE`, so every transaction about to compare capacity
//! with the headcount queues behind the others for that event. Under
//! `READ COMMITTED` the row it returns and the
//! [`confirmed_spots`](StoreTransaction::confirmed_spots) sum read after it
//! are the latest committed state. Under `SERIALIZABLE` a lock on a row that
//! changed since the snapshot fails with `40001` and the caller retries.
//!
//! `confirmed_spots` itself takes no lock, so availability reads never block
//! reservations.

use crate::config::{IsolationLevel, PostgresConfig};
use crate::error::{codec, map_sqlx};
use crate::rows::{self, EVENT_COLUMNS, PAYMENT_COLUMNS, REGISTRATION_COLUMNS, USER_COLUMNS};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Transaction};
use turnstile_core::{
    AggregateStore, EntityRef, Event, EventId, Payment, PaymentId, Registration, RegistrationId,
    RegistrationStatus, StoreError, StoreFuture, StoreResult, StoreTransaction, User, UserId,
    Version,
};
use uuid::Uuid;

/// `PostgreSQL`-backed aggregate store.
///
/// Cheap to clone; clones share the connection pool.
///
/// # Example
///
/// ```ignore
/// use turnstile_postgres::{PostgresConfig, PostgresStore};
///
/// let store = PostgresStore::connect(&PostgresConfig::from_env()?).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
    isolation: IsolationLevel,
    statement_timeout_ms: u64,
}

impl PostgresStore {
    /// Open a connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the pool cannot connect.
    pub async fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .map_err(map_sqlx)?;

        tracing::info!(
            max_connections = config.max_connections,
            isolation = %config.isolation,
            "Connected to PostgreSQL"
        );

        Ok(Self {
            pool,
            isolation: config.isolation,
            statement_timeout_ms: config.statement_timeout_ms,
        })
    }

    /// Wrap an existing pool with `SERIALIZABLE` transactions and no
    /// statement timeout.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            isolation: IsolationLevel::Serializable,
            statement_timeout_ms: 0,
        }
    }

    /// Use a different isolation level for transactions opened from now on.
    #[must_use]
    pub const fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Isolation level applied to new transactions.
    #[must_use]
    pub const fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Apply the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }
}

impl AggregateStore for PostgresStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTransaction>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

            sqlx::query(self.isolation.set_transaction_sql())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;

            if self.statement_timeout_ms > 0 {
                let sql = format!("SET LOCAL statement_timeout = {}", self.statement_timeout_ms);
                sqlx::query(&sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
            }

            tracing::trace!(isolation = %self.isolation, "Transaction opened");
            Ok(Box::new(PgTransaction { tx }) as Box<dyn StoreTransaction>)
        })
    }
}

/// An open `PostgreSQL` transaction.
///
/// Dropping it without `commit` returns the connection to the pool and rolls
/// the transaction back.
struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    async fn fetch_by_id<T>(
        &mut self,
        sql: String,
        id: Uuid,
        decode: fn(&PgRow) -> StoreResult<T>,
    ) -> StoreResult<Option<T>> {
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?
            .map(|row| decode(&row))
            .transpose()
    }

    /// Resolve the outcome of a conditional write.
    async fn settle(
        &mut self,
        returned: Option<i64>,
        table: &'static str,
        entity: EntityRef,
        expected: Version,
    ) -> StoreResult<Version> {
        if let Some(version) = returned {
            return Ok(Version::from_i64(version));
        }

        let sql = format!("SELECT version FROM {table} WHERE id = $1");
        let actual: Option<i64> = sqlx::query_scalar(&sql)
            .bind(entity.id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

        match actual {
            Some(actual) => {
                tracing::debug!(%entity, %expected, actual, "Conditional write lost");
                Err(StoreError::VersionConflict {
                    entity,
                    expected,
                    actual: Some(Version::from_i64(actual)),
                })
            }
            None => Err(StoreError::NotFound(entity)),
        }
    }
}

impl StoreTransaction for PgTransaction {
    fn load_event(&mut self, id: EventId) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1");
            self.fetch_by_id(sql, *id.as_uuid(), rows::event).await
        })
    }

    fn lock_event(&mut self, id: EventId) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1 FOR UPDATE");
            self.fetch_by_id(sql, *id.as_uuid(), rows::event).await
        })
    }

    fn confirmed_spots(&mut self, id: EventId) -> StoreFuture<'_, u32> {
        Box::pin(async move {
            let total: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM registrations \
                 WHERE event_id = $1 AND status = $2",
            )
            .bind(id.as_uuid())
            .bind(RegistrationStatus::Confirmed.as_str())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

            u32::try_from(total).map_err(|e| codec("confirmed_spots", e))
        })
    }

    fn insert_event(&mut self, event: Event) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO events \
                 (id, title, description, location, capacity, published, created_at, updated_at, version) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(event.id.as_uuid())
            .bind(&event.title)
            .bind(&event.description)
            .bind(&event.location)
            .bind(rows::to_i32("capacity", event.capacity)?)
            .bind(event.published)
            .bind(event.created_at)
            .bind(event.updated_at)
            .bind(event.version.as_i64())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
            Ok(())
        })
    }

    fn update_event(&mut self, event: Event, expected: Version) -> StoreFuture<'_, Version> {
        Box::pin(async move {
            let returned: Option<i64> = sqlx::query_scalar(
                "UPDATE events SET title = $2, description = $3, location = $4, capacity = $5, \
                 published = $6, updated_at = $7, version = version + 1 \
                 WHERE id = $1 AND version = $8 RETURNING version",
            )
            .bind(event.id.as_uuid())
            .bind(&event.title)
            .bind(&event.description)
            .bind(&event.location)
            .bind(rows::to_i32("capacity", event.capacity)?)
            .bind(event.published)
            .bind(event.updated_at)
            .bind(expected.as_i64())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

            self.settle(returned, "events", EntityRef::event(event.id), expected)
                .await
        })
    }

    fn load_registration(
        &mut self,
        id: RegistrationId,
    ) -> StoreFuture<'_, Option<Registration>> {
        Box::pin(async move {
            let sql = format!("SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = $1");
            self.fetch_by_id(sql, *id.as_uuid(), rows::registration)
                .await
        })
    }

    fn find_registration_by_key(
        &mut self,
        event_id: EventId,
        user_id: UserId,
        key: String,
    ) -> StoreFuture<'_, Option<Registration>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {REGISTRATION_COLUMNS} FROM registrations \
                 WHERE event_id = $1 AND user_id = $2 AND idempotency_key = $3"
            );
            sqlx::query(&sql)
                .bind(event_id.as_uuid())
                .bind(user_id.as_uuid())
                .bind(&key)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(map_sqlx)?
                .map(|row| rows::registration(&row))
                .transpose()
        })
    }

    fn insert_registration(&mut self, registration: Registration) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO registrations ({REGISTRATION_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
            );
            sqlx::query(&sql)
                .bind(registration.id.as_uuid())
                .bind(registration.event_id.as_uuid())
                .bind(registration.user_id.as_uuid())
                .bind(rows::to_i32("quantity", registration.quantity)?)
                .bind(registration.status.as_str())
                .bind(&registration.idempotency_key)
                .bind(&registration.cancellation_reason)
                .bind(registration.registered_at)
                .bind(registration.confirmed_at)
                .bind(registration.cancelled_at)
                .bind(registration.updated_at)
                .bind(registration.version.as_i64())
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;

            tracing::debug!(
                registration_id = %registration.id,
                status = registration.status.as_str(),
                "Registration inserted"
            );
            Ok(())
        })
    }

    fn update_registration(
        &mut self,
        registration: Registration,
        expected: Version,
    ) -> StoreFuture<'_, Version> {
        Box::pin(async move {
            let returned: Option<i64> = sqlx::query_scalar(
                "UPDATE registrations SET status = $2, cancellation_reason = $3, \
                 confirmed_at = $4, cancelled_at = $5, updated_at = $6, version = version + 1 \
                 WHERE id = $1 AND version = $7 RETURNING version",
            )
            .bind(registration.id.as_uuid())
            .bind(registration.status.as_str())
            .bind(&registration.cancellation_reason)
            .bind(registration.confirmed_at)
            .bind(registration.cancelled_at)
            .bind(registration.updated_at)
            .bind(expected.as_i64())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

            self.settle(
                returned,
                "registrations",
                EntityRef::registration(registration.id),
                expected,
            )
            .await
        })
    }

    fn delete_registration(
        &mut self,
        id: RegistrationId,
        expected: Version,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            // payments cascade
            let returned: Option<i64> = sqlx::query_scalar(
                "DELETE FROM registrations WHERE id = $1 AND version = $2 RETURNING version",
            )
            .bind(id.as_uuid())
            .bind(expected.as_i64())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

            self.settle(returned, "registrations", EntityRef::registration(id), expected)
                .await
                .map(|_| ())
        })
    }

    fn load_payment(&mut self, id: PaymentId) -> StoreFuture<'_, Option<Payment>> {
        Box::pin(async move {
            let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
            self.fetch_by_id(sql, *id.as_uuid(), rows::payment).await
        })
    }

    fn payment_for_registration(
        &mut self,
        registration_id: RegistrationId,
    ) -> StoreFuture<'_, Option<Payment>> {
        Box::pin(async move {
            let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE registration_id = $1");
            self.fetch_by_id(sql, *registration_id.as_uuid(), rows::payment)
                .await
        })
    }

    fn insert_payment(&mut self, payment: Payment) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO payments ({PAYMENT_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            );
            sqlx::query(&sql)
                .bind(payment.id.as_uuid())
                .bind(payment.registration_id.as_uuid())
                .bind(payment.amount_minor)
                .bind(payment.currency.as_str())
                .bind(&payment.external_txn_ref)
                .bind(payment.status.as_str())
                .bind(payment.created_at)
                .bind(payment.updated_at)
                .bind(payment.version.as_i64())
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
            Ok(())
        })
    }

    fn update_payment(&mut self, payment: Payment, expected: Version) -> StoreFuture<'_, Version> {
        Box::pin(async move {
            let returned: Option<i64> = sqlx::query_scalar(
                "UPDATE payments SET status = $2, updated_at = $3, version = version + 1 \
                 WHERE id = $1 AND version = $4 RETURNING version",
            )
            .bind(payment.id.as_uuid())
            .bind(payment.status.as_str())
            .bind(payment.updated_at)
            .bind(expected.as_i64())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

            self.settle(returned, "payments", EntityRef::payment(payment.id), expected)
                .await
        })
    }

    fn load_user(&mut self, id: UserId) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move {
            let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
            self.fetch_by_id(sql, *id.as_uuid(), rows::user).await
        })
    }

    fn insert_user(&mut self, user: User) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let sql = format!("INSERT INTO users ({USER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)");
            sqlx::query(&sql)
                .bind(user.id.as_uuid())
                .bind(&user.scene_name)
                .bind(&user.email)
                .bind(user.created_at)
                .bind(user.updated_at)
                .bind(user.version.as_i64())
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
            Ok(())
        })
    }

    fn update_user(&mut self, user: User, expected: Version) -> StoreFuture<'_, Version> {
        Box::pin(async move {
            let returned: Option<i64> = sqlx::query_scalar(
                "UPDATE users SET scene_name = $2, email = $3, updated_at = $4, \
                 version = version + 1 WHERE id = $1 AND version = $5 RETURNING version",
            )
            .bind(user.id.as_uuid())
            .bind(&user.scene_name)
            .bind(&user.email)
            .bind(user.updated_at)
            .bind(expected.as_i64())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

            self.settle(returned, "users", EntityRef::user(user.id), expected)
                .await
        })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            self.tx.commit().await.map_err(map_sqlx)?;
            tracing::trace!("Transaction committed");
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            self.tx.rollback().await.map_err(map_sqlx)?;
            tracing::trace!("Transaction rolled back");
            Ok(())
        })
    }
}
