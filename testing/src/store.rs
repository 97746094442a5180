//! In-memory aggregate store for fast, deterministic testing.
//!
//! [`InMemoryStore`] implements [`AggregateStore`] with the same isolation
//! contract as the Postgres store:
//!
//! - Reads see committed state plus the transaction's own writes
//! - Every point read and predicate read is recorded in a read set
//! - Commit validates the read set under a global lock; if any row or
//!   predicate (an event's registrations, a registration's payment) changed
//!   since it was read, the commit fails with
//!   [`StoreError::SerializationFailure`] and nothing is written
//! - Writes are applied to a staged copy of the tables, so a failing write
//!   leaves committed state untouched
//!
//! Faults can be injected for the next N commits (for example a
//! [`StoreError::Deadlock`]) and a commit delay widens race windows in
//! concurrency tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use turnstile_core::{
    AggregateStore, EntityKind, EntityRef, Event, EventId, PAYMENT_REGISTRATION_CONSTRAINT,
    Payment, PaymentId, REGISTRATION_IDEMPOTENCY_CONSTRAINT, Registration, RegistrationId,
    StoreError, StoreFuture, StoreResult, StoreTransaction, User, UserId, Version,
};

const EVENTS_PKEY: &str = "events_pkey";
const REGISTRATIONS_PKEY: &str = "registrations_pkey";
const PAYMENTS_PKEY: &str = "payments_pkey";
const USERS_PKEY: &str = "users_pkey";

/// Committed state.
#[derive(Clone, Debug, Default)]
struct Tables {
    events: HashMap<EventId, Event>,
    registrations: HashMap<RegistrationId, Registration>,
    payments: HashMap<PaymentId, Payment>,
    users: HashMap<UserId, User>,
    /// Bumped whenever a registration of the event is inserted, updated or deleted
    event_generations: HashMap<EventId, u64>,
    /// Bumped whenever the registration's payment is inserted, updated or deleted
    payment_generations: HashMap<RegistrationId, u64>,
}

impl Tables {
    fn version_of(&self, entity: EntityRef) -> Option<Version> {
        match entity.kind {
            EntityKind::Event => self
                .events
                .get(&EventId::from_uuid(entity.id))
                .map(|e| e.version),
            EntityKind::Registration => self
                .registrations
                .get(&RegistrationId::from_uuid(entity.id))
                .map(|r| r.version),
            EntityKind::Payment => self
                .payments
                .get(&PaymentId::from_uuid(entity.id))
                .map(|p| p.version),
            EntityKind::User => self
                .users
                .get(&UserId::from_uuid(entity.id))
                .map(|u| u.version),
        }
    }

    fn event_generation(&self, event_id: EventId) -> u64 {
        self.event_generations.get(&event_id).copied().unwrap_or(0)
    }

    fn payment_generation(&self, registration_id: RegistrationId) -> u64 {
        self.payment_generations
            .get(&registration_id)
            .copied()
            .unwrap_or(0)
    }

    fn touch_event(&mut self, event_id: EventId) {
        *self.event_generations.entry(event_id).or_insert(0) += 1;
    }

    fn touch_payment(&mut self, registration_id: RegistrationId) {
        *self.payment_generations.entry(registration_id).or_insert(0) += 1;
    }

    fn check_version(
        entity: EntityRef,
        current: Option<Version>,
        expected: Version,
    ) -> StoreResult<()> {
        match current {
            None => Err(StoreError::NotFound(entity)),
            Some(actual) if actual != expected => Err(StoreError::VersionConflict {
                entity,
                expected,
                actual: Some(actual),
            }),
            Some(_) => Ok(()),
        }
    }

    fn apply(&mut self, write: Write) -> StoreResult<()> {
        match write {
            Write::InsertEvent(event) => {
                if self.events.contains_key(&event.id) {
                    return Err(unique(EVENTS_PKEY));
                }
                self.events.insert(event.id, event);
            }
            Write::UpdateEvent(event, expected) => {
                let entity = EntityRef::event(event.id);
                Self::check_version(entity, self.version_of(entity), expected)?;
                self.events.insert(event.id, event);
            }
            Write::InsertRegistration(registration) => {
                if self.registrations.contains_key(&registration.id) {
                    return Err(unique(REGISTRATIONS_PKEY));
                }
                if !self.events.contains_key(&registration.event_id) {
                    return Err(StoreError::NotFound(EntityRef::event(registration.event_id)));
                }
                if registration.idempotency_key.is_some()
                    && self.registrations.values().any(|r| same_key(r, &registration))
                {
                    return Err(unique(REGISTRATION_IDEMPOTENCY_CONSTRAINT));
                }
                self.touch_event(registration.event_id);
                self.registrations.insert(registration.id, registration);
            }
            Write::UpdateRegistration(registration, expected) => {
                let entity = EntityRef::registration(registration.id);
                Self::check_version(entity, self.version_of(entity), expected)?;
                self.touch_event(registration.event_id);
                self.registrations.insert(registration.id, registration);
            }
            Write::DeleteRegistration(id, expected) => {
                let entity = EntityRef::registration(id);
                Self::check_version(entity, self.version_of(entity), expected)?;
                if let Some(registration) = self.registrations.remove(&id) {
                    self.touch_event(registration.event_id);
                }
                let before = self.payments.len();
                self.payments.retain(|_, p| p.registration_id != id);
                if self.payments.len() != before {
                    self.touch_payment(id);
                }
            }
            Write::InsertPayment(payment) => {
                if self.payments.contains_key(&payment.id) {
                    return Err(unique(PAYMENTS_PKEY));
                }
                if !self.registrations.contains_key(&payment.registration_id) {
                    return Err(StoreError::NotFound(EntityRef::registration(
                        payment.registration_id,
                    )));
                }
                if self
                    .payments
                    .values()
                    .any(|p| p.registration_id == payment.registration_id)
                {
                    return Err(unique(PAYMENT_REGISTRATION_CONSTRAINT));
                }
                self.touch_payment(payment.registration_id);
                self.payments.insert(payment.id, payment);
            }
            Write::UpdatePayment(payment, expected) => {
                let entity = EntityRef::payment(payment.id);
                Self::check_version(entity, self.version_of(entity), expected)?;
                self.touch_payment(payment.registration_id);
                self.payments.insert(payment.id, payment);
            }
            Write::InsertUser(user) => {
                if self.users.contains_key(&user.id) {
                    return Err(unique(USERS_PKEY));
                }
                self.users.insert(user.id, user);
            }
            Write::UpdateUser(user, expected) => {
                let entity = EntityRef::user(user.id);
                Self::check_version(entity, self.version_of(entity), expected)?;
                self.users.insert(user.id, user);
            }
        }
        Ok(())
    }
}

fn unique(constraint: &str) -> StoreError {
    StoreError::UniqueViolation {
        constraint: constraint.to_string(),
    }
}

fn same_key(existing: &Registration, candidate: &Registration) -> bool {
    existing.event_id == candidate.event_id
        && existing.user_id == candidate.user_id
        && existing.idempotency_key == candidate.idempotency_key
}

/// A buffered write, replayed against the tables at commit.
#[derive(Debug)]
enum Write {
    InsertEvent(Event),
    UpdateEvent(Event, Version),
    InsertRegistration(Registration),
    UpdateRegistration(Registration, Version),
    DeleteRegistration(RegistrationId, Version),
    InsertPayment(Payment),
    UpdatePayment(Payment, Version),
    InsertUser(User),
    UpdateUser(User, Version),
}

/// Everything a transaction observed, checked again at commit.
#[derive(Debug, Default)]
struct ReadSet {
    rows: HashMap<EntityRef, Option<Version>>,
    event_registrations: HashMap<EventId, u64>,
    registration_payments: HashMap<RegistrationId, u64>,
}

impl ReadSet {
    fn validate(&self, tables: &Tables) -> StoreResult<()> {
        for (entity, seen) in &self.rows {
            if tables.version_of(*entity) != *seen {
                return Err(StoreError::SerializationFailure(format!(
                    "{entity} changed after it was read"
                )));
            }
        }
        for (event_id, generation) in &self.event_registrations {
            if tables.event_generation(*event_id) != *generation {
                return Err(StoreError::SerializationFailure(format!(
                    "registrations of event {event_id} changed after they were read"
                )));
            }
        }
        for (registration_id, generation) in &self.registration_payments {
            if tables.payment_generation(*registration_id) != *generation {
                return Err(StoreError::SerializationFailure(format!(
                    "payment of registration {registration_id} changed after it was read"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    faults: Mutex<VecDeque<StoreError>>,
    commit_delay: Mutex<Option<Duration>>,
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, reads: &ReadSet, writes: Vec<Write>) -> StoreResult<()> {
        let fault = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(fault) = fault {
            self.aborted.fetch_add(1, Ordering::SeqCst);
            return Err(fault);
        }

        if writes.is_empty() {
            self.committed.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let mut tables = self.tables();
        let staged = reads.validate(&tables).and_then(|()| {
            let mut staged = tables.clone();
            for write in writes {
                staged.apply(write)?;
            }
            Ok(staged)
        });

        match staged {
            Ok(staged) => {
                *tables = staged;
                self.committed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(error) => {
                self.aborted.fetch_add(1, Ordering::SeqCst);
                Err(error)
            }
        }
    }
}

/// In-memory [`AggregateStore`] for tests.
///
/// Cloning is cheap and every clone shares the same state.
///
/// # Example
///
/// ```
/// use turnstile_testing::InMemoryStore;
/// use turnstile_testing::fixtures::published_event;
///
/// let store = InMemoryStore::new();
/// let event = store.seed_event(published_event(10));
/// assert_eq!(store.confirmed_spots(event.id), 0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Fail the next `count` commits with `error`, writing nothing.
    pub fn fail_next_commits(&self, count: usize, error: &StoreError) {
        let mut faults = self
            .shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        faults.extend(std::iter::repeat_n(error.clone(), count));
    }

    /// Sleep this long at the start of every commit, before validation.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        *self
            .shared
            .commit_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    // ------------------------------------------------------------------
    // Seeding (bypasses transactions)
    // ------------------------------------------------------------------

    /// Store an event directly as committed state.
    pub fn seed_event(&self, event: Event) -> Event {
        self.shared.tables().events.insert(event.id, event.clone());
        event
    }

    /// Store a user directly as committed state.
    pub fn seed_user(&self, user: User) -> User {
        self.shared.tables().users.insert(user.id, user.clone());
        user
    }

    /// Store a registration directly as committed state.
    pub fn seed_registration(&self, registration: Registration) -> Registration {
        let mut tables = self.shared.tables();
        tables.touch_event(registration.event_id);
        tables
            .registrations
            .insert(registration.id, registration.clone());
        registration
    }

    /// Store a payment directly as committed state.
    pub fn seed_payment(&self, payment: Payment) -> Payment {
        let mut tables = self.shared.tables();
        tables.touch_payment(payment.registration_id);
        tables.payments.insert(payment.id, payment.clone());
        payment
    }

    // ------------------------------------------------------------------
    // Inspection of committed state
    // ------------------------------------------------------------------

    /// Committed event.
    #[must_use]
    pub fn event(&self, id: EventId) -> Option<Event> {
        self.shared.tables().events.get(&id).cloned()
    }

    /// Committed registration.
    #[must_use]
    pub fn registration(&self, id: RegistrationId) -> Option<Registration> {
        self.shared.tables().registrations.get(&id).cloned()
    }

    /// Committed payment.
    #[must_use]
    pub fn payment(&self, id: PaymentId) -> Option<Payment> {
        self.shared.tables().payments.get(&id).cloned()
    }

    /// Committed user.
    #[must_use]
    pub fn user(&self, id: UserId) -> Option<User> {
        self.shared.tables().users.get(&id).cloned()
    }

    /// Committed registrations of an event.
    #[must_use]
    pub fn registrations_for_event(&self, event_id: EventId) -> Vec<Registration> {
        self.shared
            .tables()
            .registrations
            .values()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect()
    }

    /// Committed payments referencing a registration.
    #[must_use]
    pub fn payments_for_registration(&self, registration_id: RegistrationId) -> Vec<Payment> {
        self.shared
            .tables()
            .payments
            .values()
            .filter(|p| p.registration_id == registration_id)
            .cloned()
            .collect()
    }

    /// Committed confirmed headcount of an event.
    #[must_use]
    pub fn confirmed_spots(&self, event_id: EventId) -> u32 {
        self.shared
            .tables()
            .registrations
            .values()
            .filter(|r| r.event_id == event_id)
            .map(Registration::confirmed_spots)
            .sum()
    }

    /// Number of committed registrations.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.shared.tables().registrations.len()
    }

    /// Number of committed payments.
    #[must_use]
    pub fn payment_count(&self) -> usize {
        self.shared.tables().payments.len()
    }

    /// Transactions opened so far.
    #[must_use]
    pub fn begun_transactions(&self) -> u64 {
        self.shared.begun.load(Ordering::SeqCst)
    }

    /// Transactions that committed.
    #[must_use]
    pub fn committed_transactions(&self) -> u64 {
        self.shared.committed.load(Ordering::SeqCst)
    }

    /// Transactions that failed to commit, rolled back, or were dropped.
    #[must_use]
    pub fn aborted_transactions(&self) -> u64 {
        self.shared.aborted.load(Ordering::SeqCst)
    }
}

impl AggregateStore for InMemoryStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTransaction>> {
        self.shared.begun.fetch_add(1, Ordering::SeqCst);
        let transaction: Box<dyn StoreTransaction> = Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            overlay: Overlay::default(),
            reads: ReadSet::default(),
            writes: Vec::new(),
            finished: false,
        });
        Box::pin(async move { Ok(transaction) })
    }
}

/// This transaction's own writes, visible to its reads.
#[derive(Debug, Default)]
struct Overlay {
    events: HashMap<EventId, Event>,
    registrations: HashMap<RegistrationId, Option<Registration>>,
    payments: HashMap<PaymentId, Option<Payment>>,
    users: HashMap<UserId, User>,
}

/// Transaction handle returned by [`InMemoryStore::begin`].
#[derive(Debug)]
struct InMemoryTransaction {
    shared: Arc<Shared>,
    overlay: Overlay,
    reads: ReadSet,
    writes: Vec<Write>,
    finished: bool,
}

impl InMemoryTransaction {
    fn observe(&mut self, entity: EntityRef, version: Option<Version>) {
        self.reads.rows.entry(entity).or_insert(version);
    }

    fn read_event(&mut self, id: EventId) -> Option<Event> {
        if let Some(event) = self.overlay.events.get(&id) {
            return Some(event.clone());
        }
        let event = self.shared.tables().events.get(&id).cloned();
        self.observe(EntityRef::event(id), event.as_ref().map(|e| e.version));
        event
    }

    fn read_user(&mut self, id: UserId) -> Option<User> {
        if let Some(user) = self.overlay.users.get(&id) {
            return Some(user.clone());
        }
        let user = self.shared.tables().users.get(&id).cloned();
        self.observe(EntityRef::user(id), user.as_ref().map(|u| u.version));
        user
    }

    fn read_registration(&mut self, id: RegistrationId) -> Option<Registration> {
        if let Some(registration) = self.overlay.registrations.get(&id) {
            return registration.clone();
        }
        let registration = self.shared.tables().registrations.get(&id).cloned();
        self.observe(
            EntityRef::registration(id),
            registration.as_ref().map(|r| r.version),
        );
        registration
    }

    fn read_payment(&mut self, id: PaymentId) -> Option<Payment> {
        if let Some(payment) = self.overlay.payments.get(&id) {
            return payment.clone();
        }
        let payment = self.shared.tables().payments.get(&id).cloned();
        self.observe(EntityRef::payment(id), payment.as_ref().map(|p| p.version));
        payment
    }

    /// Predicate read: every registration of `event_id` visible to this transaction.
    fn read_event_registrations(&mut self, event_id: EventId) -> Vec<Registration> {
        let (committed, generation) = {
            let tables = self.shared.tables();
            let committed: Vec<Registration> = tables
                .registrations
                .values()
                .filter(|r| r.event_id == event_id)
                .cloned()
                .collect();
            (committed, tables.event_generation(event_id))
        };
        self.reads
            .event_registrations
            .entry(event_id)
            .or_insert(generation);

        let mut visible: Vec<Registration> = committed
            .into_iter()
            .filter(|r| !self.overlay.registrations.contains_key(&r.id))
            .collect();
        visible.extend(
            self.overlay
                .registrations
                .values()
                .flatten()
                .filter(|r| r.event_id == event_id)
                .cloned(),
        );
        visible
    }

    /// Predicate read: the payment of `registration_id` visible to this transaction.
    fn read_registration_payment(&mut self, registration_id: RegistrationId) -> Option<Payment> {
        let (committed, generation) = {
            let tables = self.shared.tables();
            let committed = tables
                .payments
                .values()
                .find(|p| p.registration_id == registration_id)
                .cloned();
            (committed, tables.payment_generation(registration_id))
        };
        self.reads
            .registration_payments
            .entry(registration_id)
            .or_insert(generation);

        if let Some(payment) = self
            .overlay
            .payments
            .values()
            .flatten()
            .find(|p| p.registration_id == registration_id)
        {
            return Some(payment.clone());
        }
        committed.filter(|p| !self.overlay.payments.contains_key(&p.id))
    }

    fn conditional(
        entity: EntityRef,
        current: Option<Version>,
        expected: Version,
    ) -> StoreResult<Version> {
        Tables::check_version(entity, current, expected)?;
        Ok(expected.next())
    }
}

fn ready<'a, T: Send + 'a>(result: StoreResult<T>) -> StoreFuture<'a, T> {
    Box::pin(async move { result })
}

impl StoreTransaction for InMemoryTransaction {
    fn load_event(&mut self, id: EventId) -> StoreFuture<'_, Option<Event>> {
        ready(Ok(self.read_event(id)))
    }

    // No row locks here: commit-time validation of the event read gives the
    // same outcome, a concurrent event write aborts this transaction.
    fn lock_event(&mut self, id: EventId) -> StoreFuture<'_, Option<Event>> {
        ready(Ok(self.read_event(id)))
    }

    fn confirmed_spots(&mut self, id: EventId) -> StoreFuture<'_, u32> {
        let spots = self
            .read_event_registrations(id)
            .iter()
            .map(Registration::confirmed_spots)
            .sum();
        ready(Ok(spots))
    }

    fn insert_event(&mut self, event: Event) -> StoreFuture<'_, ()> {
        let exists = self.overlay.events.contains_key(&event.id)
            || self.shared.tables().events.contains_key(&event.id);
        if exists {
            return ready(Err(unique(EVENTS_PKEY)));
        }
        self.overlay.events.insert(event.id, event.clone());
        self.writes.push(Write::InsertEvent(event));
        ready(Ok(()))
    }

    fn update_event(&mut self, mut event: Event, expected: Version) -> StoreFuture<'_, Version> {
        let current = self.read_event(event.id).map(|e| e.version);
        let result = Self::conditional(EntityRef::event(event.id), current, expected).map(|next| {
            event.version = next;
            self.overlay.events.insert(event.id, event.clone());
            self.writes.push(Write::UpdateEvent(event, expected));
            next
        });
        ready(result)
    }

    fn load_registration(
        &mut self,
        id: RegistrationId,
    ) -> StoreFuture<'_, Option<Registration>> {
        ready(Ok(self.read_registration(id)))
    }

    fn find_registration_by_key(
        &mut self,
        event_id: EventId,
        user_id: UserId,
        key: String,
    ) -> StoreFuture<'_, Option<Registration>> {
        let found = self
            .read_event_registrations(event_id)
            .into_iter()
            .find(|r| r.user_id == user_id && r.idempotency_key.as_deref() == Some(key.as_str()));
        ready(Ok(found))
    }

    fn insert_registration(&mut self, registration: Registration) -> StoreFuture<'_, ()> {
        if self.read_event(registration.event_id).is_none() {
            return ready(Err(StoreError::NotFound(EntityRef::event(
                registration.event_id,
            ))));
        }
        let exists = self.overlay.registrations.contains_key(&registration.id)
            || self
                .shared
                .tables()
                .registrations
                .contains_key(&registration.id);
        if exists {
            return ready(Err(unique(REGISTRATIONS_PKEY)));
        }
        if registration.idempotency_key.is_some()
            && self
                .read_event_registrations(registration.event_id)
                .iter()
                .any(|r| same_key(r, &registration))
        {
            return ready(Err(unique(REGISTRATION_IDEMPOTENCY_CONSTRAINT)));
        }
        self.overlay
            .registrations
            .insert(registration.id, Some(registration.clone()));
        self.writes.push(Write::InsertRegistration(registration));
        ready(Ok(()))
    }

    fn update_registration(
        &mut self,
        mut registration: Registration,
        expected: Version,
    ) -> StoreFuture<'_, Version> {
        let current = self.read_registration(registration.id).map(|r| r.version);
        let result = Self::conditional(
            EntityRef::registration(registration.id),
            current,
            expected,
        )
        .map(|next| {
            registration.version = next;
            self.overlay
                .registrations
                .insert(registration.id, Some(registration.clone()));
            self.writes
                .push(Write::UpdateRegistration(registration, expected));
            next
        });
        ready(result)
    }

    fn delete_registration(&mut self, id: RegistrationId, expected: Version) -> StoreFuture<'_, ()> {
        let current = self.read_registration(id).map(|r| r.version);
        if let Err(error) = Self::conditional(EntityRef::registration(id), current, expected) {
            return ready(Err(error));
        }
        if let Some(payment) = self.read_registration_payment(id) {
            self.overlay.payments.insert(payment.id, None);
        }
        self.overlay.registrations.insert(id, None);
        self.writes.push(Write::DeleteRegistration(id, expected));
        ready(Ok(()))
    }

    fn load_payment(&mut self, id: PaymentId) -> StoreFuture<'_, Option<Payment>> {
        ready(Ok(self.read_payment(id)))
    }

    fn payment_for_registration(
        &mut self,
        registration_id: RegistrationId,
    ) -> StoreFuture<'_, Option<Payment>> {
        ready(Ok(self.read_registration_payment(registration_id)))
    }

    fn insert_payment(&mut self, payment: Payment) -> StoreFuture<'_, ()> {
        if self.read_registration(payment.registration_id).is_none() {
            return ready(Err(StoreError::NotFound(EntityRef::registration(
                payment.registration_id,
            ))));
        }
        let exists = self.overlay.payments.contains_key(&payment.id)
            || self.shared.tables().payments.contains_key(&payment.id);
        if exists {
            return ready(Err(unique(PAYMENTS_PKEY)));
        }
        if self
            .read_registration_payment(payment.registration_id)
            .is_some()
        {
            return ready(Err(unique(PAYMENT_REGISTRATION_CONSTRAINT)));
        }
        self.overlay
            .payments
            .insert(payment.id, Some(payment.clone()));
        self.writes.push(Write::InsertPayment(payment));
        ready(Ok(()))
    }

    fn update_payment(
        &mut self,
        mut payment: Payment,
        expected: Version,
    ) -> StoreFuture<'_, Version> {
        let current = self.read_payment(payment.id).map(|p| p.version);
        let result =
            Self::conditional(EntityRef::payment(payment.id), current, expected).map(|next| {
                payment.version = next;
                self.overlay
                    .payments
                    .insert(payment.id, Some(payment.clone()));
                self.writes.push(Write::UpdatePayment(payment, expected));
                next
            });
        ready(result)
    }

    fn load_user(&mut self, id: UserId) -> StoreFuture<'_, Option<User>> {
        ready(Ok(self.read_user(id)))
    }

    fn insert_user(&mut self, user: User) -> StoreFuture<'_, ()> {
        let exists = self.overlay.users.contains_key(&user.id)
            || self.shared.tables().users.contains_key(&user.id);
        if exists {
            return ready(Err(unique(USERS_PKEY)));
        }
        self.overlay.users.insert(user.id, user.clone());
        self.writes.push(Write::InsertUser(user));
        ready(Ok(()))
    }

    fn update_user(&mut self, mut user: User, expected: Version) -> StoreFuture<'_, Version> {
        let current = self.read_user(user.id).map(|u| u.version);
        let result = Self::conditional(EntityRef::user(user.id), current, expected).map(|next| {
            user.version = next;
            self.overlay.users.insert(user.id, user.clone());
            self.writes.push(Write::UpdateUser(user, expected));
            next
        });
        ready(result)
    }

    fn commit(mut self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let delay = *self
                .shared
                .commit_delay
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                // Dropping the future here still counts as an abort.
                tokio::time::sleep(delay).await;
            }
            self.finished = true;
            let writes = std::mem::take(&mut self.writes);
            self.shared.commit(&self.reads, writes)
        })
    }

    fn rollback(mut self: Box<Self>) -> StoreFuture<'static, ()> {
        self.finished = true;
        self.shared.aborted.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::fixtures::{payment_details, pending_registration, published_event};
    use crate::mocks::test_clock;
    use turnstile_core::environment::Clock;
    use turnstile_core::RegistrationStatus;

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = InMemoryStore::new();
        let event = published_event(5);

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(event.clone()).await.unwrap();
        assert!(tx.load_event(event.id).await.unwrap().is_some());
        assert!(store.event(event.id).is_none());

        tx.commit().await.unwrap();
        assert_eq!(store.event(event.id), Some(event));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        let event = published_event(5);
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_event(event.clone()).await.unwrap();
        }
        assert!(store.event(event.id).is_none());
        assert_eq!(store.aborted_transactions(), 1);
    }

    #[tokio::test]
    async fn conditional_update_checks_version() {
        let store = InMemoryStore::new();
        let mut event = store.seed_event(published_event(5));

        let mut tx = store.begin().await.unwrap();
        event.title = "Renamed".to_string();
        let stale = tx.update_event(event.clone(), Version::new(7)).await;
        assert!(matches!(
            stale,
            Err(StoreError::VersionConflict { actual: Some(v), .. }) if v == Version::INITIAL
        ));
        let next = tx.update_event(event.clone(), Version::INITIAL).await.unwrap();
        assert_eq!(next, Version::new(2));
        tx.commit().await.unwrap();

        assert_eq!(store.event(event.id).unwrap().version, Version::new(2));
    }

    #[tokio::test]
    async fn concurrent_headcount_readers_cannot_both_commit() {
        let store = InMemoryStore::new();
        let event = store.seed_event(published_event(1));
        let now = test_clock().now();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        assert_eq!(first.confirmed_spots(event.id).await.unwrap(), 0);
        assert_eq!(second.confirmed_spots(event.id).await.unwrap(), 0);

        for tx in [&mut first, &mut second] {
            let registration = Registration::new(
                event.id,
                UserId::new(),
                1,
                RegistrationStatus::Confirmed,
                None,
                now,
            );
            tx.insert_registration(registration).await.unwrap();
        }

        first.commit().await.unwrap();
        let second = second.commit().await;
        assert!(matches!(second, Err(StoreError::SerializationFailure(_))));
        assert_eq!(store.confirmed_spots(event.id), 1);
    }

    #[tokio::test]
    async fn second_payment_for_registration_is_rejected() {
        let store = InMemoryStore::new();
        let event = store.seed_event(published_event(5));
        let registration = store.seed_registration(pending_registration(event.id));
        let now = test_clock().now();

        let mut tx = store.begin().await.unwrap();
        let first = Payment::new(registration.id, &payment_details(), now).unwrap();
        let second = Payment::new(registration.id, &payment_details(), now).unwrap();
        tx.insert_payment(first).await.unwrap();
        let err = tx.insert_payment(second).await.unwrap_err();
        assert_eq!(err, unique(PAYMENT_REGISTRATION_CONSTRAINT));
    }

    #[tokio::test]
    async fn deleting_registration_cascades_to_payment() {
        let store = InMemoryStore::new();
        let event = store.seed_event(published_event(5));
        let registration = store.seed_registration(pending_registration(event.id));
        let payment = store.seed_payment(
            Payment::new(registration.id, &payment_details(), test_clock().now()).unwrap(),
        );

        let mut tx = store.begin().await.unwrap();
        tx.delete_registration(registration.id, registration.version)
            .await
            .unwrap();
        assert!(
            tx.payment_for_registration(registration.id)
                .await
                .unwrap()
                .is_none()
        );
        tx.commit().await.unwrap();

        assert!(store.registration(registration.id).is_none());
        assert!(store.payment(payment.id).is_none());
    }

    #[tokio::test]
    async fn injected_faults_abort_commits() {
        let store = InMemoryStore::new();
        store.fail_next_commits(1, &StoreError::Deadlock("injected".into()));

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(published_event(5)).await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Deadlock(_))));

        let mut tx = store.begin().await.unwrap();
        let event = published_event(5);
        tx.insert_event(event.clone()).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.event(event.id).is_some());
        assert_eq!(store.committed_transactions(), 1);
    }

    #[tokio::test]
    async fn idempotency_key_is_unique_per_event_and_user() {
        let store = InMemoryStore::new();
        let event = store.seed_event(published_event(5));
        let user = UserId::new();
        let now = test_clock().now();
        let keyed = |user| {
            Registration::new(
                event.id,
                user,
                1,
                RegistrationStatus::Confirmed,
                Some("k-1".to_string()),
                now,
            )
        };

        let mut tx = store.begin().await.unwrap();
        tx.insert_registration(keyed(user)).await.unwrap();
        assert_eq!(
            tx.insert_registration(keyed(user)).await.unwrap_err(),
            unique(REGISTRATION_IDEMPOTENCY_CONSTRAINT)
        );
        tx.insert_registration(keyed(UserId::new())).await.unwrap();
        let found = tx
            .find_registration_by_key(event.id, user, "k-1".to_string())
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
