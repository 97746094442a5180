//! Transaction management.
//!
//! [`TransactionManager::run_atomic`] groups every write performed by a
//! closure into one store transaction: all of them commit or none do.
//!
//! # Rollback paths
//!
//! | Cause | Mechanism |
//! |---|---|
//! | Closure returns `Err` | explicit `rollback()` before the error is returned |
//! | Commit fails | the store discards the transaction |
//! | Closure panics | the [`UnitOfWork`] is dropped during unwinding |
//! | Deadline or cancellation | the future is dropped, dropping the [`UnitOfWork`] |
//!
//! The last two rely on the store contract that a dropped transaction handle
//! rolls back.
//!
//! # Nesting
//!
//! Code that already holds a `&mut UnitOfWork` calls
//! [`UnitOfWork::run_atomic`]; the nested closure runs inside the enclosing
//! transaction and only the outermost `run_atomic` commits.
//!
//! # Closure shape
//!
//! Closures receive `&mut UnitOfWork` and return a boxed future borrowing it:
//!
//! ```rust,ignore
//! manager
//!     .run_atomic("create_event", move |uow| {
//!         Box::pin(async move {
//!             uow.store().insert_event(event).await?;
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! ```
//!
//! Captured values are moved in; the components of this crate are `Copy` so
//! they can be captured the same way.

use crate::metrics::TransactionMetrics;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use turnstile_core::environment::Clock;
use turnstile_core::{AggregateStore, RegistrationError, StoreTransaction};

/// An open transaction plus the context operations need inside it.
pub struct UnitOfWork {
    transaction: Box<dyn StoreTransaction>,
    clock: Arc<dyn Clock>,
    depth: u32,
}

impl UnitOfWork {
    /// Wrap an open transaction.
    #[must_use]
    pub fn new(transaction: Box<dyn StoreTransaction>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transaction,
            clock,
            depth: 0,
        }
    }

    /// The underlying store transaction.
    pub fn store(&mut self) -> &mut dyn StoreTransaction {
        self.transaction.as_mut()
    }

    /// Current time from the injected clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// How many nested `run_atomic` calls are currently open.
    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Run `f` inside this unit of work.
    ///
    /// The enclosing transaction is reused; nothing is committed here. An
    /// error from `f` propagates to the outermost `run_atomic`, which rolls
    /// everything back.
    ///
    /// # Errors
    ///
    /// Whatever `f` returns.
    pub async fn run_atomic<T, F>(&mut self, f: F) -> Result<T, RegistrationError>
    where
        F: for<'t> FnOnce(&'t mut UnitOfWork) -> BoxFuture<'t, Result<T, RegistrationError>>,
    {
        self.depth += 1;
        tracing::trace!(depth = self.depth, "Joining enclosing transaction");
        let result = f(self).await;
        self.depth -= 1;
        result
    }

    async fn commit(self) -> Result<(), RegistrationError> {
        self.transaction.commit().await.map_err(Into::into)
    }

    async fn rollback(self) {
        if let Err(error) = self.transaction.rollback().await {
            tracing::error!(error = %error, "Rollback failed");
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// Opens transactions on a store and runs closures atomically.
pub struct TransactionManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for TransactionManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: AggregateStore> TransactionManager<S> {
    /// Create a manager over `store` using `clock` for timestamps.
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The managed store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `f` in a new transaction; commit on `Ok`, roll back otherwise.
    ///
    /// # Errors
    ///
    /// - Whatever `f` returns (after rollback)
    /// - `Conflict` / `Deadlock` when the commit is rejected by the store
    /// - `Store` when the transaction cannot be opened
    pub async fn run_atomic<T, F>(
        &self,
        operation: &'static str,
        f: F,
    ) -> Result<T, RegistrationError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut UnitOfWork) -> BoxFuture<'t, Result<T, RegistrationError>>
            + Send,
    {
        let started = Instant::now();
        let transaction = self.store.begin().await?;
        let mut uow = UnitOfWork::new(transaction, Arc::clone(&self.clock));
        tracing::trace!(operation, "Transaction started");

        match f(&mut uow).await {
            Ok(value) => match uow.commit().await {
                Ok(()) => {
                    TransactionMetrics::record_commit(operation, started.elapsed());
                    tracing::debug!(operation, "Transaction committed");
                    Ok(value)
                }
                Err(error) => {
                    TransactionMetrics::record_rollback(operation, started.elapsed());
                    tracing::debug!(operation, error = %error, "Commit rejected, rolled back");
                    Err(error)
                }
            },
            Err(error) => {
                uow.rollback().await;
                TransactionMetrics::record_rollback(operation, started.elapsed());
                tracing::debug!(operation, error = %error, "Transaction rolled back");
                Err(error)
            }
        }
    }
}

/// Deadline and cancellation for one boundary operation.
///
/// When no timeout is set the service's configured default applies.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl OperationContext {
    /// Context with the default deadline and no cancellation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// The explicit deadline, if any.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The cancellation token, if any.
    #[must_use]
    pub const fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }
}

/// Drive `future` until it completes, `timeout` passes, or `cancellation` fires.
///
/// On timeout or cancellation the future is dropped, which rolls back any
/// open transaction it holds. A future that has already completed wins over
/// a cancellation that fires in the same poll.
///
/// # Errors
///
/// - [`RegistrationError::Timeout`] if the deadline passed or the token fired
/// - Whatever `future` returns
pub async fn run_with_deadline<T, Fut>(
    operation: &'static str,
    timeout: Duration,
    cancellation: Option<&CancellationToken>,
    future: Fut,
) -> Result<T, RegistrationError>
where
    Fut: Future<Output = Result<T, RegistrationError>>,
{
    let timed_out = || {
        TransactionMetrics::record_timeout(operation);
        RegistrationError::Timeout { operation }
    };

    if cancellation.is_some_and(CancellationToken::is_cancelled) {
        tracing::warn!(operation, "Operation cancelled before it started");
        return Err(timed_out());
    }

    let bounded = tokio::time::timeout(timeout, future);
    let outcome = match cancellation {
        Some(token) => {
            tokio::select! {
                biased;
                outcome = bounded => Some(outcome),
                () = token.cancelled() => None,
            }
        }
        None => Some(bounded.await),
    };

    match outcome {
        Some(Ok(result)) => result,
        Some(Err(_elapsed)) => {
            tracing::warn!(
                operation,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Operation deadline passed, rolled back"
            );
            Err(timed_out())
        }
        None => {
            tracing::warn!(operation, "Operation cancelled, rolled back");
            Err(timed_out())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/panic
mod tests {
    use super::*;
    use turnstile_core::{EntityRef, EventId};
    use turnstile_testing::fixtures::published_event;
    use turnstile_testing::{InMemoryStore, test_clock};

    fn manager(store: &InMemoryStore) -> TransactionManager<InMemoryStore> {
        TransactionManager::new(Arc::new(store.clone()), Arc::new(test_clock()))
    }

    #[tokio::test]
    async fn commits_on_success() {
        let store = InMemoryStore::new();
        let event = published_event(3);
        let id = event.id;

        manager(&store)
            .run_atomic("test", move |uow| {
                Box::pin(async move {
                    uow.store().insert_event(event).await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert!(store.event(id).is_some());
        assert_eq!(store.committed_transactions(), 1);
    }

    #[tokio::test]
    async fn rolls_back_on_error() {
        let store = InMemoryStore::new();
        let event = published_event(3);
        let id = event.id;

        let result: Result<(), _> = manager(&store)
            .run_atomic("test", move |uow| {
                Box::pin(async move {
                    uow.store().insert_event(event).await?;
                    Err(RegistrationError::Validation("second write failed".into()))
                })
            })
            .await;

        assert!(matches!(result, Err(RegistrationError::Validation(_))));
        assert!(store.event(id).is_none());
        assert_eq!(store.aborted_transactions(), 1);
    }

    #[tokio::test]
    async fn nested_run_atomic_commits_once() {
        let store = InMemoryStore::new();
        let first = published_event(3);
        let second = published_event(4);
        let (first_id, second_id) = (first.id, second.id);

        let depth = manager(&store)
            .run_atomic("test", move |uow| {
                Box::pin(async move {
                    uow.store().insert_event(first).await?;
                    let inner_depth = uow
                        .run_atomic(move |uow| {
                            Box::pin(async move {
                                uow.store().insert_event(second).await?;
                                Ok(uow.depth())
                            })
                        })
                        .await?;
                    assert_eq!(uow.depth(), 0);
                    Ok(inner_depth)
                })
            })
            .await
            .unwrap();

        assert_eq!(depth, 1);
        assert!(store.event(first_id).is_some());
        assert!(store.event(second_id).is_some());
        assert_eq!(store.committed_transactions(), 1);
        assert_eq!(store.begun_transactions(), 1);
    }

    #[tokio::test]
    async fn nested_failure_rolls_back_outer_writes() {
        let store = InMemoryStore::new();
        let event = published_event(3);
        let id = event.id;

        let result: Result<(), _> = manager(&store)
            .run_atomic("test", move |uow| {
                Box::pin(async move {
                    uow.store().insert_event(event).await?;
                    uow.run_atomic(|_uow| {
                        Box::pin(async { Err(RegistrationError::NotFound(EntityRef::event(EventId::new()))) })
                    })
                    .await
                })
            })
            .await;

        assert!(matches!(result, Err(RegistrationError::NotFound(_))));
        assert!(store.event(id).is_none());
    }

    #[tokio::test]
    async fn panic_inside_closure_leaves_no_rows() {
        let store = InMemoryStore::new();
        let event = published_event(3);
        let id = event.id;
        let manager = manager(&store);

        let handle = tokio::spawn(async move {
            manager
                .run_atomic("test", move |uow| {
                    Box::pin(async move {
                        uow.store().insert_event(event).await?;
                        panic!("boom");
                    })
                })
                .await
        });

        let join: Result<Result<(), RegistrationError>, _> = handle.await;
        assert!(join.unwrap_err().is_panic());
        assert!(store.event(id).is_none());
        assert_eq!(store.aborted_transactions(), 1);
    }

    #[tokio::test]
    async fn commit_rejection_surfaces_as_retryable() {
        let store = InMemoryStore::new();
        store.fail_next_commits(1, &turnstile_core::StoreError::Deadlock("injected".into()));
        let event = published_event(3);

        let result = manager(&store)
            .run_atomic("test", move |uow| {
                Box::pin(async move {
                    uow.store().insert_event(event).await?;
                    Ok(())
                })
            })
            .await;

        assert!(matches!(result, Err(RegistrationError::Deadlock(_))));
    }

    #[tokio::test]
    async fn deadline_drops_future_and_reports_timeout() {
        let result: Result<(), _> = run_with_deadline(
            "slow",
            Duration::from_millis(10),
            None,
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        assert_eq!(result, Err(RegistrationError::Timeout { operation: "slow" }));
    }

    #[tokio::test]
    async fn cancellation_token_aborts() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = run_with_deadline(
            "cancelled",
            Duration::from_secs(5),
            Some(&token),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(RegistrationError::Timeout { .. })));
    }

    #[tokio::test]
    async fn completed_future_wins() {
        let token = CancellationToken::new();
        let result = run_with_deadline("fast", Duration::from_secs(1), Some(&token), async {
            Ok(5)
        })
        .await;
        assert_eq!(result, Ok(5));

        token.cancel();
        let result = run_with_deadline("late", Duration::from_secs(1), Some(&token), async {
            Ok(5)
        })
        .await;
        assert!(matches!(result, Err(RegistrationError::Timeout { .. })));
    }
}
