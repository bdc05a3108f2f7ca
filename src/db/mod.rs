//! Operation record store, serial lock row and registered workers.
//!
//! [`SerialStore`] is the only path to shared mutable state. Every write is a
//! single-row conditional update, so correctness rests on the database's
//! atomicity rather than on in-process locking. Two sqlx backends implement
//! it: [`postgres::PgStore`] for deployments and [`sqlite::SqliteStore`] for
//! embedded use and the test suite.

pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{
    NewOperation, Operation, OperationId, RegisteredWorker, SerialLockState, Status,
};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Persistence contract for the serial queue.
///
/// The store trusts its caller to serialize claims: `peek_and_claim` is only
/// race-free while the serial lock is held.
#[async_trait]
pub trait SerialStore: Send + Sync {
    /// Create tables and seed the single lock row.
    async fn migrate(&self) -> Result<()>;

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Insert a new `created` operation. No dedup.
    async fn enqueue(&self, new: NewOperation) -> Result<OperationId>;

    /// Claim the oldest `created` operation for `worker_name`.
    ///
    /// Sets `processing`, stamps the worker and `updated_at`, and sets
    /// `started_at` only if it was unset. Returns `None` on an empty queue.
    async fn peek_and_claim(&self, worker_name: &str) -> Result<Option<Operation>>;

    /// `processing -> done`. Persists `expected`, `affected` and `log`.
    async fn complete(&self, operation: &Operation, affected: i64, log: Option<&str>)
    -> Result<()>;

    /// `processing|failed -> failed`, appending `error` to the log.
    /// Persists `expected` and `affected` from the in-memory copy.
    async fn fail(&self, operation: &Operation, error: &str) -> Result<()>;

    /// Fetch an operation by id.
    async fn get(&self, id: OperationId) -> Result<Operation>;

    /// Newest-first listing, optionally filtered by status.
    async fn list(&self, status: Option<Status>, limit: i64) -> Result<Vec<Operation>>;

    // -----------------------------------------------------------------------
    // Serial lock
    // -----------------------------------------------------------------------

    /// Set the lock holder if the lock is free. True iff exactly one row changed.
    async fn try_lock(&self, worker_name: &str) -> Result<bool>;

    /// Replace a holder observed at `seen`. Compare-and-set on both the holder
    /// and `last_update`, so a concurrent release or takeover wins instead.
    async fn take_over_lock(&self, worker_name: &str, seen: &SerialLockState) -> Result<bool>;

    /// Bump `last_update` if `worker_name` still holds the lock. False means
    /// the lock was lost.
    async fn refresh_lock(&self, worker_name: &str) -> Result<bool>;

    /// Clear the lock if held by `worker_name`. True iff exactly one row changed.
    async fn release_lock(&self, worker_name: &str) -> Result<bool>;

    /// Clear the lock regardless of holder. Operator recovery only.
    async fn clear_lock(&self) -> Result<Option<String>>;

    async fn lock_state(&self) -> Result<SerialLockState>;

    // -----------------------------------------------------------------------
    // Registered workers
    // -----------------------------------------------------------------------

    /// Stamp `last_restart`; fails with [`Error::UnknownWorker`] if the name
    /// was never provisioned.
    async fn register_worker(&self, worker_name: &str) -> Result<RegisteredWorker>;

    /// Operator action: allow a worker name to run.
    async fn provision_worker(&self, worker_name: &str) -> Result<RegisteredWorker>;

    async fn list_workers(&self) -> Result<Vec<RegisteredWorker>>;
}

/// Connect to the store named by `url`: `sqlite:` URLs open a
/// [`sqlite::SqliteStore`], anything else is treated as Postgres.
pub async fn connect(url: &str) -> Result<Arc<dyn SerialStore>> {
    if url.starts_with("sqlite:") {
        Ok(Arc::new(sqlite::SqliteStore::connect(url).await?))
    } else {
        Ok(Arc::new(postgres::PgStore::connect(url).await?))
    }
}

/// Re-enqueue a finished operation as a fresh row with the same name and
/// extras. The original row keeps its terminal status.
pub async fn retry(store: &dyn SerialStore, id: OperationId) -> Result<OperationId> {
    let operation = store.get(id).await?;
    if !operation.is_terminal() {
        return Err(Error::InvalidTransition {
            from: operation.status.to_string(),
            to: Status::Created.to_string(),
        });
    }
    store
        .enqueue(NewOperation::new(operation.name).extras(operation.extras))
        .await
}

/// Validate a state transition, returning an error if disallowed.
pub(crate) fn validate_transition(from: Status, to: Status) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

pub(crate) fn record_enqueued(name: &str) {
    metrics::operations_enqueued().add(1, &[KeyValue::new("name", name.to_string())]);
}

pub(crate) fn record_transition(from: Status, to: Status) {
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
