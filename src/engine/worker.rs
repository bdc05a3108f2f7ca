//! Worker runtime: acquire the serial lock, claim the oldest operation, run
//! its variant, record the outcome, release the lock, sleep, repeat.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::backoff::{Backoff, BackoffConfig};
use super::lock;
use crate::catalog::Catalog;
use crate::db::SerialStore;
use crate::error::{Error, Result};
use crate::model::{Operation, OperationId, Status};
use crate::operations::{ExecutionContext, VariantRegistry};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_operation_span};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Must be provisioned in the registered workers table.
    pub name: String,
    pub backoff: BackoffConfig,
    /// Age after which another worker's lock may be taken over. `None`
    /// keeps a crashed holder's lock until an operator clears it. When set,
    /// the holder refreshes the lock while an operation runs.
    pub lock_ttl: Option<Duration>,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backoff: BackoffConfig::default(),
            lock_ttl: None,
        }
    }
}

/// What a single [`Worker::run_once`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Another worker holds the serial lock.
    LockBusy,
    /// Lock taken, nothing to claim.
    Idle,
    Executed { id: OperationId, status: Status },
}

impl Cycle {
    pub fn did_work(&self) -> bool {
        matches!(self, Cycle::Executed { .. })
    }
}

pub struct Worker {
    store: Arc<dyn SerialStore>,
    catalog: Arc<dyn Catalog>,
    registry: Arc<VariantRegistry>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl Clone for Worker {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            catalog: Arc::clone(&self.catalog),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl Worker {
    pub fn new(
        store: Arc<dyn SerialStore>,
        catalog: Arc<dyn Catalog>,
        registry: Arc<VariantRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Ask the loop to stop after the current cycle.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Register with the store and drop any lock left under our own name by
    /// a previous run. Fails with [`Error::UnknownWorker`] if the name was
    /// never provisioned.
    pub async fn start(&self) -> Result<()> {
        self.config.backoff.validate()?;
        let registered = self.store.register_worker(&self.config.name).await?;
        info!(worker = %registered.worker_name, id = registered.id, "worker registered");

        if self.store.release_lock(&self.config.name).await? {
            warn!(worker = %self.config.name, "released serial lock left by a previous run");
        }
        Ok(())
    }

    /// Start, loop until [`Worker::shutdown`], then stop.
    ///
    /// Fatal errors (see [`Error::is_fatal`]) end the loop. Others are logged
    /// and the loop carries on.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        let mut backoff = Backoff::new(self.config.backoff);
        info!(worker = %self.config.name, "worker started");

        let result = loop {
            let did_work = match self.run_once().await {
                Ok(cycle) => {
                    debug!(?cycle, "cycle finished");
                    cycle.did_work()
                }
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) => {
                    warn!(worker = %self.config.name, "cycle failed: {e}");
                    false
                }
            };
            let delay = backoff.next_delay(did_work);

            tokio::select! {
                _ = self.shutdown.notified() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        if let Err(ref e) = result {
            error!(worker = %self.config.name, "worker loop failed: {e}");
        }
        self.stop().await?;
        result
    }

    /// Release the lock if this worker still holds it.
    pub async fn stop(&self) -> Result<()> {
        if self.store.release_lock(&self.config.name).await? {
            warn!(worker = %self.config.name, "released serial lock on stop");
        }
        info!(worker = %self.config.name, "worker stopped");
        Ok(())
    }

    /// One lock-claim-execute-release cycle.
    pub async fn run_once(&self) -> Result<Cycle> {
        let outcome = lock::acquire(&*self.store, &self.config.name, self.config.lock_ttl).await?;
        if !outcome.is_held() {
            return Ok(Cycle::LockBusy);
        }

        let cycle = self.claim_and_execute().await;
        let released = lock::release(&*self.store, &self.config.name).await;
        let cycle = cycle?;
        released?;
        Ok(cycle)
    }

    async fn claim_and_execute(&self) -> Result<Cycle> {
        let Some(operation) = self.store.peek_and_claim(&self.config.name).await? else {
            debug!(worker = %self.config.name, "no operations to claim");
            return Ok(Cycle::Idle);
        };

        let span = start_operation_span(operation.id, &operation.name, &self.config.name);
        record_state_transition(&span, Status::Created, Status::Processing);
        self.execute(operation, span.clone()).instrument(span).await
    }

    async fn execute(&self, mut operation: Operation, span: Span) -> Result<Cycle> {
        let id = operation.id;

        let Some(variant) = self.registry.get(&operation.name) else {
            let err = Error::UnknownOperation(operation.name.clone());
            error!(id, name = %operation.name, "no variant registered for operation");
            self.store.fail(&operation, &self.failure_line(&err)).await?;
            record_state_transition(&span, Status::Processing, Status::Failed);
            return Err(err);
        };

        info!(id, name = %operation.name, extras = %operation.extras, "operation started");

        let ctx = ExecutionContext::new(
            operation.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.catalog),
        );
        let progress = Arc::clone(&ctx.progress);
        let started = Instant::now();

        let lease = self.config.lock_ttl.map(|ttl| {
            lock::Lease::hold(Arc::clone(&self.store), self.config.name.clone(), ttl)
        });
        let outcome = tokio::spawn(async move { variant.execute(&ctx).await }.in_current_span()).await;
        if let Some(lease) = lease {
            lease.release().await;
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::operation_duration_ms()
            .record(duration_ms, &[KeyValue::new("name", operation.name.clone())]);

        operation.expected = progress.expected();
        operation.affected = progress.affected();

        let error = match outcome {
            Ok(Ok(changed)) => {
                self.store
                    .complete(&operation, operation.affected, None)
                    .await?;
                record_state_transition(&span, Status::Processing, Status::Done);
                info!(id, changed, affected = operation.affected, duration_ms, "operation completed");
                return Ok(Cycle::Executed {
                    id,
                    status: Status::Done,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(join) if join.is_panic() => {
                format!("panicked: {}", panic_message(join.into_panic()))
            }
            Err(join) => join.to_string(),
        };

        warn!(id, affected = operation.affected, duration_ms, %error, "operation failed");
        self.store
            .fail(&operation, &self.failure_line(&error))
            .await?;
        record_state_transition(&span, Status::Processing, Status::Failed);
        Ok(Cycle::Executed {
            id,
            status: Status::Failed,
        })
    }

    fn failure_line(&self, error: &dyn std::fmt::Display) -> String {
        format!("Worker {}: {error}", self.config.name)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
