//! Serial lock protocol on top of [`SerialStore`]'s single-row primitives.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, warn};

use crate::db::SerialStore;
use crate::error::Result;
use crate::model;
use crate::telemetry::metrics;

/// Result of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Took over a lock whose holder stopped updating it for longer than the TTL.
    Stolen { from: String },
    Busy { holder: Option<String> },
}

impl LockOutcome {
    pub fn is_held(&self) -> bool {
        !matches!(self, LockOutcome::Busy { .. })
    }

    fn as_str(&self) -> &'static str {
        match self {
            LockOutcome::Acquired => "acquired",
            LockOutcome::Stolen { .. } => "stolen",
            LockOutcome::Busy { .. } => "busy",
        }
    }
}

/// Try to become the lock holder.
///
/// With `ttl` unset a held lock is never taken over, even if its holder is
/// long gone; an operator has to clear it.
pub async fn acquire(
    store: &dyn SerialStore,
    worker_name: &str,
    ttl: Option<Duration>,
) -> Result<LockOutcome> {
    let outcome = if store.try_lock(worker_name).await? {
        LockOutcome::Acquired
    } else {
        let state = store.lock_state().await?;
        match (ttl, state.worker_name.clone()) {
            (Some(ttl), Some(holder)) if is_stale(state.last_update, ttl) => {
                if store.take_over_lock(worker_name, &state).await? {
                    warn!(worker = worker_name, stale_holder = %holder, last_update = %state.last_update, "took over stale serial lock");
                    LockOutcome::Stolen { from: holder }
                } else {
                    LockOutcome::Busy {
                        holder: Some(holder),
                    }
                }
            }
            (_, holder) => LockOutcome::Busy { holder },
        }
    };

    match &outcome {
        LockOutcome::Acquired => debug!(worker = worker_name, "serial lock acquired"),
        LockOutcome::Busy { holder } => {
            debug!(worker = worker_name, holder = ?holder, "serial lock busy")
        }
        LockOutcome::Stolen { .. } => {}
    }
    record(outcome.as_str());
    Ok(outcome)
}

/// Release the lock if `worker_name` holds it. Returns whether it did.
pub async fn release(store: &dyn SerialStore, worker_name: &str) -> Result<bool> {
    let released = store.release_lock(worker_name).await?;
    if released {
        debug!(worker = worker_name, "serial lock released");
        record("released");
    } else {
        warn!(worker = worker_name, "serial lock was not held at release");
    }
    Ok(released)
}

/// Bump the lock's `last_update` for its holder. Returns false, and records
/// the loss, if `worker_name` no longer holds it.
pub async fn refresh(store: &dyn SerialStore, worker_name: &str) -> Result<bool> {
    let refreshed = store.refresh_lock(worker_name).await?;
    if refreshed {
        debug!(worker = worker_name, "serial lock refreshed");
    } else {
        warn!(worker = worker_name, "serial lock lost while holding it");
        record("lost");
    }
    Ok(refreshed)
}

/// Refreshes the held lock every third of the TTL while an operation runs.
pub struct Lease {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Lease {
    const MIN_PERIOD: Duration = Duration::from_millis(10);

    pub fn hold(store: Arc<dyn SerialStore>, worker_name: String, ttl: Duration) -> Self {
        let period = (ttl / 3).max(Self::MIN_PERIOD);
        let (stop, mut stopped) = oneshot::channel();

        let task = tokio::spawn(
            async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticks = tokio::time::interval_at(start, period);
                loop {
                    tokio::select! {
                        _ = &mut stopped => return,
                        _ = ticks.tick() => {}
                    }
                    match refresh(&*store, &worker_name).await {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => warn!(worker = %worker_name, "serial lock refresh failed: {e}"),
                    }
                }
            }
            .in_current_span(),
        );

        Self { stop, task }
    }

    /// Stop refreshing. Waits for an in-flight refresh to finish.
    pub async fn release(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!("serial lock lease task ended abnormally: {e}");
        }
    }
}

fn is_stale(last_update: chrono::DateTime<chrono::Utc>, ttl: Duration) -> bool {
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => model::now() - last_update > ttl,
        Err(_) => false,
    }
}

fn record(result: &'static str) {
    metrics::lock_events().add(1, &[KeyValue::new("result", result)]);
}
