//! Worker runtime end to end against in-memory SQLite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use omoide_serial::catalog::MemoryCatalog;
use omoide_serial::db::SerialStore;
use omoide_serial::db::sqlite::SqliteStore;
use omoide_serial::engine::{BackoffConfig, Cycle, Worker, WorkerConfig};
use omoide_serial::error::{Error, Result};
use omoide_serial::model::{self, NewOperation, Status};
use omoide_serial::operations::{ExecutionContext, Variant, VariantRegistry};
use tokio::sync::Notify;

/// Reports three affected records.
struct NoopSuccess;

#[async_trait]
impl Variant for NoopSuccess {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        ctx.progress.set_expected(3);
        ctx.progress.add_affected(3);
        Ok(true)
    }
}

/// Touches one record, then gives up.
struct NoopFail;

#[async_trait]
impl Variant for NoopFail {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        ctx.progress.add_affected(1);
        Err(Error::Other("simulated failure".to_string()))
    }
}

struct Panics;

#[async_trait]
impl Variant for Panics {
    async fn execute(&self, _ctx: &ExecutionContext) -> Result<bool> {
        panic!("variant exploded");
    }
}

/// Enqueues a follow-up on behalf of the original requester.
struct Chains;

#[async_trait]
impl Variant for Chains {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        ctx.enqueue("noop-success", serde_json::json!({})).await?;
        Ok(true)
    }
}

/// Waits until the test opens the gate.
struct Gated(Arc<Notify>);

#[async_trait]
impl Variant for Gated {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        self.0.notified().await;
        ctx.progress.add_affected(1);
        Ok(true)
    }
}

/// Marks its own row failed mid-run, as an operator would.
struct FailedUnderneath;

#[async_trait]
impl Variant for FailedUnderneath {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        ctx.store
            .fail(&ctx.operation, "cancelled by operator")
            .await?;
        Ok(true)
    }
}

fn registry() -> Arc<VariantRegistry> {
    gated_registry(Arc::new(Notify::new()))
}

fn gated_registry(gate: Arc<Notify>) -> Arc<VariantRegistry> {
    let mut registry = VariantRegistry::new();
    registry
        .register("gated", move || Box::new(Gated(Arc::clone(&gate))))
        .unwrap();
    registry
        .register("failed-underneath", || Box::new(FailedUnderneath))
        .unwrap();
    registry
        .register("noop-success", || Box::new(NoopSuccess))
        .unwrap();
    registry
        .register("noop-fail-then-retry", || Box::new(NoopFail))
        .unwrap();
    registry.register("panics", || Box::new(Panics)).unwrap();
    registry.register("chains", || Box::new(Chains)).unwrap();
    Arc::new(registry)
}

fn fast_config(name: &str) -> WorkerConfig {
    WorkerConfig {
        name: name.to_string(),
        backoff: BackoffConfig {
            min_interval: 0.01,
            max_interval: 0.05,
            warm_up_coefficient: 2.0,
        },
        lock_ttl: None,
    }
}

async fn setup() -> Arc<SqliteStore> {
    let store = Arc::new(
        SqliteStore::in_memory()
            .await
            .expect("failed to create in-memory store"),
    );
    store.provision_worker("worker-1").await.unwrap();
    store.provision_worker("worker-2").await.unwrap();
    store
}

fn worker(store: &Arc<SqliteStore>, name: &str) -> Worker {
    Worker::new(
        store.clone(),
        Arc::new(MemoryCatalog::new()),
        registry(),
        fast_config(name),
    )
}

// ---------------------------------------------------------------------------
// Execution outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_then_failure_in_id_order() {
    let store = setup().await;
    let a = store
        .enqueue(NewOperation::new("noop-success"))
        .await
        .unwrap();
    let b = store
        .enqueue(NewOperation::new("noop-fail-then-retry"))
        .await
        .unwrap();
    assert!(a < b);

    let worker = worker(&store, "worker-1");
    worker.start().await.unwrap();

    assert_eq!(
        worker.run_once().await.unwrap(),
        Cycle::Executed {
            id: a,
            status: Status::Done
        }
    );
    assert_eq!(
        worker.run_once().await.unwrap(),
        Cycle::Executed {
            id: b,
            status: Status::Failed
        }
    );
    assert_eq!(worker.run_once().await.unwrap(), Cycle::Idle);

    let done = store.get(a).await.unwrap();
    assert_eq!(done.status, Status::Done);
    assert_eq!((done.expected, done.affected), (3, 3));
    assert_eq!(done.worker_name.as_deref(), Some("worker-1"));
    assert!(done.started_at.unwrap() <= done.ended_at.unwrap());

    let failed = store.get(b).await.unwrap();
    assert_eq!(failed.status, Status::Failed);
    assert_eq!(failed.affected, 1);
    assert_eq!(
        failed.log.as_deref(),
        Some("Worker worker-1: simulated failure")
    );

    assert!(!store.lock_state().await.unwrap().is_locked());
}

#[tokio::test]
async fn panicking_variant_fails_the_operation_only() {
    let store = setup().await;
    let id = store.enqueue(NewOperation::new("panics")).await.unwrap();
    let next = store
        .enqueue(NewOperation::new("noop-success"))
        .await
        .unwrap();

    let worker = worker(&store, "worker-1");
    worker.start().await.unwrap();

    assert_eq!(
        worker.run_once().await.unwrap(),
        Cycle::Executed {
            id,
            status: Status::Failed
        }
    );
    let failed = store.get(id).await.unwrap();
    assert!(failed.log.unwrap().contains("variant exploded"));
    assert!(!store.lock_state().await.unwrap().is_locked());

    assert_eq!(
        worker.run_once().await.unwrap(),
        Cycle::Executed {
            id: next,
            status: Status::Done
        }
    );
}

#[tokio::test]
async fn unknown_operation_is_fatal_but_releases_the_lock() {
    let store = setup().await;
    let id = store
        .enqueue(NewOperation::new("copy_item"))
        .await
        .unwrap();

    let worker = worker(&store, "worker-1");
    worker.start().await.unwrap();

    let err = worker.run_once().await.unwrap_err();
    assert!(matches!(err, Error::UnknownOperation(ref name) if name == "copy_item"));
    assert!(err.is_fatal());

    let op = store.get(id).await.unwrap();
    assert_eq!(op.status, Status::Failed);
    assert!(op.log.unwrap().starts_with("Worker worker-1: "));
    assert!(!store.lock_state().await.unwrap().is_locked());
}

#[tokio::test]
async fn follow_ups_inherit_the_requester() {
    let store = setup().await;
    let user = uuid::Uuid::new_v4();
    store
        .enqueue(NewOperation::new("chains").requested_by(user))
        .await
        .unwrap();

    let worker = worker(&store, "worker-1");
    worker.start().await.unwrap();
    worker.run_once().await.unwrap();

    let queued = store.list(Some(Status::Created), 10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].name, "noop-success");
    assert_eq!(queued[0].extras["requested_by"], user.to_string());
}

// ---------------------------------------------------------------------------
// Registration and lock handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unregistered_worker_cannot_start() {
    let store = setup().await;
    let worker = worker(&store, "intruder");

    let err = worker.run().await.unwrap_err();
    assert!(matches!(err, Error::UnknownWorker(ref name) if name == "intruder"));
}

#[tokio::test]
async fn busy_lock_skips_the_cycle() {
    let store = setup().await;
    let id = store
        .enqueue(NewOperation::new("noop-success"))
        .await
        .unwrap();
    assert!(store.try_lock("worker-2").await.unwrap());

    let worker = worker(&store, "worker-1");
    worker.start().await.unwrap();

    assert_eq!(worker.run_once().await.unwrap(), Cycle::LockBusy);
    assert_eq!(store.get(id).await.unwrap().status, Status::Created);
    let state = store.lock_state().await.unwrap();
    assert_eq!(state.worker_name.as_deref(), Some("worker-2"));
}

/// Poll until `holder` owns the lock row.
async fn wait_for_holder(store: &SqliteStore, holder: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = store.lock_state().await.unwrap();
        if state.worker_name.as_deref() == Some(holder) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "{holder} never took the lock");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn second_worker_is_turned_away_while_the_first_executes() {
    let store = setup().await;
    let gate = Arc::new(Notify::new());
    let id = store.enqueue(NewOperation::new("gated")).await.unwrap();

    let first = Worker::new(
        store.clone(),
        Arc::new(MemoryCatalog::new()),
        gated_registry(gate.clone()),
        fast_config("worker-1"),
    );
    let second = worker(&store, "worker-2");

    let running = {
        let first = first.clone();
        tokio::spawn(async move { first.run_once().await })
    };
    wait_for_holder(&store, "worker-1").await;

    assert_eq!(second.run_once().await.unwrap(), Cycle::LockBusy);
    let state = store.lock_state().await.unwrap();
    assert_eq!(state.worker_name.as_deref(), Some("worker-1"));

    gate.notify_one();
    assert_eq!(
        running.await.unwrap().unwrap(),
        Cycle::Executed {
            id,
            status: Status::Done
        }
    );

    // The retry gets the lock once it is free.
    assert_eq!(second.run_once().await.unwrap(), Cycle::Idle);
    assert!(!store.lock_state().await.unwrap().is_locked());
}

#[tokio::test]
async fn start_clears_own_stale_lock_only() {
    let store = setup().await;
    assert!(store.try_lock("worker-1").await.unwrap());

    worker(&store, "worker-2").start().await.unwrap();
    let state = store.lock_state().await.unwrap();
    assert_eq!(state.worker_name.as_deref(), Some("worker-1"));

    worker(&store, "worker-1").start().await.unwrap();
    assert!(!store.lock_state().await.unwrap().is_locked());
}

#[tokio::test]
async fn stale_lock_wedges_the_queue_without_ttl() {
    let store = setup().await;
    let id = store
        .enqueue(NewOperation::new("noop-success"))
        .await
        .unwrap();
    sqlx::query("UPDATE serial_lock SET worker_name = 'stale-worker', last_update = ?1")
        .bind(model::now() - chrono::Duration::days(1))
        .execute(store.pool())
        .await
        .unwrap();

    let worker = worker(&store, "worker-1");
    worker.start().await.unwrap();
    for _ in 0..5 {
        assert_eq!(worker.run_once().await.unwrap(), Cycle::LockBusy);
    }
    assert_eq!(store.get(id).await.unwrap().status, Status::Created);
}

#[tokio::test]
async fn stale_lock_is_recovered_with_ttl() {
    let store = setup().await;
    let id = store
        .enqueue(NewOperation::new("noop-success"))
        .await
        .unwrap();
    sqlx::query("UPDATE serial_lock SET worker_name = 'stale-worker', last_update = ?1")
        .bind(model::now() - chrono::Duration::days(1))
        .execute(store.pool())
        .await
        .unwrap();

    let worker = Worker::new(
        store.clone(),
        Arc::new(MemoryCatalog::new()),
        registry(),
        WorkerConfig {
            lock_ttl: Some(Duration::from_secs(60)),
            ..fast_config("worker-1")
        },
    );
    worker.start().await.unwrap();

    assert_eq!(
        worker.run_once().await.unwrap(),
        Cycle::Executed {
            id,
            status: Status::Done
        }
    );
    assert!(!store.lock_state().await.unwrap().is_locked());
}

#[tokio::test]
async fn long_operation_keeps_its_lock_past_the_ttl() {
    let store = setup().await;
    let gate = Arc::new(Notify::new());
    let slow = store.enqueue(NewOperation::new("gated")).await.unwrap();
    let next = store
        .enqueue(NewOperation::new("noop-success"))
        .await
        .unwrap();

    let ttl = Some(Duration::from_millis(300));
    let first = Worker::new(
        store.clone(),
        Arc::new(MemoryCatalog::new()),
        gated_registry(gate.clone()),
        WorkerConfig {
            lock_ttl: ttl,
            ..fast_config("worker-1")
        },
    );
    let second = Worker::new(
        store.clone(),
        Arc::new(MemoryCatalog::new()),
        registry(),
        WorkerConfig {
            lock_ttl: ttl,
            ..fast_config("worker-2")
        },
    );

    let running = {
        let first = first.clone();
        tokio::spawn(async move { first.run_once().await })
    };
    wait_for_holder(&store, "worker-1").await;

    // Well past the TTL: the holder has been refreshing all along.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(second.run_once().await.unwrap(), Cycle::LockBusy);
    assert_eq!(store.get(slow).await.unwrap().status, Status::Processing);
    assert_eq!(store.get(next).await.unwrap().status, Status::Created);

    gate.notify_one();
    assert_eq!(
        running.await.unwrap().unwrap(),
        Cycle::Executed {
            id: slow,
            status: Status::Done
        }
    );
    assert_eq!(
        second.run_once().await.unwrap(),
        Cycle::Executed {
            id: next,
            status: Status::Done
        }
    );
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_drains_the_queue_until_shutdown() {
    let store = setup().await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            store
                .enqueue(NewOperation::new("noop-success"))
                .await
                .unwrap(),
        );
    }

    let worker = worker(&store, "worker-1");
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let done = store.list(Some(Status::Done), 10).await.unwrap();
        if done.len() == ids.len() || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    worker.shutdown();
    handle.await.unwrap().unwrap();

    for id in ids {
        assert_eq!(store.get(id).await.unwrap().status, Status::Done);
    }
    assert!(!store.lock_state().await.unwrap().is_locked());
}

#[tokio::test]
async fn run_survives_non_fatal_cycle_errors() {
    let store = setup().await;
    let cancelled = store
        .enqueue(NewOperation::new("failed-underneath"))
        .await
        .unwrap();
    let next = store
        .enqueue(NewOperation::new("noop-success"))
        .await
        .unwrap();

    let worker = worker(&store, "worker-1");
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.get(next).await.unwrap().status != Status::Done {
        assert!(tokio::time::Instant::now() < deadline, "loop stopped early");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    worker.shutdown();
    handle.await.unwrap().unwrap();

    let op = store.get(cancelled).await.unwrap();
    assert_eq!(op.status, Status::Failed);
    assert_eq!(op.log.as_deref(), Some("cancelled by operator"));
}
