//! Serial lock row: mutual exclusion, release and stale holders.

use std::sync::Arc;
use std::time::Duration;

use omoide_serial::db::SerialStore;
use omoide_serial::db::sqlite::SqliteStore;
use omoide_serial::engine::{Lease, LockOutcome};
use omoide_serial::engine::lock;
use omoide_serial::model;

async fn test_store() -> Arc<SqliteStore> {
    Arc::new(
        SqliteStore::in_memory()
            .await
            .expect("failed to create in-memory store"),
    )
}

/// Pretend `holder` took the lock `age` ago and then vanished.
async fn plant_lock(store: &SqliteStore, holder: &str, age: chrono::Duration) {
    sqlx::query("UPDATE serial_lock SET worker_name = ?1, last_update = ?2 WHERE id = 1")
        .bind(holder)
        .bind(model::now() - age)
        .execute(store.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn lock_starts_free() {
    let store = test_store().await;
    assert!(!store.lock_state().await.unwrap().is_locked());
}

#[tokio::test]
async fn exactly_one_of_many_acquires() {
    let store = test_store().await;

    let attempts: Vec<_> = (0..16)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.try_lock(&format!("worker-{i}")).await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(store.lock_state().await.unwrap().is_locked());
}

#[tokio::test]
async fn holder_release_succeeds_and_frees() {
    let store = test_store().await;
    assert!(store.try_lock("worker-1").await.unwrap());
    assert!(!store.try_lock("worker-2").await.unwrap());

    assert!(store.release_lock("worker-1").await.unwrap());
    let state = store.lock_state().await.unwrap();
    assert!(state.worker_name.is_none());

    assert!(store.try_lock("worker-2").await.unwrap());
}

#[tokio::test]
async fn foreign_release_is_a_noop() {
    let store = test_store().await;
    assert!(store.try_lock("worker-1").await.unwrap());

    assert!(!store.release_lock("worker-2").await.unwrap());
    let state = store.lock_state().await.unwrap();
    assert_eq!(state.worker_name.as_deref(), Some("worker-1"));
}

#[tokio::test]
async fn release_of_free_lock_reports_false() {
    let store = test_store().await;
    assert!(!store.release_lock("worker-1").await.unwrap());
}

#[tokio::test]
async fn clear_lock_reports_previous_holder() {
    let store = test_store().await;
    assert!(store.try_lock("worker-1").await.unwrap());

    assert_eq!(store.clear_lock().await.unwrap().as_deref(), Some("worker-1"));
    assert_eq!(store.clear_lock().await.unwrap(), None);
    assert!(!store.lock_state().await.unwrap().is_locked());
}

#[tokio::test]
async fn acquire_reports_busy_holder() {
    let store = test_store().await;
    assert_eq!(
        lock::acquire(&*store, "worker-1", None).await.unwrap(),
        LockOutcome::Acquired
    );
    assert_eq!(
        lock::acquire(&*store, "worker-2", None).await.unwrap(),
        LockOutcome::Busy {
            holder: Some("worker-1".to_string())
        }
    );
    assert!(lock::release(&*store, "worker-1").await.unwrap());
}

#[tokio::test]
async fn stale_lock_wedges_without_ttl() {
    let store = test_store().await;
    plant_lock(&store, "stale-worker", chrono::Duration::days(30)).await;

    for _ in 0..3 {
        let outcome = lock::acquire(&*store, "worker-1", None).await.unwrap();
        assert!(!outcome.is_held());
    }
    let state = store.lock_state().await.unwrap();
    assert_eq!(state.worker_name.as_deref(), Some("stale-worker"));
}

#[tokio::test]
async fn stale_lock_is_taken_over_past_ttl() {
    let store = test_store().await;
    plant_lock(&store, "stale-worker", chrono::Duration::hours(2)).await;

    let outcome = lock::acquire(&*store, "worker-1", Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        LockOutcome::Stolen {
            from: "stale-worker".to_string()
        }
    );
    let state = store.lock_state().await.unwrap();
    assert_eq!(state.worker_name.as_deref(), Some("worker-1"));
}

#[tokio::test]
async fn fresh_lock_survives_ttl_check() {
    let store = test_store().await;
    plant_lock(&store, "busy-worker", chrono::Duration::seconds(5)).await;

    let outcome = lock::acquire(&*store, "worker-1", Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    assert!(!outcome.is_held());
}

#[tokio::test]
async fn takeover_loses_to_a_concurrent_refresh() {
    let store = test_store().await;
    plant_lock(&store, "stale-worker", chrono::Duration::hours(2)).await;
    let seen = store.lock_state().await.unwrap();

    // Holder releases and someone else grabs the lock after we looked.
    assert!(store.release_lock("stale-worker").await.unwrap());
    assert!(store.try_lock("worker-2").await.unwrap());

    assert!(!store.take_over_lock("worker-1", &seen).await.unwrap());
    let state = store.lock_state().await.unwrap();
    assert_eq!(state.worker_name.as_deref(), Some("worker-2"));
}

#[tokio::test]
async fn refresh_only_succeeds_for_the_holder() {
    let store = test_store().await;
    plant_lock(&store, "worker-1", chrono::Duration::hours(2)).await;
    let before = store.lock_state().await.unwrap();

    assert!(!lock::refresh(&*store, "worker-2").await.unwrap());
    assert_eq!(store.lock_state().await.unwrap(), before);

    assert!(lock::refresh(&*store, "worker-1").await.unwrap());
    let after = store.lock_state().await.unwrap();
    assert_eq!(after.worker_name.as_deref(), Some("worker-1"));
    assert!(after.last_update > before.last_update);

    let outcome = lock::acquire(&*store, "worker-2", Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    assert!(!outcome.is_held());
}

#[tokio::test]
async fn lease_keeps_the_lock_fresh_until_released() {
    let store = test_store().await;
    plant_lock(&store, "worker-1", chrono::Duration::hours(2)).await;

    let lease = Lease::hold(store.clone(), "worker-1".to_string(), Duration::from_millis(60));
    tokio::time::sleep(Duration::from_millis(200)).await;
    lease.release().await;

    let state = store.lock_state().await.unwrap();
    assert_eq!(state.worker_name.as_deref(), Some("worker-1"));
    assert!(model::now() - state.last_update < chrono::Duration::minutes(1));
}

#[tokio::test]
async fn lease_gives_up_once_the_lock_is_gone() {
    let store = test_store().await;
    assert!(store.try_lock("worker-1").await.unwrap());

    let lease = Lease::hold(store.clone(), "worker-1".to_string(), Duration::from_millis(30));
    assert_eq!(store.clear_lock().await.unwrap().as_deref(), Some("worker-1"));
    assert!(store.try_lock("worker-2").await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    lease.release().await;

    let state = store.lock_state().await.unwrap();
    assert_eq!(state.worker_name.as_deref(), Some("worker-2"));
}
