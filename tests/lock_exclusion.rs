//! Aggregate lock guarantees under contention and lease expiry.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tally::engine::config::LockConfig;
use tally::engine::{AggregateLock, LockError};
use tally::infra::memory::MemoryLockBackend;

fn lock(backend: Arc<MemoryLockBackend>) -> AggregateLock {
    let config = LockConfig {
        retry_interval_ms: 2,
        ..LockConfig::default()
    };
    AggregateLock::new(backend, &config)
}

const WAIT: Duration = Duration::from_secs(5);
const LEASE: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_modify_write_under_the_lock_loses_no_updates() {
    let backend = Arc::new(MemoryLockBackend::new());
    let value = Arc::new(AtomicI64::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        // Separate handles model separate service instances.
        let lock = lock(backend.clone());
        let value = value.clone();
        tasks.push(tokio::spawn(async move {
            lock.with_lock("lock:post:42", WAIT, LEASE, |_| async {
                let read = value.load(Ordering::SeqCst);
                tokio::task::yield_now().await;
                value.store(read + 1, Ordering::SeqCst);
                Ok::<_, LockError>(())
            })
            .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(value.load(Ordering::SeqCst), 16);
    assert_eq!(backend.held_count(), 0);
}

#[tokio::test]
async fn distinct_aggregates_do_not_contend() {
    let lock = lock(Arc::new(MemoryLockBackend::new()));
    let a = lock.acquire("lock:post:1", WAIT, LEASE).await.unwrap();
    let b = lock
        .acquire("lock:comment:1", Duration::from_millis(10), LEASE)
        .await
        .unwrap();
    assert!(lock.release(&a).await);
    assert!(lock.release(&b).await);
}

#[tokio::test(start_paused = true)]
async fn expired_lease_admits_a_successor_and_stale_release_is_refused() {
    let backend = Arc::new(MemoryLockBackend::new());
    let lock = lock(backend.clone());
    let lease = Duration::from_millis(50);

    let stale = lock.acquire("lock:post:9", WAIT, lease).await.unwrap();
    let err = lock
        .acquire("lock:post:9", Duration::from_millis(20), lease)
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::Timeout { .. }));

    tokio::time::advance(Duration::from_millis(60)).await;
    let successor = lock.acquire("lock:post:9", WAIT, lease).await.unwrap();

    assert!(!lock.still_held(&stale).await);
    assert!(!lock.release(&stale).await);
    assert!(lock.still_held(&successor).await);
    assert!(lock.release(&successor).await);
}
