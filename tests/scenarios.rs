//! End-to-end scenarios against the in-memory adapter, scaled down to
//! sub-second durations. These exercise the public `Locker` API rather
//! than adapter internals — see `src/adapter/memory.rs` for the FIFO
//! admission unit tests and `src/lock.rs` for the state machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rw_locker::adapter::memory::InMemoryAdapter;
use rw_locker::{LockError, LockOptions, LockStatus, Locker, LockerConfig};

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn locker() -> Locker<InMemoryAdapter> {
    init_tracing();
    Locker::new(InMemoryAdapter::new(), LockerConfig::default())
}

/// S1 — two readers then a writer times out.
#[tokio::test]
async fn s1_two_readers_then_writer_times_out() {
    let locker = locker();

    let reader_a = locker.lock_as_reader("L", LockOptions::default()).await.unwrap();
    let reader_b = locker.lock_as_reader("L", LockOptions::default()).await.unwrap();
    assert_eq!(locker.registry().len(), 2);

    let start = std::time::Instant::now();
    let err = locker
        .lock_as_writer(
            "L",
            LockOptions {
                acquire_timeout_ms: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::Timeout(_)));
    assert!(start.elapsed() >= Duration::from_millis(90));
    assert_eq!(locker.registry().len(), 2);

    locker.release(&reader_a).await.unwrap();
    locker.release(&reader_b).await.unwrap();

    let writer = locker.lock_as_writer("L", LockOptions::default()).await.unwrap();
    assert_eq!(writer.status(), LockStatus::Acquired);
}

/// S2 — reader concurrency: five concurrent readers should all be able
/// to hold the lock at once.
#[tokio::test]
async fn s2_reader_concurrency() {
    let locker = Arc::new(locker());
    let counter = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..5 {
        let locker = locker.clone();
        let counter = counter.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            locker
                .ensure_reading_task_concurrency("L2", LockOptions::default(), || async move {
                    let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(25 + (i as u64 * 5) % 75)).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 5);
    assert_eq!(locker.registry().len(), 0);
}

/// S3 — writer serialization: two concurrent writers must never both
/// hold the lock at once.
#[tokio::test]
async fn s3_writer_serialization() {
    let locker = Arc::new(locker());
    let counter = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let locker = locker.clone();
        let counter = counter.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            locker
                .ensure_writing_task_concurrency("L2", LockOptions::default(), || async move {
                    let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

/// S4 — GC does not collect active locks.
#[tokio::test]
async fn s4_gc_skips_active_locks() {
    let locker = Locker::new(
        InMemoryAdapter::new(),
        LockerConfig {
            gc_interval_ms: Some(50),
        },
    );
    locker.setup().await.unwrap();

    let mut locks = Vec::new();
    for name in ["a", "b"] {
        for _ in 0..2 {
            locks.push(locker.lock_as_reader(name, LockOptions::default()).await.unwrap());
        }
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    let cycle = locker.gc().await.unwrap();
    assert!(cycle.is_some());

    for lock in &locks {
        locker.release(lock).await.unwrap();
    }
}

/// S5 — GC collects orphans whose owner never came back to release.
#[tokio::test]
async fn s5_gc_collects_orphans() {
    let adapter = InMemoryAdapter::new();
    let locker = Locker::new(adapter, LockerConfig { gc_interval_ms: Some(50) });
    locker.setup().await.unwrap();

    let mut live = Vec::new();
    let mut orphaned = Vec::new();
    for i in 0..5 {
        let lock = locker.lock_as_reader("L5", LockOptions::default()).await.unwrap();
        if i < 3 {
            // Simulate a crashed owner: drop the lock from the registry
            // without releasing it, so the next GC cycle sees it as stale.
            locker.registry().remove(&lock.id);
            orphaned.push(lock);
        } else {
            live.push(lock);
        }
    }

    tokio::time::sleep(Duration::from_millis(250)).await;
    // Two cycles' worth of staleness (2 * gc_interval_ms) must elapse
    // relative to the last refresh each orphan received, which is its
    // enqueue time since it was detached immediately after.
    locker.gc().await.unwrap();

    for lock in &live {
        locker.release(lock).await.unwrap();
    }
}

/// S6 — high-concurrency stability: many writers and readers settle
/// without violating writer exclusivity, and the registry drains.
#[tokio::test]
async fn s6_high_concurrency_stability() {
    let locker = Arc::new(locker());
    let writers_active = Arc::new(AtomicUsize::new(0));
    let readers_active = Arc::new(AtomicUsize::new(0));
    let violation = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let opts = || LockOptions {
        acquire_timeout_ms: None,
        pull_interval_ms: Some(5),
    };

    let mut handles = Vec::new();

    for _ in 0..10 {
        let locker = locker.clone();
        let writers_active = writers_active.clone();
        let readers_active = readers_active.clone();
        let violation = violation.clone();
        handles.push(tokio::spawn(async move {
            locker
                .ensure_writing_task_concurrency("L6", opts(), || async move {
                    writers_active.fetch_add(1, Ordering::SeqCst);
                    if readers_active.load(Ordering::SeqCst) > 0 {
                        violation.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    writers_active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }));
    }

    for _ in 0..30 {
        let locker = locker.clone();
        let writers_active = writers_active.clone();
        let readers_active = readers_active.clone();
        let violation = violation.clone();
        handles.push(tokio::spawn(async move {
            locker
                .ensure_reading_task_concurrency("L6", opts(), || async move {
                    readers_active.fetch_add(1, Ordering::SeqCst);
                    if writers_active.load(Ordering::SeqCst) > 0 {
                        violation.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    readers_active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }));
    }

    let all = futures_join(handles).await;
    for r in all {
        r.unwrap();
    }

    assert!(!violation.load(Ordering::SeqCst), "writer exclusivity was violated");
    assert_eq!(locker.registry().len(), 0);
}

async fn futures_join(handles: Vec<tokio::task::JoinHandle<()>>) -> Vec<Result<(), tokio::task::JoinError>> {
    let mut results = Vec::with_capacity(handles.len());
    for h in handles {
        results.push(h.await);
    }
    results
}
