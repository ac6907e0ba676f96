//! Throughput benchmarks for the in-memory adapter: admission latency
//! under reader-only load and under an alternating reader/writer
//! sequence on one name.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rw_locker::adapter::memory::InMemoryAdapter;
use rw_locker::{LockOptions, Locker, LockerConfig};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build benchmark runtime")
}

fn bench_uncontended_reader_acquire_release(c: &mut Criterion) {
    let rt = runtime();
    let locker = Locker::new(InMemoryAdapter::new(), LockerConfig::default());

    c.bench_function("uncontended_reader_acquire_release", |b| {
        b.to_async(&rt).iter(|| async {
            let lock = locker
                .lock_as_reader("bench", LockOptions::default())
                .await
                .unwrap();
            locker.release(black_box(&lock)).await.unwrap();
        });
    });
}

fn bench_sequential_mixed_readers_writers(c: &mut Criterion) {
    let rt = runtime();

    c.bench_function("sequential_mixed_readers_writers_batch_of_8", |b| {
        b.to_async(&rt).iter_batched(
            || Locker::new(InMemoryAdapter::new(), LockerConfig::default()),
            |locker| async move {
                let mut handles = Vec::new();
                for i in 0..8 {
                    let opts = LockOptions {
                        acquire_timeout_ms: None,
                        pull_interval_ms: Some(2),
                    };
                    if i % 3 == 0 {
                        let lock = locker.lock_as_writer("bench-mixed", opts).await.unwrap();
                        locker.release(&lock).await.unwrap();
                    } else {
                        let lock = locker.lock_as_reader("bench-mixed", opts).await.unwrap();
                        locker.release(&lock).await.unwrap();
                    }
                    handles.push(());
                }
                black_box(handles);
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_uncontended_reader_acquire_release,
    bench_sequential_mixed_readers_writers
);
criterion_main!(benches);
