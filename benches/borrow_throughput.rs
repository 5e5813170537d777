// Pool throughput benchmarks.
//
// Measures raw borrow/return overhead with a zero-cost factory (no I/O,
// instant open/validate/close).

use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use handlepool::testing::MockFactory;
use handlepool::{Pool, PoolOptions};

fn options(max_size: usize) -> PoolOptions {
    PoolOptions {
        minimum_idle: max_size,
        maximum_pool_size: max_size,
        connection_timeout: Duration::from_secs(5),
        idle_timeout: Duration::ZERO,
        max_lifetime: Duration::ZERO,
        initialization_fail_fast: false,
        housekeeping_period: Duration::from_secs(30),
        ..Default::default()
    }
}

fn single_thread_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("failed to build runtime");

    let pool = rt.block_on(async {
        let pool = Pool::new(MockFactory::new(), options(64))
            .await
            .expect("failed to create pool");
        // Let the housekeeper warm the pool so borrows hit the fast path.
        tokio::time::sleep(Duration::from_millis(300)).await;
        pool
    });

    c.bench_function("single_thread_borrow_return", |b| {
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            async move {
                let handle = pool.borrow().await.unwrap();
                black_box(handle.id);
                drop(handle);
            }
        });
    });
}

fn multi_thread_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build runtime");

    let pool = rt.block_on(async {
        let pool = Pool::new(MockFactory::new(), options(64))
            .await
            .expect("failed to create pool");
        tokio::time::sleep(Duration::from_millis(300)).await;
        pool
    });

    c.bench_function("multi_thread_borrow_return", |b| {
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            async move {
                let handle = pool.borrow().await.unwrap();
                black_box(handle.id);
                drop(handle);
            }
        });
    });
}

fn contended_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build runtime");

    // Small pool to force handoff between tasks.
    let pool = rt.block_on(async {
        let pool = Pool::new(MockFactory::new(), options(4))
            .await
            .expect("failed to create pool");
        tokio::time::sleep(Duration::from_millis(300)).await;
        pool
    });

    c.bench_function("contended_borrow_return_4slots", |b| {
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            async move {
                let handle = pool.borrow().await.unwrap();
                black_box(handle.id);
                drop(handle);
            }
        });
    });
}

criterion_group!(
    benches,
    single_thread_throughput,
    multi_thread_throughput,
    contended_throughput,
);
criterion_main!(benches);
