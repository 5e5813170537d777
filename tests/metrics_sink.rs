//! Metrics sink wiring: borrow waits, usage spans, timeouts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use handlepool::testing::MockFactory;
use handlepool::{MetricsSink, Pool, PoolOptions};

#[derive(Debug, Default)]
struct CountingSink {
    borrows: AtomicU64,
    usages: AtomicU64,
    timeouts: AtomicU64,
}

impl MetricsSink for CountingSink {
    fn record_borrow(&self, _wait: Duration) {
        self.borrows.fetch_add(1, Ordering::SeqCst);
    }

    fn record_usage(&self, _usage: Duration) {
        self.usages.fetch_add(1, Ordering::SeqCst);
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

fn options() -> PoolOptions {
    PoolOptions {
        minimum_idle: 1,
        maximum_pool_size: 1,
        idle_timeout: Duration::ZERO,
        max_lifetime: Duration::ZERO,
        initialization_fail_fast: false,
        housekeeping_period: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn sink_observes_borrows_usages_and_timeouts() {
    let sink = Arc::new(CountingSink::default());
    let pool = Pool::with_metrics(
        MockFactory::new(),
        options(),
        Arc::clone(&sink) as Arc<dyn MetricsSink>,
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let handle = pool.borrow_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(sink.borrows.load(Ordering::SeqCst), 1);
    assert_eq!(sink.usages.load(Ordering::SeqCst), 0);

    let _ = pool.borrow_timeout(Duration::from_millis(100)).await;
    assert_eq!(sink.timeouts.load(Ordering::SeqCst), 1);

    drop(handle);
    assert_eq!(sink.usages.load(Ordering::SeqCst), 1);
}
