//! End-of-life retirement by max lifetime.

use std::time::Duration;

use handlepool::testing::MockFactory;
use handlepool::{Pool, PoolOptions};

fn options() -> PoolOptions {
    PoolOptions {
        minimum_idle: 1,
        maximum_pool_size: 2,
        idle_timeout: Duration::ZERO,
        max_lifetime: Duration::from_secs(1),
        initialization_fail_fast: false,
        housekeeping_period: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn aged_out_handle_is_retired_even_after_use() {
    let factory = MockFactory::new();
    let pool = Pool::new(factory.clone(), options()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(pool.total() >= 1);

    // Borrow the original handle and keep it out for half its lifetime.
    let handle = pool.borrow_timeout(Duration::from_secs(1)).await.unwrap();
    let original_id = handle.id;
    tokio::time::sleep(Duration::from_millis(500)).await;
    drop(handle);

    // Past the 1s lifetime the end-of-life timer must have retired it.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(
        factory.closed() >= 1,
        "aged-out handle should have been closed"
    );

    let replacement = pool.borrow_timeout(Duration::from_secs(2)).await.unwrap();
    assert_ne!(
        replacement.id, original_id,
        "an aged-out handle must never be served again"
    );
}

#[tokio::test]
async fn in_use_handle_outlives_its_deadline_until_returned() {
    let factory = MockFactory::new();
    let pool = Pool::new(factory.clone(), options()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Hold the handle across its entire lifetime: soft eviction must not
    // yank it from under us.
    let handle = pool.borrow_timeout(Duration::from_secs(1)).await.unwrap();
    let held_id = handle.id;
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(handle.id, held_id);
    drop(handle);

    // Returned after the eviction mark: the next claim closes it.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let next = pool.borrow_timeout(Duration::from_secs(2)).await.unwrap();
    assert_ne!(next.id, held_id);
}
