//! Property tests for borrow/return counter invariants.
//!
//! After arbitrary borrow/return sequences,
//! `active + idle <= total <= maximum_pool_size` always holds.

use std::time::Duration;

use handlepool::testing::MockFactory;
use handlepool::{Pool, PoolOptions};
use proptest::prelude::*;

fn options(max_size: usize) -> PoolOptions {
    PoolOptions {
        minimum_idle: 0,
        maximum_pool_size: max_size,
        idle_timeout: Duration::ZERO,
        max_lifetime: Duration::ZERO,
        initialization_fail_fast: false,
        housekeeping_period: Duration::from_secs(30),
        ..Default::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    #[test]
    fn counters_stay_consistent_under_random_ops(
        max_size in 1usize..8,
        ops in proptest::collection::vec(prop_oneof![Just(true), Just(false)], 1..40),
    ) {
        // Run the async property test on the Tokio runtime.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let pool = Pool::new(MockFactory::new(), options(max_size)).await.unwrap();
            let mut handles = Vec::new();

            for op_is_borrow in &ops {
                if *op_is_borrow {
                    // Borrow (may time out when the pool is exhausted --
                    // that is fine).
                    if let Ok(handle) =
                        pool.borrow_timeout(Duration::from_millis(50)).await
                    {
                        handles.push(handle);
                    }
                } else if !handles.is_empty() {
                    handles.pop();
                }

                let (active, idle, total) = (pool.active(), pool.idle(), pool.total());
                prop_assert!(
                    active + idle <= total,
                    "claimed handles exceed the live count: active={active} idle={idle} total={total}",
                );
                prop_assert!(
                    total <= max_size,
                    "total={total} exceeds max_size={max_size}",
                );
                prop_assert_eq!(active, handles.len());
            }

            drop(handles);
            prop_assert_eq!(pool.active(), 0, "all wrappers dropped, none may stay active");
            prop_assert!(pool.total() <= max_size);

            Ok(())
        })?;
    }
}

/// Deterministic companion: rapid borrow/return cycles keep the invariants.
#[tokio::test]
async fn rapid_borrow_return_preserves_invariants() {
    let pool = Pool::new(MockFactory::new(), options(4)).await.unwrap();

    for _ in 0..50 {
        let handle = pool.borrow_timeout(Duration::from_secs(1)).await.unwrap();
        drop(handle);

        assert!(pool.active() + pool.idle() <= pool.total());
        assert!(pool.total() <= 4);
    }
    assert_eq!(pool.active(), 0);
}
