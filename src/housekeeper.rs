//! Periodic maintenance: idle pruning, clock-skew defense, refill.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bag::STATE_NOT_IN_USE;
use crate::clock::Clock;
use crate::factory::HandleFactory;
use crate::pool::{PoolInner, POOL_SHUTDOWN};

// Retrograde tolerance, per the NTP spec.
const RETROGRADE_TOLERANCE_MS: u64 = 128;

const INITIAL_DELAY: Duration = Duration::from_millis(100);

/// The housekeeping task. Runs at a fixed delay (sleep-then-tick), so a
/// slow tick can never overlap the next one.
pub(crate) struct Housekeeper<F: HandleFactory> {
    pool: Weak<PoolInner<F>>,
    clock: Arc<dyn Clock>,
    period: Duration,
    previous: u64,
}

impl<F: HandleFactory> Housekeeper<F> {
    pub(crate) fn new(pool: Weak<PoolInner<F>>, clock: Arc<dyn Clock>, period: Duration) -> Self {
        let previous = clock.now_millis().saturating_sub(period.as_millis() as u64);
        Self {
            pool,
            clock,
            period,
            previous,
        }
    }

    pub(crate) fn spawn(
        pool: Weak<PoolInner<F>>,
        clock: Arc<dyn Clock>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut keeper = Self::new(pool, clock, period);
        tokio::spawn(async move {
            let mut delay = INITIAL_DELAY;
            loop {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = shutdown.cancelled() => break,
                }
                delay = keeper.period;

                let Some(pool) = keeper.pool.upgrade() else {
                    break;
                };
                if pool.state.load(std::sync::atomic::Ordering::Acquire) == POOL_SHUTDOWN {
                    break;
                }
                keeper.tick(&pool).await;
            }
        });
    }

    /// One maintenance pass. Separated from the loop so tests can drive it
    /// directly with a manual clock.
    pub(crate) async fn tick(&mut self, pool: &Arc<PoolInner<F>>) {
        let now = self.clock.now_millis();
        let period_ms = self.period.as_millis() as u64;

        if now + RETROGRADE_TOLERANCE_MS < self.previous + period_ms {
            // Backward clock jump: last-access stamps are no longer
            // trustworthy, so retire everything rather than risk serving
            // stale handles.
            tracing::warn!(
                delta_ms = (self.previous + period_ms).saturating_sub(now),
                "retrograde clock change detected, soft-evicting handles from pool"
            );
            self.previous = now;
            pool.soft_evict_all().await;
            pool.fill_pool();
            return;
        } else if now > self.previous + period_ms * 3 / 2 {
            // Forward motion only accelerates natural retirement; no point
            // evicting for it.
            tracing::warn!(
                delta_ms = now - self.previous,
                "thread starvation or clock leap detected"
            );
        }
        self.previous = now;

        let idle_timeout = pool.options.idle_timeout;
        if !idle_timeout.is_zero() {
            let idle_ms = idle_timeout.as_millis() as u64;
            let mut idle = pool.bag.values(STATE_NOT_IN_USE);
            let mut removable = idle.len().saturating_sub(pool.options.minimum_idle);
            if removable > 0 {
                pool.log_pool_state("before cleanup ");
                idle.sort_by_key(|entry| entry.last_accessed());
                for entry in idle {
                    if now.saturating_sub(entry.last_accessed()) > idle_ms
                        && pool.bag.reserve(&entry)
                    {
                        pool.close_entry(entry, "handle has passed idle timeout")
                            .await;
                        removable -= 1;
                        if removable == 0 {
                            break;
                        }
                    }
                }
                pool.log_pool_state("after cleanup ");
            }
        }

        pool.fill_pool();
    }
}
