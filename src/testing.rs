//! Testing utilities: a controllable clock and a scriptable handle factory.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::BoxError;
use crate::factory::HandleFactory;

/// A clock tests can set, advance, and rewind.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    /// Set the clock to an absolute reading.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Move the clock backward, saturating at zero.
    pub fn rewind(&self, by: Duration) {
        let by = by.as_millis() as u64;
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_sub(by))
            });
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A numbered mock handle.
#[derive(Debug, PartialEq, Eq)]
pub struct MockHandle {
    /// Sequence number of this handle, unique per factory.
    pub id: u64,
}

#[derive(Debug, Default)]
struct MockShared {
    next_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    aborted: AtomicU64,
    fail_opens: AtomicU64,
    dead: Mutex<HashSet<u64>>,
    open_latency: Mutex<Duration>,
}

/// A scriptable factory for pool tests.
///
/// Clones share the same state, so tests keep a clone and inspect the
/// counters after handing the original to the pool.
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    shared: Arc<MockShared>,
}

impl MockFactory {
    /// Create a factory whose handles are numbered from zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `open` fail.
    pub fn fail_next_opens(&self, n: u64) {
        self.shared.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Add latency to every subsequent `open`.
    pub fn set_open_latency(&self, latency: Duration) {
        *self.shared.open_latency.lock() = latency;
    }

    /// Mark a handle as dead so it fails its next liveness probe.
    pub fn mark_dead(&self, id: u64) {
        self.shared.dead.lock().insert(id);
    }

    /// Number of handles opened so far.
    pub fn opened(&self) -> u64 {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Number of handles closed so far.
    pub fn closed(&self) -> u64 {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of handles aborted so far.
    pub fn aborted(&self) -> u64 {
        self.shared.aborted.load(Ordering::SeqCst)
    }
}

impl HandleFactory for MockFactory {
    type Handle = MockHandle;

    async fn open(&self) -> std::result::Result<MockHandle, BoxError> {
        let latency = *self.shared.open_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .shared
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("mock open failure".into());
        }
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockHandle {
            id: self.shared.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn validate(&self, handle: &MockHandle, _timeout: Duration) -> bool {
        !self.shared.dead.lock().contains(&handle.id)
    }

    async fn close(&self, _handle: &MockHandle) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn abort(&self, _handle: &MockHandle) {
        self.shared.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_both_ways() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now_millis(), 1_500);
        clock.rewind(Duration::from_millis(2_000));
        assert_eq!(clock.now_millis(), 0);
    }

    #[tokio::test]
    async fn mock_factory_scripts_failures_and_liveness() {
        let factory = MockFactory::new();
        factory.fail_next_opens(1);

        assert!(factory.open().await.is_err());
        let handle = factory.open().await.unwrap();
        assert_eq!(handle.id, 0);
        assert_eq!(factory.opened(), 1);

        assert!(factory.validate(&handle, Duration::from_secs(1)).await);
        factory.mark_dead(handle.id);
        assert!(!factory.validate(&handle, Duration::from_secs(1)).await);
    }
}
