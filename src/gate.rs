//! Admission gate for pool suspension.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const MAX_PERMITS: u32 = 10_000;

/// Either a no-op or a bounded permit set whose permits can be drained to
/// halt new borrows without shutting the pool down.
///
/// One permit is taken per borrow attempt and released when the attempt
/// finishes, so `suspend` draining every permit also waits out the borrows
/// already past the gate.
pub(crate) enum SuspendResumeLock {
    /// Suspension disabled: acquire and release are no-ops.
    Faux,
    /// Suspension enabled: a real permit set.
    Real(Arc<Semaphore>),
}

impl SuspendResumeLock {
    pub(crate) fn new(allow_suspension: bool) -> Self {
        if allow_suspension {
            Self::Real(Arc::new(Semaphore::new(MAX_PERMITS as usize)))
        } else {
            Self::Faux
        }
    }

    /// Take one admission permit. Blocks while the pool is suspended and
    /// fails with `PoolShutdown` if the pool shuts down mid-wait.
    pub(crate) async fn acquire(&self, shutdown: &CancellationToken) -> Result<()> {
        match self {
            Self::Faux => Ok(()),
            Self::Real(semaphore) => {
                tokio::select! {
                    permit = semaphore.acquire() => match permit {
                        Ok(permit) => {
                            permit.forget();
                            Ok(())
                        }
                        Err(_) => Err(Error::PoolShutdown),
                    },
                    () = shutdown.cancelled() => Err(Error::PoolShutdown),
                }
            }
        }
    }

    pub(crate) fn release(&self) {
        if let Self::Real(semaphore) = self {
            semaphore.add_permits(1);
        }
    }

    /// Drain every permit so new borrows park at admission. Completes once
    /// all in-flight borrow attempts have released their permits.
    pub(crate) async fn suspend(&self) {
        if let Self::Real(semaphore) = self {
            if let Ok(permits) = semaphore.acquire_many(MAX_PERMITS).await {
                permits.forget();
            }
        }
    }

    /// Restore the full permit set drained by [`suspend`](Self::suspend).
    pub(crate) fn resume(&self) {
        if let Self::Real(semaphore) = self {
            semaphore.add_permits(MAX_PERMITS as usize);
        }
    }
}
