//! RAII wrapper handed to clients.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use tokio::task::AbortHandle;

use crate::entry::PoolEntry;
use crate::factory::HandleFactory;
use crate::pool::PoolInner;

/// A borrowed handle.
///
/// Dereferences to the raw handle. Dropping the wrapper returns the handle
/// to the pool on every exit path, including panics; this is the only way a
/// borrow is released. To retire the handle instead of returning it, pass
/// the wrapper to [`Pool::evict`](crate::Pool::evict).
pub struct PooledHandle<F: HandleFactory> {
    pub(crate) entry: Option<Arc<PoolEntry<F::Handle>>>,
    pub(crate) pool: Weak<PoolInner<F>>,
    pub(crate) leak_task: Option<AbortHandle>,
}

impl<F: HandleFactory> Deref for PooledHandle<F> {
    type Target = F::Handle;

    fn deref(&self) -> &F::Handle {
        self.entry
            .as_ref()
            .expect("handle used after release")
            .handle()
    }
}

impl<F: HandleFactory> AsRef<F::Handle> for PooledHandle<F> {
    fn as_ref(&self) -> &F::Handle {
        self
    }
}

impl<F: HandleFactory> Drop for PooledHandle<F> {
    fn drop(&mut self) {
        if let Some(task) = self.leak_task.take() {
            task.abort();
        }
        if let Some(entry) = self.entry.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.recycle(entry);
            }
        }
    }
}

impl<F: HandleFactory> std::fmt::Debug for PooledHandle<F>
where
    F::Handle: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("handle", &self.entry.as_ref().map(|e| e.handle()))
            .finish()
    }
}
