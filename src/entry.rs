//! One pooled slot: a raw handle plus the state machinery around it.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::bag::{BagItem, STATE_NOT_IN_USE};

/// One pooled slot. Owns the raw handle exclusively until removed; the
/// state atom encodes who currently holds the slot.
pub(crate) struct PoolEntry<T> {
    handle: Arc<T>,
    state: AtomicU8,
    evicted: AtomicBool,
    created_at: u64,
    last_accessed: AtomicU64,
    eol_task: Mutex<Option<AbortHandle>>,
}

impl<T> PoolEntry<T> {
    pub(crate) fn new(handle: T, now: u64) -> Self {
        Self {
            handle: Arc::new(handle),
            state: AtomicU8::new(STATE_NOT_IN_USE),
            evicted: AtomicBool::new(false),
            created_at: now,
            last_accessed: AtomicU64::new(now),
            eol_task: Mutex::new(None),
        }
    }

    pub(crate) fn handle(&self) -> &Arc<T> {
        &self.handle
    }

    /// Flag the entry for retirement. The next successful claim routes it
    /// to closure instead of a client.
    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub(crate) fn created_at(&self) -> u64 {
        self.created_at
    }

    pub(crate) fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Acquire)
    }

    /// Stamp the entry as just used.
    pub(crate) fn touch(&self, now: u64) {
        self.last_accessed.store(now, Ordering::Release);
    }

    /// Attach the cancellable end-of-life timer.
    pub(crate) fn set_eol_task(&self, task: AbortHandle) {
        *self.eol_task.lock() = Some(task);
    }

    /// Cancel the end-of-life timer and yield the raw handle for disposal.
    pub(crate) fn close(&self) -> Arc<T> {
        if let Some(task) = self.eol_task.lock().take() {
            task.abort();
        }
        Arc::clone(&self.handle)
    }
}

impl<T: Send + Sync + 'static> BagItem for PoolEntry<T> {
    fn state(&self) -> &AtomicU8 {
        &self.state
    }
}

impl<T> std::fmt::Debug for PoolEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("state", &self.state.load(Ordering::Acquire))
            .field("evicted", &self.is_evicted())
            .field("created_at", &self.created_at)
            .field("last_accessed", &self.last_accessed())
            .finish()
    }
}
