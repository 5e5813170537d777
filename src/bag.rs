//! Concurrent handoff bag.
//!
//! A container specialized for pooled entries. Borrowing checks a
//! thread-local cache of recent returns first, then scans the shared list,
//! and only then parks as a waiter. Every claim is a single compare-exchange
//! on the entry's state atom; there is no lock around the handoff itself.
//! A return with waiters pending hands the entry to exactly one of them
//! directly, so a return never wakes more than one borrower.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use scopeguard::defer;
use tokio::sync::oneshot;

/// Entry state: idle, available for claim.
pub const STATE_NOT_IN_USE: u8 = 0;
/// Entry state: exclusively held by one borrower.
pub const STATE_IN_USE: u8 = 1;
/// Entry state: detached from the bag, terminal.
pub const STATE_REMOVED: u8 = 2;
/// Entry state: exclusively claimed by a maintenance task.
pub const STATE_RESERVED: u8 = 3;

/// An item the bag can manage: anything exposing an atomic state field.
///
/// All transitions happen through compare-exchange on the state atom; the
/// atom is the only synchronization for handoff correctness.
pub trait BagItem: Send + Sync + 'static {
    /// The state atom.
    fn state(&self) -> &AtomicU8;
}

/// Callback the bag fires when a borrower has to park as a waiter, giving
/// the owner the chance to enqueue creation of a new entry.
pub trait BagStateListener: Send + Sync {
    /// `waiting` is the number of parked borrowers, this one included.
    fn add_bag_item(&self, waiting: usize);
}

/// Outcome of [`HandoffBag::borrow`].
#[derive(Debug)]
pub enum BagBorrow<T> {
    /// An entry claimed for the caller, already in `STATE_IN_USE`.
    Entry(Arc<T>),
    /// The deadline elapsed with no entry available.
    TimedOut,
    /// The bag was closed while waiting.
    Closed,
}

thread_local! {
    // Most-recently-returned entries of every bag on this thread, newest
    // last. Weakly held: an entry evicted by housekeeping must never be
    // resurrected through this cache.
    static LAST_RETURNED: RefCell<VecDeque<(u64, Weak<dyn Any + Send + Sync>)>> =
        const { RefCell::new(VecDeque::new()) };
}

const LAST_RETURNED_CAP: usize = 16;

static NEXT_BAG_ID: AtomicU64 = AtomicU64::new(0);

/// Concurrent container of pool entries with direct waiter handoff.
pub struct HandoffBag<T: BagItem> {
    id: u64,
    entries: RwLock<Vec<Arc<T>>>,
    handoff: Mutex<VecDeque<oneshot::Sender<Arc<T>>>>,
    waiters: AtomicUsize,
    closed: AtomicBool,
    listener: Mutex<Option<Weak<dyn BagStateListener>>>,
}

impl<T: BagItem> Default for HandoffBag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: BagItem> HandoffBag<T> {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self {
            id: NEXT_BAG_ID.fetch_add(1, Ordering::Relaxed),
            entries: RwLock::new(Vec::new()),
            handoff: Mutex::new(VecDeque::new()),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    /// Attach the ran-dry listener. The bag holds only a weak reference so
    /// there is no ownership cycle with the pool.
    pub fn set_listener(&self, listener: Weak<dyn BagStateListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Insert a new entry in `STATE_NOT_IN_USE`. If borrowers are parked,
    /// one of them is offered this entry before anyone else can see it.
    ///
    /// Never blocks. Returns `false` if the bag is already closed, in which
    /// case the entry was not inserted and the caller must dispose of it.
    pub fn add(&self, entry: Arc<T>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!("add rejected: bag has been closed");
            return false;
        }
        self.entries.write().push(Arc::clone(&entry));
        if self.waiters.load(Ordering::Acquire) > 0 {
            self.hand_off(entry);
        }
        true
    }

    /// Borrow an entry, waiting up to `timeout` for one to become available.
    pub async fn borrow(&self, timeout: Duration) -> BagBorrow<T> {
        if self.closed.load(Ordering::Acquire) {
            return BagBorrow::Closed;
        }

        if let Some(entry) = self.borrow_cached() {
            return BagBorrow::Entry(entry);
        }
        if let Some(entry) = self.borrow_shared() {
            return BagBorrow::Entry(entry);
        }

        // The bag ran dry: park as a waiter and tell the listener. The
        // sender is published before the waiter count, so a producer that
        // observes a waiter is guaranteed to find its channel.
        let (tx, mut rx) = oneshot::channel();
        self.handoff.lock().push_back(tx);
        let waiting = self.waiters.fetch_add(1, Ordering::AcqRel) + 1;
        defer! {
            self.waiters.fetch_sub(1, Ordering::AcqRel);
        }
        if self.closed.load(Ordering::Acquire) {
            // Raced with close(); drop any sender close() did not drain so
            // this waiter (and any other late one) observes closure.
            self.handoff.lock().clear();
        }

        let listener = self.listener.lock().clone();
        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            listener.add_bag_item(waiting);
        }

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        tokio::select! {
            handed = &mut rx => match handed {
                // Entry CAS'd to STATE_IN_USE on our behalf by the producer.
                Ok(entry) => BagBorrow::Entry(entry),
                // Senders are only dropped when the bag closes.
                Err(_) => BagBorrow::Closed,
            },
            _ = &mut sleep => {
                // Deadline hit. Close the channel first so a concurrent
                // handoff either landed (drained below) or fails and the
                // producer reverts its claim.
                rx.close();
                match rx.try_recv() {
                    Ok(entry) => BagBorrow::Entry(entry),
                    Err(_) => BagBorrow::TimedOut,
                }
            }
        }
    }

    /// Return an entry to the bag.
    ///
    /// If borrowers are parked the entry is handed to one of them directly;
    /// otherwise it lands in the calling thread's most-recently-returned
    /// cache so the same thread re-borrows it without touching shared state.
    pub fn requite(&self, entry: Arc<T>) {
        entry.state().store(STATE_NOT_IN_USE, Ordering::Release);
        if self.waiters.load(Ordering::Acquire) > 0 && self.hand_off(Arc::clone(&entry)) {
            return;
        }
        self.cache_return(&entry);
    }

    /// Claim an idle entry exclusively for maintenance.
    pub fn reserve(&self, entry: &Arc<T>) -> bool {
        entry
            .state()
            .compare_exchange(
                STATE_NOT_IN_USE,
                STATE_RESERVED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Detach an entry from the bag. The caller must already hold it
    /// exclusively (`STATE_IN_USE` or `STATE_RESERVED`).
    pub fn remove(&self, entry: &Arc<T>) -> bool {
        let claimed = entry
            .state()
            .compare_exchange(
                STATE_IN_USE,
                STATE_REMOVED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
            || entry
                .state()
                .compare_exchange(
                    STATE_RESERVED,
                    STATE_REMOVED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        if !claimed && !self.closed.load(Ordering::Acquire) {
            tracing::warn!("attempt to remove an entry that is not borrowed or reserved");
            return false;
        }

        let mut entries = self.entries.write();
        match entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            Some(pos) => {
                entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the entries currently in `state`, in insertion order.
    pub fn values(&self, state: u8) -> Vec<Arc<T>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.state().load(Ordering::Acquire) == state)
            .cloned()
            .collect()
    }

    /// Snapshot of every entry in the bag.
    pub fn values_all(&self) -> Vec<Arc<T>> {
        self.entries.read().clone()
    }

    /// Number of entries currently in `state`.
    pub fn count(&self, state: u8) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| e.state().load(Ordering::Acquire) == state)
            .count()
    }

    /// Total number of entries in the bag.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the bag holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of borrowers currently parked waiting for an entry.
    pub fn pending_waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting borrows. Parked waiters are woken and observe
    /// [`BagBorrow::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.handoff.lock().clear();
    }

    /// Offer an idle entry to one parked waiter, claiming it on the
    /// waiter's behalf. A waiter that gave up reverts the claim and the
    /// next one is tried.
    ///
    /// Returns `true` when the entry is no longer the caller's concern:
    /// either a waiter took it, or a concurrent borrower won the claim.
    fn hand_off(&self, entry: Arc<T>) -> bool {
        loop {
            let waiter = self.handoff.lock().pop_front();
            let Some(tx) = waiter else {
                return false;
            };
            if entry
                .state()
                .compare_exchange(
                    STATE_NOT_IN_USE,
                    STATE_IN_USE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // A scanner claimed it first; give the waiter its turn back.
                self.handoff.lock().push_front(tx);
                return true;
            }
            match tx.send(Arc::clone(&entry)) {
                Ok(()) => return true,
                Err(returned) => {
                    // The waiter timed out or was cancelled; release the
                    // claim and try the next one.
                    drop(returned);
                    entry.state().store(STATE_NOT_IN_USE, Ordering::Release);
                }
            }
        }
    }

    fn borrow_cached(&self) -> Option<Arc<T>> {
        LAST_RETURNED.with(|cell| {
            let mut cache = cell.borrow_mut();
            let mut i = cache.len();
            while i > 0 {
                i -= 1;
                if cache[i].0 != self.id {
                    continue;
                }
                let Some((_, weak)) = cache.remove(i) else {
                    continue;
                };
                if let Some(cached) = weak.upgrade() {
                    if let Ok(entry) = cached.downcast::<T>() {
                        if entry
                            .state()
                            .compare_exchange(
                                STATE_NOT_IN_USE,
                                STATE_IN_USE,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return Some(entry);
                        }
                    }
                }
            }
            None
        })
    }

    fn borrow_shared(&self) -> Option<Arc<T>> {
        let entries = self.entries.read();
        for entry in entries.iter() {
            if entry
                .state()
                .compare_exchange(
                    STATE_NOT_IN_USE,
                    STATE_IN_USE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(Arc::clone(entry));
            }
        }
        None
    }

    fn cache_return(&self, entry: &Arc<T>) {
        let erased: Arc<dyn Any + Send + Sync> = Arc::clone(entry) as Arc<dyn Any + Send + Sync>;
        let weak = Arc::downgrade(&erased);
        LAST_RETURNED.with(|cell| {
            let mut cache = cell.borrow_mut();
            cache.push_back((self.id, weak));
            if cache.len() > LAST_RETURNED_CAP {
                cache.pop_front();
            }
        });
    }
}

impl<T: BagItem> std::fmt::Debug for HandoffBag<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffBag")
            .field("size", &self.len())
            .field("waiters", &self.pending_waiters())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestItem {
        state: AtomicU8,
        tag: u32,
    }

    impl TestItem {
        fn new(tag: u32) -> Arc<Self> {
            Arc::new(Self {
                state: AtomicU8::new(STATE_NOT_IN_USE),
                tag,
            })
        }
    }

    impl BagItem for TestItem {
        fn state(&self) -> &AtomicU8 {
            &self.state
        }
    }

    #[tokio::test]
    async fn add_then_borrow_claims_entry() {
        let bag = HandoffBag::new();
        assert!(bag.add(TestItem::new(1)));

        let borrowed = bag.borrow(Duration::from_millis(100)).await;
        let entry = match borrowed {
            BagBorrow::Entry(e) => e,
            other => panic!("expected entry, got {other:?}"),
        };
        assert_eq!(entry.state.load(Ordering::Acquire), STATE_IN_USE);
        assert_eq!(bag.count(STATE_NOT_IN_USE), 0);
        assert_eq!(bag.count(STATE_IN_USE), 1);
    }

    #[tokio::test]
    async fn borrow_empty_bag_times_out() {
        let bag = HandoffBag::<TestItem>::new();
        let start = std::time::Instant::now();
        let borrowed = bag.borrow(Duration::from_millis(100)).await;
        assert!(matches!(borrowed, BagBorrow::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(bag.pending_waiters(), 0, "waiter count must unwind");
    }

    #[tokio::test]
    async fn requite_hands_off_to_parked_waiter() {
        let bag = Arc::new(HandoffBag::new());
        let entry = TestItem::new(7);
        assert!(bag.add(Arc::clone(&entry)));

        // Claim the only entry so the second borrower must park.
        let held = match bag.borrow(Duration::from_millis(100)).await {
            BagBorrow::Entry(e) => e,
            other => panic!("expected entry, got {other:?}"),
        };

        let bag2 = Arc::clone(&bag);
        let waiter = tokio::spawn(async move { bag2.borrow(Duration::from_secs(2)).await });

        // Let the waiter park before returning.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bag.pending_waiters(), 1);
        bag.requite(held);

        match waiter.await.unwrap() {
            BagBorrow::Entry(e) => assert_eq!(e.tag, 7),
            other => panic!("expected handed-off entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_thread_reborrow_hits_cache() {
        let bag = HandoffBag::new();
        let entry = TestItem::new(3);
        assert!(bag.add(Arc::clone(&entry)));

        let first = match bag.borrow(Duration::from_millis(100)).await {
            BagBorrow::Entry(e) => e,
            other => panic!("expected entry, got {other:?}"),
        };
        bag.requite(first);

        // Add a second entry; the cached one must still win.
        assert!(bag.add(TestItem::new(4)));
        let second = match bag.borrow(Duration::from_millis(100)).await {
            BagBorrow::Entry(e) => e,
            other => panic!("expected entry, got {other:?}"),
        };
        assert_eq!(second.tag, 3);
    }

    #[tokio::test]
    async fn cache_never_resurrects_removed_entry() {
        let bag = HandoffBag::new();
        let entry = TestItem::new(9);
        assert!(bag.add(Arc::clone(&entry)));

        let held = match bag.borrow(Duration::from_millis(100)).await {
            BagBorrow::Entry(e) => e,
            other => panic!("expected entry, got {other:?}"),
        };
        bag.requite(Arc::clone(&held));

        // Reserve and remove it out from under the cache.
        assert!(bag.reserve(&held));
        assert!(bag.remove(&held));
        drop(held);
        drop(entry);

        let borrowed = bag.borrow(Duration::from_millis(50)).await;
        assert!(
            matches!(borrowed, BagBorrow::TimedOut),
            "removed entry must not be served from the cache"
        );
    }

    #[tokio::test]
    async fn reserve_blocks_borrow_and_remove_detaches() {
        let bag = HandoffBag::new();
        let entry = TestItem::new(5);
        assert!(bag.add(Arc::clone(&entry)));

        assert!(bag.reserve(&entry));
        assert!(!bag.reserve(&entry), "double reserve must fail");
        assert_eq!(bag.count(STATE_RESERVED), 1);

        let borrowed = bag.borrow(Duration::from_millis(50)).await;
        assert!(matches!(borrowed, BagBorrow::TimedOut));

        assert!(bag.remove(&entry));
        assert_eq!(bag.len(), 0);
        assert_eq!(entry.state.load(Ordering::Acquire), STATE_REMOVED);
    }

    #[tokio::test]
    async fn remove_requires_exclusive_hold() {
        let bag = HandoffBag::new();
        let entry = TestItem::new(6);
        assert!(bag.add(Arc::clone(&entry)));

        // Still NOT_IN_USE: remove must refuse.
        assert!(!bag.remove(&entry));
        assert_eq!(bag.len(), 1);
    }

    #[tokio::test]
    async fn close_wakes_parked_waiters() {
        let bag = Arc::new(HandoffBag::<TestItem>::new());
        let bag2 = Arc::clone(&bag);
        let waiter = tokio::spawn(async move { bag2.borrow(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        bag.close();

        let borrowed = waiter.await.unwrap();
        assert!(matches!(borrowed, BagBorrow::Closed));
        assert!(matches!(
            bag.borrow(Duration::from_millis(10)).await,
            BagBorrow::Closed
        ));
    }

    #[tokio::test]
    async fn add_after_close_is_rejected() {
        let bag = HandoffBag::new();
        bag.close();
        assert!(!bag.add(TestItem::new(1)));
        assert_eq!(bag.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_borrowers_each_get_distinct_entries() {
        let bag = Arc::new(HandoffBag::new());
        for tag in 0..8 {
            assert!(bag.add(TestItem::new(tag)));
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let bag = Arc::clone(&bag);
            tasks.push(tokio::spawn(async move {
                match bag.borrow(Duration::from_secs(2)).await {
                    BagBorrow::Entry(e) => e.tag,
                    other => panic!("expected entry, got {other:?}"),
                }
            }));
        }

        let mut tags = Vec::new();
        for task in tasks {
            tags.push(task.await.unwrap());
        }
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), 8, "no entry may be handed to two borrowers");
    }
}
