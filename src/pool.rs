//! Pool engine: orchestrates creation, borrow, return, eviction,
//! suspension, and shutdown over the [`HandoffBag`].

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::bag::{BagBorrow, BagStateListener, HandoffBag, STATE_IN_USE, STATE_NOT_IN_USE};
use crate::clock::{Clock, SystemClock};
use crate::config::PoolOptions;
use crate::entry::PoolEntry;
use crate::error::{Error, Result, SharedCause};
use crate::factory::HandleFactory;
use crate::gate::SuspendResumeLock;
use crate::handle::PooledHandle;
use crate::housekeeper::Housekeeper;
use crate::metrics::{MetricsSink, NoopSink};

pub(crate) const POOL_NORMAL: u8 = 0;
pub(crate) const POOL_SUSPENDED: u8 = 1;
pub(crate) const POOL_SHUTDOWN: u8 = 2;

const CREATE_BACKOFF_START: Duration = Duration::from_millis(250);
const CREATE_BACKOFF_CEILING: Duration = Duration::from_secs(10);
const SHUTDOWN_STAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// A pool of expensive, reusable handles.
///
/// Cloning is cheap and shares the same pool. The pool must be constructed
/// and used inside a Tokio runtime; background maintenance runs on spawned
/// tasks. Call [`shutdown`](Self::shutdown) to close every handle before
/// dropping the last clone.
pub struct Pool<F: HandleFactory> {
    pub(crate) inner: Arc<PoolInner<F>>,
}

impl<F: HandleFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: HandleFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("total", &self.total())
            .field("active", &self.active())
            .field("idle", &self.idle())
            .field("waiting", &self.waiting())
            .finish()
    }
}

pub(crate) struct PoolInner<F: HandleFactory> {
    pub(crate) factory: F,
    pub(crate) options: PoolOptions,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) bag: HandoffBag<PoolEntry<F::Handle>>,

    connection_timeout_ms: AtomicU64,
    validation_timeout_ms: AtomicU64,
    leak_threshold_ms: AtomicU64,

    pub(crate) state: AtomicU8,
    pub(crate) total: AtomicUsize,
    pending_creations: AtomicUsize,

    gate: SuspendResumeLock,
    closer: Arc<Semaphore>,
    last_create_failure: Mutex<Option<Arc<dyn std::error::Error + Send + Sync>>>,
    shutdown_token: CancellationToken,
    weak_self: Weak<PoolInner<F>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<F: HandleFactory> Pool<F> {
    /// Create a new pool with the default clock and a no-op metrics sink.
    pub async fn new(factory: F, options: PoolOptions) -> Result<Self> {
        Self::build(
            factory,
            options,
            Arc::new(SystemClock::new()),
            Arc::new(NoopSink),
        )
        .await
    }

    /// Create a pool that reads time from `clock`. This is the seam tests
    /// use to drive the housekeeper's clock-skew branches.
    pub async fn with_clock(
        factory: F,
        options: PoolOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::build(factory, options, clock, Arc::new(NoopSink)).await
    }

    /// Create a pool that reports borrow statistics to `sink`.
    pub async fn with_metrics(
        factory: F,
        options: PoolOptions,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        Self::build(factory, options, Arc::new(SystemClock::new()), sink).await
    }

    async fn build(
        factory: F,
        options: PoolOptions,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        options.validate()?;

        if options.initialization_fail_fast {
            check_fail_fast(&factory, &options).await?;
        }

        let inner = Arc::new_cyclic(|weak| PoolInner {
            factory,
            clock,
            bag: HandoffBag::new(),
            connection_timeout_ms: AtomicU64::new(options.connection_timeout.as_millis() as u64),
            validation_timeout_ms: AtomicU64::new(options.validation_timeout.as_millis() as u64),
            leak_threshold_ms: AtomicU64::new(options.leak_detection_threshold.as_millis() as u64),
            state: AtomicU8::new(POOL_NORMAL),
            total: AtomicUsize::new(0),
            pending_creations: AtomicUsize::new(0),
            gate: SuspendResumeLock::new(options.allow_pool_suspension),
            closer: Arc::new(Semaphore::new(options.maximum_pool_size)),
            last_create_failure: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
            weak_self: weak.clone(),
            metrics,
            options,
        });

        let dyn_inner: Arc<dyn BagStateListener> = inner.clone();
        let listener: Weak<dyn BagStateListener> = Arc::downgrade(&dyn_inner);
        inner.bag.set_listener(listener);

        Housekeeper::spawn(
            Arc::downgrade(&inner),
            Arc::clone(&inner.clock),
            inner.options.housekeeping_period,
            inner.shutdown_token.clone(),
        );

        Ok(Self { inner })
    }

    /// Borrow a handle, waiting up to the configured `connection_timeout`.
    pub async fn borrow(&self) -> Result<PooledHandle<F>> {
        let timeout =
            Duration::from_millis(self.inner.connection_timeout_ms.load(Ordering::Acquire));
        self.inner.borrow(timeout).await
    }

    /// Borrow a handle, waiting up to `timeout`.
    pub async fn borrow_timeout(&self, timeout: Duration) -> Result<PooledHandle<F>> {
        self.inner.borrow(timeout).await
    }

    /// Retire a specific borrowed handle instead of returning it.
    pub async fn evict(&self, mut handle: PooledHandle<F>) {
        if let Some(task) = handle.leak_task.take() {
            task.abort();
        }
        if let Some(entry) = handle.entry.take() {
            self.inner
                .soft_evict(entry, "handle evicted by user", true)
                .await;
        }
    }

    /// Mark every current entry for retirement. In-use handles are closed
    /// when they come back; idle ones are closed immediately.
    pub async fn soft_evict_all(&self) {
        self.inner.soft_evict_all().await;
    }

    /// Halt new borrows without shutting down. Completes once every borrow
    /// attempt already past the admission gate has finished.
    ///
    /// Fails with [`Error::IllegalState`] unless `allow_pool_suspension`
    /// is set.
    pub async fn suspend(&self) -> Result<()> {
        self.inner.suspend().await
    }

    /// Reverse [`suspend`](Self::suspend) and refill the pool so waiters
    /// find handles.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Number of handles currently borrowed.
    pub fn active(&self) -> usize {
        self.inner.bag.count(STATE_IN_USE)
    }

    /// Number of idle handles.
    pub fn idle(&self) -> usize {
        self.inner.bag.count(STATE_NOT_IN_USE)
    }

    /// Number of live handles (idle + borrowed + reserved).
    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    /// Number of borrowers currently waiting for a handle.
    pub fn waiting(&self) -> usize {
        self.inner.bag.pending_waiters()
    }

    /// Change the default borrow deadline on a live pool.
    pub fn set_connection_timeout(&self, timeout: Duration) {
        self.inner
            .connection_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    /// Change the liveness-probe budget on a live pool.
    pub fn set_validation_timeout(&self, timeout: Duration) {
        self.inner
            .validation_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    /// Change the leak-detection threshold on a live pool. Zero disables.
    pub fn set_leak_detection_threshold(&self, threshold: Duration) {
        self.inner
            .leak_threshold_ms
            .store(threshold.as_millis() as u64, Ordering::Release);
    }

    /// Shut the pool down: close idle handles, abort in-use ones, and wait
    /// (bounded) for disposals to finish. Terminal and idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

async fn check_fail_fast<F: HandleFactory>(factory: &F, options: &PoolOptions) -> Result<()> {
    let handle = factory
        .open()
        .await
        .map_err(|source| Error::PoolInitialization {
            reason: "could not open initial handle".to_string(),
            source: Some(source),
        })?;
    let alive = factory.validate(&handle, options.validation_timeout).await;
    factory.close(&handle).await;
    if !alive {
        return Err(Error::PoolInitialization {
            reason: "initial handle failed validation".to_string(),
            source: None,
        });
    }
    Ok(())
}

impl<F: HandleFactory> PoolInner<F> {
    pub(crate) async fn borrow(
        self: &Arc<Self>,
        hard_timeout: Duration,
    ) -> Result<PooledHandle<F>> {
        if self.state.load(Ordering::Acquire) == POOL_SHUTDOWN {
            return Err(Error::PoolShutdown);
        }

        self.gate.acquire(&self.shutdown_token).await?;
        let _release = scopeguard::guard((), |()| self.gate.release());

        let start = self.clock.now_millis();
        let hard_ms = hard_timeout.as_millis() as u64;
        let alive_bypass_ms = self.options.alive_bypass_window.as_millis() as u64;
        let mut timeout = hard_timeout;

        loop {
            match self.bag.borrow(timeout).await {
                BagBorrow::Entry(entry) => {
                    let now = self.clock.now_millis();
                    if entry.is_evicted()
                        || (now.saturating_sub(entry.last_accessed()) > alive_bypass_ms
                            && !self.is_alive(&entry).await)
                    {
                        // Dead or retired handle: throw it away and retry
                        // within the remaining budget.
                        self.close_entry(entry, "handle is evicted or dead").await;
                        let elapsed = self.clock.elapsed_millis(start);
                        if elapsed >= hard_ms {
                            break;
                        }
                        timeout = Duration::from_millis(hard_ms - elapsed);
                        continue;
                    }

                    self.metrics
                        .record_borrow(Duration::from_millis(self.clock.elapsed_millis(start)));
                    return Ok(self.wrap(entry, now));
                }
                BagBorrow::TimedOut => break,
                BagBorrow::Closed => return Err(Error::Interrupted),
            }
        }

        self.log_pool_state("timeout failure ");
        self.metrics.record_timeout();
        let source = self
            .last_create_failure
            .lock()
            .clone()
            .map(|cause| Box::new(SharedCause(cause)) as crate::error::BoxError);
        Err(Error::BorrowTimeout {
            elapsed_ms: self.clock.elapsed_millis(start),
            source,
        })
    }

    /// Return a handle to the bag. Runs synchronously so the wrapper's
    /// `Drop` can release on every exit path.
    pub(crate) fn recycle(&self, entry: Arc<PoolEntry<F::Handle>>) {
        if self.state.load(Ordering::Acquire) == POOL_SHUTDOWN {
            tracing::debug!("handle returned after pool shutdown");
        }
        let now = self.clock.now_millis();
        self.metrics.record_usage(Duration::from_millis(
            now.saturating_sub(entry.last_accessed()),
        ));
        entry.touch(now);
        self.bag.requite(entry);
    }

    async fn is_alive(&self, entry: &Arc<PoolEntry<F::Handle>>) -> bool {
        let budget = Duration::from_millis(self.validation_timeout_ms.load(Ordering::Acquire));
        self.factory.validate(entry.handle(), budget).await
    }

    fn wrap(self: &Arc<Self>, entry: Arc<PoolEntry<F::Handle>>, now: u64) -> PooledHandle<F> {
        entry.touch(now);
        let leak_task = self.schedule_leak_check(&entry);
        PooledHandle {
            entry: Some(entry),
            pool: Arc::downgrade(self),
            leak_task,
        }
    }

    fn schedule_leak_check(
        &self,
        entry: &Arc<PoolEntry<F::Handle>>,
    ) -> Option<tokio::task::AbortHandle> {
        let threshold = self.leak_threshold_ms.load(Ordering::Acquire);
        if threshold == 0 {
            return None;
        }
        let weak_entry = Arc::downgrade(entry);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(threshold)).await;
            if weak_entry.upgrade().is_some() {
                tracing::warn!(
                    threshold_ms = threshold,
                    "apparent handle leak: borrowed handle not returned within threshold"
                );
            }
        });
        Some(task.abort_handle())
    }

    /// Mark an entry for retirement and close it if it can be claimed.
    ///
    /// With `owner` set the caller already holds the entry exclusively and
    /// closure proceeds directly. Otherwise the entry is reserved first; a
    /// concurrent borrower that wins the race observes the eviction mark
    /// and closes the entry itself.
    pub(crate) async fn soft_evict(
        self: &Arc<Self>,
        entry: Arc<PoolEntry<F::Handle>>,
        reason: &str,
        owner: bool,
    ) -> bool {
        entry.mark_evicted();
        if owner || self.bag.reserve(&entry) {
            self.close_entry(entry, reason).await;
            true
        } else {
            false
        }
    }

    pub(crate) async fn soft_evict_all(self: &Arc<Self>) {
        for entry in self.bag.values_all() {
            self.soft_evict(entry, "handle evicted", false).await;
        }
    }

    /// Detach an exclusively held entry and schedule disposal of its raw
    /// handle.
    pub(crate) async fn close_entry(
        self: &Arc<Self>,
        entry: Arc<PoolEntry<F::Handle>>,
        reason: &str,
    ) {
        if !self.bag.remove(&entry) {
            return;
        }
        if self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1))
            .is_err()
        {
            tracing::warn!("unexpected underflow of total handle count");
        }
        let handle = entry.close();
        self.dispose(handle, reason).await;
    }

    async fn dispose(self: &Arc<Self>, handle: Arc<F::Handle>, reason: &str) {
        tracing::debug!(reason, "closing handle");
        match Arc::clone(&self.closer).try_acquire_owned() {
            Ok(permit) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.factory.close(&handle).await;
                    drop(permit);
                });
            }
            Err(_) => {
                // Closer saturated: run on the caller so a close is never
                // dropped and the backlog cannot grow without bound.
                tracing::debug!("closer saturated, disposing on the caller");
                self.factory.close(&handle).await;
            }
        }
    }

    /// Request one background creation, discarding the request when enough
    /// are already queued. Housekeeping re-requests on the next tick, so a
    /// discarded request is never lost for good.
    pub(crate) fn request_creation(&self) {
        if self.state.load(Ordering::Acquire) != POOL_NORMAL {
            return;
        }
        let pending = self.pending_creations.fetch_add(1, Ordering::AcqRel);
        if pending >= self.options.maximum_pool_size {
            self.pending_creations.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let Some(inner) = self.weak_self.upgrade() else {
            self.pending_creations.fetch_sub(1, Ordering::AcqRel);
            return;
        };
        tokio::spawn(async move {
            inner.create_loop().await;
            inner.pending_creations.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Grow the pool by one handle, backing off on factory failure.
    async fn create_loop(self: &Arc<Self>) -> bool {
        let mut backoff = CREATE_BACKOFF_START;
        while self.state.load(Ordering::Acquire) == POOL_NORMAL
            && self.total.load(Ordering::Acquire) < self.options.maximum_pool_size
        {
            match self.create_entry().await {
                Some(entry) => {
                    self.total.fetch_add(1, Ordering::AcqRel);
                    if self.bag.add(Arc::clone(&entry)) {
                        return true;
                    }
                    // Bag closed while the handle was opening: dispose of
                    // the orphan directly.
                    self.total.fetch_sub(1, Ordering::AcqRel);
                    let handle = entry.close();
                    self.factory.close(&handle).await;
                    return false;
                }
                None => {
                    tokio::time::sleep(backoff).await;
                    let connection_timeout =
                        Duration::from_millis(self.connection_timeout_ms.load(Ordering::Acquire));
                    backoff = (backoff * 3 / 2)
                        .min(connection_timeout)
                        .min(CREATE_BACKOFF_CEILING);
                }
            }
        }
        false
    }

    async fn create_entry(self: &Arc<Self>) -> Option<Arc<PoolEntry<F::Handle>>> {
        match self.factory.open().await {
            Ok(handle) => {
                let now = self.clock.now_millis();
                let entry = Arc::new(PoolEntry::new(handle, now));
                self.schedule_eol(&entry);
                tracing::debug!("added handle to pool");
                Some(entry)
            }
            Err(err) => {
                if self.state.load(Ordering::Acquire) == POOL_NORMAL {
                    tracing::debug!(error = %err, "cannot open handle from factory");
                }
                *self.last_create_failure.lock() = Some(Arc::from(err));
                None
            }
        }
    }

    /// Schedule the end-of-life soft eviction at `max_lifetime` minus up to
    /// 2.5% variance, so a cohort of handles does not expire all at once.
    fn schedule_eol(self: &Arc<Self>, entry: &Arc<PoolEntry<F::Handle>>) {
        let max_lifetime = self.options.max_lifetime;
        if max_lifetime.is_zero() {
            return;
        }
        let lifetime = eol_lifetime(max_lifetime);

        let weak_pool = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);
        let task = tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            if let (Some(pool), Some(entry)) = (weak_pool.upgrade(), weak_entry.upgrade()) {
                pool.soft_evict(entry, "handle has passed max lifetime", false)
                    .await;
            }
        });
        entry.set_eol_task(task.abort_handle());
    }

    /// Top the pool up toward `minimum_idle`, bounded by `maximum_pool_size`
    /// and discounting creations already queued.
    pub(crate) fn fill_pool(&self) {
        let total = self.total.load(Ordering::Acquire);
        let idle = self.bag.count(STATE_NOT_IN_USE);
        let queued = self.pending_creations.load(Ordering::Acquire);
        let want = self
            .options
            .maximum_pool_size
            .saturating_sub(total)
            .min(self.options.minimum_idle.saturating_sub(idle))
            .saturating_sub(queued);
        for _ in 0..want {
            self.request_creation();
        }
        if want > 0 {
            tracing::debug!(adding = want, "filling pool toward minimum idle");
        }
    }

    pub(crate) async fn suspend(&self) -> Result<()> {
        if !matches!(self.gate, SuspendResumeLock::Real(_)) {
            return Err(Error::illegal_state("pool is not suspendable"));
        }
        match self.state.compare_exchange(
            POOL_NORMAL,
            POOL_SUSPENDED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.gate.suspend().await;
                Ok(())
            }
            Err(POOL_SUSPENDED) => Ok(()),
            Err(_) => Err(Error::PoolShutdown),
        }
    }

    pub(crate) fn resume(&self) {
        if self
            .state
            .compare_exchange(
                POOL_SUSPENDED,
                POOL_NORMAL,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.fill_pool();
            self.gate.resume();
        }
    }

    pub(crate) async fn shutdown(self: &Arc<Self>) {
        let previous = self.state.swap(POOL_SHUTDOWN, Ordering::AcqRel);
        if previous == POOL_SHUTDOWN {
            return;
        }
        tracing::info!("shutdown initiated");
        self.log_pool_state("before closing ");
        self.shutdown_token.cancel();

        self.soft_evict_all().await;

        // Let in-flight creations notice the state flip, bounded.
        let stage = tokio::time::Instant::now();
        while self.pending_creations.load(Ordering::Acquire) > 0
            && stage.elapsed() < SHUTDOWN_STAGE_TIMEOUT
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.bag.close();

        let stage = tokio::time::Instant::now();
        while self.total.load(Ordering::Acquire) > 0 && stage.elapsed() < SHUTDOWN_STAGE_TIMEOUT {
            self.abort_in_use().await;
            self.soft_evict_all().await;
            if self.total.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        // Wait for outstanding disposals by draining the closer permits.
        let drained = tokio::time::timeout(
            SHUTDOWN_STAGE_TIMEOUT,
            Arc::clone(&self.closer).acquire_many_owned(self.options.maximum_pool_size as u32),
        )
        .await;
        if let Ok(Ok(permits)) = drained {
            drop(permits);
        }

        self.log_pool_state("after closing ");
        tracing::info!("shutdown complete");
    }

    /// Forcibly terminate handles still held by clients. Shutdown only.
    async fn abort_in_use(self: &Arc<Self>) {
        for entry in self.bag.values(STATE_IN_USE) {
            self.factory.abort(entry.handle()).await;
            let _raw = entry.close();
            if self.bag.remove(&entry) {
                if self
                    .total
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1))
                    .is_err()
                {
                    tracing::warn!("unexpected underflow of total handle count");
                }
            }
        }
    }

    pub(crate) fn log_pool_state(&self, prefix: &str) {
        tracing::debug!(
            total = self.total.load(Ordering::Acquire),
            active = self.bag.count(STATE_IN_USE),
            idle = self.bag.count(STATE_NOT_IN_USE),
            waiting = self.bag.pending_waiters(),
            "{prefix}pool stats"
        );
    }
}

impl<F: HandleFactory> BagStateListener for PoolInner<F> {
    fn add_bag_item(&self, _waiting: usize) {
        self.request_creation();
    }
}

/// End-of-life deadline for a new entry: `max_lifetime` minus up to 2.5%
/// variance. Lifetimes of 10 s or less get no variance.
fn eol_lifetime(max_lifetime: Duration) -> Duration {
    let variance = if max_lifetime > Duration::from_secs(10) {
        max_lifetime.mul_f64(rand::random::<f64>() / 40.0)
    } else {
        Duration::ZERO
    };
    max_lifetime - variance
}
