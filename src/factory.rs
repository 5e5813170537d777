//! Handle factory trait
//!
//! The [`HandleFactory`] trait defines how to open, probe, and dispose of
//! the raw handles a pool manages. The pool owns every other aspect of the
//! handle lifecycle.

use std::future::Future;
use std::time::Duration;

use crate::error::BoxError;

/// Factory for the raw handles the pool manages.
///
/// `open` runs on background creator tasks. `validate` is the liveness probe
/// run on borrow when a handle has been idle past the alive-bypass window.
/// `close` disposes a handle permanently and must absorb its own failures.
/// `abort` forcibly terminates a handle and is only called during shutdown,
/// on handles that may still be held by a client.
pub trait HandleFactory: Send + Sync + 'static {
    /// The raw handle type produced by this factory.
    type Handle: Send + Sync + 'static;

    /// Open a new handle.
    fn open(&self) -> impl Future<Output = std::result::Result<Self::Handle, BoxError>> + Send;

    /// Probe whether `handle` is still alive, spending at most `timeout`.
    fn validate(
        &self,
        _handle: &Self::Handle,
        _timeout: Duration,
    ) -> impl Future<Output = bool> + Send {
        async { true }
    }

    /// Dispose of a handle. Must be idempotent and swallow errors.
    fn close(&self, _handle: &Self::Handle) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Best-effort forced termination, used only during shutdown.
    fn abort(&self, handle: &Self::Handle) -> impl Future<Output = ()> + Send {
        self.close(handle)
    }
}
