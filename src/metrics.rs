//! Borrow metrics sink.
//!
//! The pool reports borrow waits, handle usage spans, and borrow timeouts
//! through [`MetricsSink`]. The default sink drops everything; the
//! `metrics` feature adds an adapter that forwards to the `metrics` facade.

use std::time::Duration;

/// Sink for pool statistics.
pub trait MetricsSink: Send + Sync + 'static {
    /// A borrow completed successfully after waiting `wait`.
    fn record_borrow(&self, wait: Duration) {
        let _ = wait;
    }

    /// A handle was returned after being out for `usage`.
    fn record_usage(&self, usage: Duration) {
        let _ = usage;
    }

    /// A borrow attempt exhausted its deadline.
    fn record_timeout(&self) {}
}

/// Default sink: drops every record.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {}

/// Sink that forwards to the `metrics` facade, labelled by pool name.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct FacadeSink {
    pool_name: String,
}

#[cfg(feature = "metrics")]
impl FacadeSink {
    /// Create a sink labelling every record with `pool_name`.
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
        }
    }
}

#[cfg(feature = "metrics")]
impl MetricsSink for FacadeSink {
    fn record_borrow(&self, wait: Duration) {
        metrics::counter!("pool.borrow.total", "pool" => self.pool_name.clone()).increment(1);
        metrics::histogram!("pool.borrow.wait_seconds", "pool" => self.pool_name.clone())
            .record(wait.as_secs_f64());
    }

    fn record_usage(&self, usage: Duration) {
        metrics::histogram!("pool.usage.duration_seconds", "pool" => self.pool_name.clone())
            .record(usage.as_secs_f64());
    }

    fn record_timeout(&self) {
        metrics::counter!("pool.borrow.timeout.total", "pool" => self.pool_name.clone())
            .increment(1);
    }
}
