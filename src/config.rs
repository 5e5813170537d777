//! Pool configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a [`Pool`](crate::Pool).
///
/// `connection_timeout`, `validation_timeout` and `leak_detection_threshold`
/// can be changed on a live pool through the corresponding setters; the new
/// values take effect on the next borrow.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolOptions {
    /// Target number of idle handles the housekeeper maintains
    pub minimum_idle: usize,
    /// Hard cap on live handles
    pub maximum_pool_size: usize,
    /// Default borrow deadline
    pub connection_timeout: Duration,
    /// Budget handed to the factory for a single liveness probe
    pub validation_timeout: Duration,
    /// Handle age cap; zero disables retirement by age
    pub max_lifetime: Duration,
    /// Maximum idle residency above `minimum_idle`; zero disables pruning
    pub idle_timeout: Duration,
    /// Borrow duration after which a leak warning is logged; zero disables
    pub leak_detection_threshold: Duration,
    /// Whether `suspend`/`resume` are permitted
    pub allow_pool_suspension: bool,
    /// Open and validate one handle synchronously during construction
    pub initialization_fail_fast: bool,
    /// Fixed delay between housekeeping ticks
    pub housekeeping_period: Duration,
    /// Recency window inside which the liveness probe is skipped on borrow
    pub alive_bypass_window: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            minimum_idle: 10,
            maximum_pool_size: 10,
            connection_timeout: Duration::from_secs(30),
            validation_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            leak_detection_threshold: Duration::ZERO,
            allow_pool_suspension: false,
            initialization_fail_fast: true,
            housekeeping_period: Duration::from_secs(30),
            alive_bypass_window: Duration::from_millis(500),
        }
    }
}

impl PoolOptions {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.maximum_pool_size == 0 {
            return Err(Error::configuration(
                "maximum_pool_size must be greater than 0",
            ));
        }
        if self.minimum_idle > self.maximum_pool_size {
            return Err(Error::configuration(format!(
                "minimum_idle ({}) must not exceed maximum_pool_size ({})",
                self.minimum_idle, self.maximum_pool_size
            )));
        }
        if self.connection_timeout.is_zero() {
            return Err(Error::configuration(
                "connection_timeout must be greater than zero",
            ));
        }
        if self.validation_timeout.is_zero() {
            return Err(Error::configuration(
                "validation_timeout must be greater than zero",
            ));
        }
        if self.housekeeping_period.is_zero() {
            return Err(Error::configuration(
                "housekeeping_period must be greater than zero",
            ));
        }
        Ok(())
    }
}
