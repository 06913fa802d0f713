//! Wall-clock sources used for expiration math.

use std::fmt::Debug;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

/// A source of the current wall-clock time.
///
/// Expiration columns are compared against this value, so every process
/// sharing a database must agree on it to within the TTLs in use.
pub trait Clock: Send + Sync + Debug {
    /// Seconds since the Unix epoch, with sub-second precision.
    fn now(&self) -> f64;

    /// Whole seconds since the Unix epoch.
    fn now_secs(&self) -> i64 {
        self.now().floor() as i64
    }
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `now` seconds since the epoch.
    pub fn new(now: f64) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Create a clock frozen at the current system time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_secs_f64();
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
