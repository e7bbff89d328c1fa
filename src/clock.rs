#[cfg(test)]
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::cancel::{CancelToken, Cancelled};

/// Time source for the poll loop and the rate calculator.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Blocks for `duration`, returning early with `Cancelled` if the token fires.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<(), Cancelled>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<(), Cancelled> {
        cancel.wait_timeout(duration)
    }
}

/// Virtual clock for tests: `sleep` advances time instantly.
#[cfg(test)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
    slept: Mutex<Vec<Duration>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            slept: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<(), Cancelled> {
        cancel.check()?;
        self.slept.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        self.advance(duration);
        // let other threads observe progress between virtual sleeps
        std::thread::yield_now();
        Ok(())
    }
}
