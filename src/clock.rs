//! Time source used by the drivers and the sampling loop.
//!
//! Drivers never call `std::thread::sleep` or `Instant::now` directly; they go
//! through a [`Clock`] so that tests can substitute virtual time
//! (see [`crate::mock::MockClock`]).

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic time elapsed since the clock's epoch.
    fn now(&self) -> Duration;

    /// Blocks the calling thread for `duration`.
    fn sleep(&self, duration: Duration);

    /// One step of a busy-wait loop.
    fn tick(&self) {
        std::hint::spin_loop();
    }

    /// Waits up to `timeout` for `shutdown` to be raised. Returns `true` if it was.
    fn wait_for(&self, shutdown: &Shutdown, timeout: Duration) -> bool {
        self.sleep(timeout);
        shutdown.is_raised()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock implementation backed by `Instant` and `thread::sleep`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }

    fn wait_for(&self, shutdown: &Shutdown, timeout: Duration) -> bool {
        shutdown.wait_timeout(timeout)
    }
}

/// One-shot stop signal for a sampling thread.
#[derive(Debug, Default)]
pub struct Shutdown {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        *raised = true;
        self.cond.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until raised or until `timeout` elapses. Returns the raised state.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        clock.sleep(Duration::from_millis(2));
        assert!(clock.now() >= a + Duration::from_millis(2));
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let shutdown = Arc::new(Shutdown::new());
        let waiter = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));

        shutdown.raise();
        assert!(handle.join().unwrap());
        assert!(shutdown.is_raised());
    }

    #[test]
    fn test_shutdown_times_out_when_not_raised() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(1)));
    }
}
