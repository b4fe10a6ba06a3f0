use parking_lot::Mutex;
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Source of monotonic time for the engine's age and timeout decisions.
///
/// Production code uses [`SystemTimeProvider`]; tests drive
/// [`ManualTimeProvider`] by hand so timeout behavior is deterministic.
pub trait TimeProvider: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manual clock for deterministic simulations.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: Mutex<Instant>,
}

impl ManualTimeProvider {
    pub fn new(start: Instant) -> Self {
        Self {
            instant: Mutex::new(start),
        }
    }

    pub fn set_time(&self, instant: Instant) {
        *self.instant.lock() = instant;
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.lock() += duration;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now(&self) -> Instant {
        *self.instant.lock()
    }
}
