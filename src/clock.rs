use parking_lot::Mutex;
use std::time::{Duration, Instant};

// Monotonic time source shared by the limiter and the cache
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

// Monotonic process clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
///
/// Starts at the instant it was created and advances by explicit steps,
/// so tests can cross refill periods without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, step: Duration) {
        *self.offset.lock() += step;
    }

    // How far the clock has been moved since creation
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}
