//! Monotonic wall-clock sources. All times are `i64` nanoseconds.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Clock ticks per second
pub const TIME_FREQ: i64 = 1_000_000_000;

pub const fn millis(ms: i64) -> i64 {
    ms * (TIME_FREQ / 1000)
}

pub trait Clock {
    fn now(&self) -> i64;
}

/// Nanoseconds since the clock was created
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        i64::try_from(self.start.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Clock that only moves when told to; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<i64>>,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.set(now);
    }

    pub fn advance(&self, delta: i64) {
        self.now.set(self.now.get() + delta);
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance(millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.get()
    }
}
