//! Monotonic time source for the reactor
//!
//! The reactor never reads the wall clock directly. Every time-dependent
//! decision (idle timers, poll ceilings) goes through a [`Clock`], so tests
//! can drive a [`ManualClock`] forward deterministically while production
//! uses [`SystemClock`] over `std::time::Instant`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A point on a monotonic timeline, in microseconds since the clock's origin
///
/// Plain `u64` micros rather than `Instant` so test clocks can fabricate
/// values and the timing wheel can do exact truncating tick arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MonotonicTime {
    micros: u64,
}

impl MonotonicTime {
    /// The clock origin
    pub const ZERO: MonotonicTime = MonotonicTime { micros: 0 };

    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        MonotonicTime { micros }
    }

    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        MonotonicTime {
            micros: millis * 1_000,
        }
    }

    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.micros
    }

    /// Whole milliseconds since the origin (truncating)
    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.micros / 1_000
    }

    /// Microseconds elapsed since `earlier`, zero if `earlier` is ahead
    #[inline]
    pub const fn micros_since(self, earlier: MonotonicTime) -> u64 {
        self.micros.saturating_sub(earlier.micros)
    }

    #[inline]
    pub const fn add_millis(self, millis: u64) -> MonotonicTime {
        MonotonicTime {
            micros: self.micros + millis * 1_000,
        }
    }

    #[inline]
    pub const fn add_micros(self, micros: u64) -> MonotonicTime {
        MonotonicTime {
            micros: self.micros + micros,
        }
    }
}

/// Source of monotonic timestamps
///
/// Implementations must be cheap to call; the reactor samples the clock a
/// small constant number of times per cycle, never per handle.
pub trait Clock: Send + Sync {
    fn now(&self) -> MonotonicTime;
}

/// Production clock backed by `std::time::Instant`
///
/// All readings are relative to the instant the clock was created, so a
/// fresh `SystemClock` starts near [`MonotonicTime::ZERO`].
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonotonicTime {
        MonotonicTime::from_micros(self.origin.elapsed().as_micros() as u64)
    }
}

/// Test clock that advances only when told to
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start: MonotonicTime) -> Self {
        ManualClock {
            micros: AtomicU64::new(start.as_micros()),
        }
    }

    pub fn advance_millis(&self, millis: u64) {
        self.micros.fetch_add(millis * 1_000, Ordering::SeqCst);
    }

    pub fn advance_micros(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }

    pub fn set(&self, t: MonotonicTime) {
        self.micros.store(t.as_micros(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonotonicTime {
        MonotonicTime::from_micros(self.micros.load(Ordering::SeqCst))
    }
}
