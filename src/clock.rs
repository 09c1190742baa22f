//! The monotonic millisecond tick source.
//!
//! Everything in this crate which talks about "now" goes through a [Clock]. The default,
//! [SystemClock], wraps [std::time::Instant]. Tests which need to exercise wraparound behavior
//! (see the dispatcher's modular tick arithmetic) inject a [ManualClock] instead, since waiting
//! for `u32::MAX` milliseconds of real time is not a reasonable thing to ask a test suite to do.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// A millisecond tick count. Wraps modulo `2^32`; see [tick_diff] for the comparison that
/// tolerates this.
pub type Tick = u32;

/// A source of monotonically increasing (modulo wraparound) millisecond ticks.
///
/// Implementations must never go backwards except by wrapping through `u32::MAX`.
pub trait Clock: Send + Sync {
    fn now(&self) -> Tick;
}

/// Compare two ticks using the modular arithmetic the dispatcher relies on throughout.
///
/// Returns a negative value if `a` precedes `b`, zero if equal, positive if `a` follows `b`. This
/// is correct across the wraparound boundary provided no two live deadlines differ by more than
/// half the tick range (`u32::MAX / 2` milliseconds, a little over 24 days) -- the same caveat
/// any wrapping-subtraction tick comparison carries.
#[inline]
pub(crate) fn tick_diff(a: Tick, b: Tick) -> i32 {
    a.wrapping_sub(b) as i32
}

/// The default [Clock]: milliseconds elapsed since this clock was constructed.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        // Truncating to u32 is the wraparound the rest of the crate is built to tolerate.
        self.origin.elapsed().as_millis() as u32
    }
}

/// A [Clock] whose value is set directly by the test driving it.
///
/// Used to seed a queue near the top of the tick range so that ordinary posts exercise the
/// wraparound path without waiting for it to occur naturally.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn new(initial: Tick) -> Self {
        Self {
            now: AtomicU32::new(initial),
        }
    }

    pub fn set(&self, value: Tick) {
        self.now.store(value, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: u32) -> Tick {
        self.now.fetch_add(delta_ms, Ordering::Relaxed).wrapping_add(delta_ms)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        self.now.load(Ordering::Relaxed)
    }
}

impl<T: Clock + ?Sized> Clock for std::sync::Arc<T> {
    fn now(&self) -> Tick {
        (**self).now()
    }
}
