//! Millisecond ticks and the poll-loop clock.
//!
//! This module provides the time primitives the poll loop relies on:
//!
//! - [`Tick`] arithmetic on a wrapping millisecond counter, where
//!   [`TICK_ETERNITY`] (zero) means "no deadline",
//! - [`Clock`], a monotonic clock refreshed around each kernel wait,
//!   with idle-time accounting for load metrics.
//!
//! Tick comparisons are wrapping by design so that deadlines keep
//! working across counter roll-over: a tick is expired when the signed
//! distance to `now` is not positive.

use std::time::{Duration, Instant};

/// A point in time expressed in wrapping milliseconds.
pub type Tick = u32;

/// The tick that never expires.
pub const TICK_ETERNITY: Tick = 0;

/// Longest single kernel wait, in milliseconds.
///
/// Bounding the wait keeps the loop responsive to deadline roll-over
/// and external state changes even when no descriptor fires.
pub const MAX_DELAY_MS: i32 = 60_000;

/// Window over which the idle ratio is recomputed.
const IDLE_SAMPLE: Duration = Duration::from_millis(100);

/// Returns whether `tick` is expired relative to `now`.
///
/// [`TICK_ETERNITY`] never expires.
#[inline]
pub fn tick_is_expired(tick: Tick, now: Tick) -> bool {
    tick != TICK_ETERNITY && (tick.wrapping_sub(now) as i32) <= 0
}

/// Milliseconds remaining from `now` until `exp`, zero if already
/// expired. `exp` must not be [`TICK_ETERNITY`].
#[inline]
pub fn tick_remain(now: Tick, exp: Tick) -> u32 {
    if tick_is_expired(exp, now) {
        return 0;
    }

    exp.wrapping_sub(now)
}

/// Monotonic clock driving the poll loop.
///
/// The clock is refreshed after every kernel wait rather than on each
/// read: within one tick all decisions see the same `now_ms`. Time spent
/// blocked in the kernel wait is accounted as idle and folded into an
/// idle percentage over a short sliding window.
pub struct Clock {
    /// Origin of the tick counter.
    origin: Instant,

    /// Milliseconds elapsed since `origin`, refreshed around waits.
    now_ms: Tick,

    /// Timestamp taken right before entering the kernel wait.
    before_poll: Instant,

    /// Start of the current idle sample window.
    window_start: Instant,

    /// Idle time accumulated in the current window.
    idle_in_window: Duration,

    /// Last computed idle percentage (0–100).
    idle_pct: u32,
}

impl Clock {
    /// Creates a clock anchored at the current instant.
    pub fn new() -> Self {
        let now = Instant::now();

        Self {
            origin: now,
            now_ms: 0,
            before_poll: now,
            window_start: now,
            idle_in_window: Duration::ZERO,
            idle_pct: 100,
        }
    }

    /// Current tick, as of the last refresh.
    pub fn now_ms(&self) -> Tick {
        self.now_ms
    }

    /// Share of recent wall time spent blocked in the kernel wait.
    pub fn idle_pct(&self) -> u32 {
        self.idle_pct
    }

    /// Refreshes `now_ms` from the monotonic source.
    pub(crate) fn update_now(&mut self) {
        self.now_ms = self.origin.elapsed().as_millis() as Tick;
    }

    /// Records the pre-wait timestamp.
    pub(crate) fn enter_poll(&mut self) {
        self.before_poll = Instant::now();
    }

    /// Accounts the completed wait as idle time and refreshes the tick.
    pub(crate) fn leave_poll(&mut self) {
        let now = Instant::now();

        self.idle_in_window += now - self.before_poll;
        self.now_ms = (now - self.origin).as_millis() as Tick;

        let window = now - self.window_start;
        if window >= IDLE_SAMPLE {
            let idle = self.idle_in_window.as_micros() * 100;
            self.idle_pct = (idle / window.as_micros().max(1)) as u32;
            self.window_start = now;
            self.idle_in_window = Duration::ZERO;
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
