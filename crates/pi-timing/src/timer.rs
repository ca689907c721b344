//! Drift-compensating periodic timer for non-blocking polling loops.
//!
//! A [`PeriodicTimer`] is polled from a control loop; it never blocks. On
//! expiry [`tick`](PeriodicTimer::tick) moves the next deadline forward by a
//! whole number of intervals, so the phase of the timer is anchored to the
//! moment it was set rather than to the moment it was noticed:
//!
//! ```text
//! interval = 10ms, set at t = 0
//!
//! deadlines   10        20        30        40        50        60
//!    ----------|---------|---------|---------|---------|---------|---
//! polls            ^13                                   ^55  ^56
//! tick()          true                                  true false
//! next_expiry     20                                     60   60
//! ```
//!
//! A late poll fires once and skips every period it missed. It neither
//! queues a burst of catch-up expiries nor restarts the interval from the
//! late poll, which would shift every following deadline.

use crate::clock::{Clock, MonotonicClock};
use tracing::trace;

/// Non-blocking periodic timer with lazy catch-up.
///
/// # Example
///
/// ```
/// use pi_timing::{PeriodicTimer, VirtualClock};
///
/// let clock = VirtualClock::new();
/// let mut timer = PeriodicTimer::with_clock(clock.clone(), 10);
///
/// assert!(!timer.tick());
///
/// clock.advance_ms(55);
/// assert!(timer.tick()); // fires once for the five missed periods
/// assert!(!timer.tick());
/// assert_eq!(timer.next_expiry(), 60);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PeriodicTimer<C: Clock = MonotonicClock> {
    /// Time source.
    clock: C,
    /// Period in milliseconds.
    interval_ms: u64,
    /// Absolute deadline in the clock's millisecond domain.
    next_expiry_ms: u64,
}

impl PeriodicTimer<MonotonicClock> {
    /// Create a timer on the system monotonic clock, first expiring
    /// `interval_ms` from now.
    #[must_use]
    pub fn new(interval_ms: u64) -> Self {
        Self::with_clock(MonotonicClock::default(), interval_ms)
    }
}

impl<C: Clock> PeriodicTimer<C> {
    /// Create a timer on `clock`, first expiring `interval_ms` from now.
    #[must_use]
    pub fn with_clock(clock: C, interval_ms: u64) -> Self {
        let now = clock.now_ms();
        let mut timer = Self {
            clock,
            interval_ms,
            next_expiry_ms: 0,
        };
        timer.set_at(interval_ms, now);
        timer
    }

    /// Restart the timer with a new interval, first expiring `interval_ms`
    /// from now.
    pub fn set(&mut self, interval_ms: u64) {
        let now = self.clock.now_ms();
        self.set_at(interval_ms, now);
    }

    /// [`set`](Self::set) with a caller-supplied current time.
    pub fn set_at(&mut self, interval_ms: u64, now_ms: u64) {
        self.interval_ms = interval_ms;
        self.next_expiry_ms = now_ms.saturating_add(interval_ms);
    }

    /// Check whether the deadline has passed, without advancing it.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.expired_at(self.clock.now_ms())
    }

    /// [`expired`](Self::expired) with a caller-supplied current time.
    #[must_use]
    pub fn expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.next_expiry_ms
    }

    /// Check for expiry and, if expired, advance past the current time.
    ///
    /// Returns `true` at most once per call regardless of how many periods
    /// elapsed since the last call.
    pub fn tick(&mut self) -> bool {
        let now = self.clock.now_ms();
        self.tick_at(now)
    }

    /// [`tick`](Self::tick) with a caller-supplied current time.
    pub fn tick_at(&mut self, now_ms: u64) -> bool {
        if now_ms < self.next_expiry_ms {
            return false;
        }

        // A zero interval can never step past `now`; fire on every poll.
        if self.interval_ms == 0 {
            self.next_expiry_ms = now_ms;
            return true;
        }

        let periods = (now_ms - self.next_expiry_ms) / self.interval_ms + 1;
        if periods > 1 {
            trace!(
                skipped = periods - 1,
                interval_ms = self.interval_ms,
                "Periodic timer skipped missed periods"
            );
        }
        self.next_expiry_ms = self
            .next_expiry_ms
            .saturating_add(periods.saturating_mul(self.interval_ms));
        true
    }

    /// Configured interval in milliseconds.
    #[must_use]
    pub fn interval(&self) -> u64 {
        self.interval_ms
    }

    /// Next deadline in the clock's millisecond domain.
    #[must_use]
    pub fn next_expiry(&self) -> u64 {
        self.next_expiry_ms
    }

    /// Milliseconds until the next deadline; zero once expired.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.next_expiry_ms.saturating_sub(self.clock.now_ms())
    }

    /// The timer's clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }
}
