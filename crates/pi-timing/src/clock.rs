//! Monotonic time source and blocking delays.
//!
//! Every timing consumer in the workspace reads time through the [`Clock`]
//! trait so tests can substitute a [`VirtualClock`] and exercise timing
//! properties without wall-clock delays.
//!
//! - [`MonotonicClock`]: `CLOCK_MONOTONIC` with a configurable
//!   [`SleepStrategy`]
//! - [`VirtualClock`]: discrete-event time that only moves when advanced or
//!   when every thread using it is asleep

use pi_common::config::SleepStrategy;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::ThreadId;
use std::time::Duration;

/// Monotonic time source with blocking delay primitives.
///
/// Timestamps never decrease and are unaffected by wall-clock adjustments.
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now_us(&self) -> u64;

    /// Current time in milliseconds.
    fn now_ms(&self) -> u64 {
        self.now_us() / 1_000
    }

    /// Block the calling thread for `us` microseconds.
    fn sleep_us(&self, us: u64);

    /// Block the calling thread for `ms` milliseconds.
    fn sleep_ms(&self, ms: u64) {
        self.sleep_us(ms.saturating_mul(1_000));
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn sleep_us(&self, us: u64) {
        (**self).sleep_us(us);
    }

    fn sleep_ms(&self, ms: u64) {
        (**self).sleep_ms(ms);
    }
}

/// The system monotonic clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonotonicClock {
    strategy: SleepStrategy,
}

impl MonotonicClock {
    /// Create a clock whose delays use `strategy`.
    #[must_use]
    pub fn new(strategy: SleepStrategy) -> Self {
        Self { strategy }
    }

    /// Create a clock that busy-waits for every delay.
    #[must_use]
    pub fn spinning() -> Self {
        Self::new(SleepStrategy::Spin)
    }

    /// The configured delay strategy.
    #[must_use]
    pub fn strategy(&self) -> SleepStrategy {
        self.strategy
    }

    fn spin_until(&self, deadline_us: u64) {
        while self.now_us() < deadline_us {
            std::hint::spin_loop();
        }
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        monotonic_us()
    }

    fn sleep_us(&self, us: u64) {
        if us == 0 {
            return;
        }
        match self.strategy {
            SleepStrategy::Os => os_sleep_us(us),
            SleepStrategy::Spin => {
                let deadline = self.now_us().saturating_add(us);
                self.spin_until(deadline);
            }
            SleepStrategy::Hybrid { spin_threshold_us } => {
                let deadline = self.now_us().saturating_add(us);
                if us > spin_threshold_us {
                    os_sleep_us(us - spin_threshold_us);
                }
                self.spin_until(deadline);
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn monotonic_us() -> u64 {
    use nix::time::{clock_gettime, ClockId};

    // CLOCK_MONOTONIC is always supported on Linux; the error arm is unreachable in practice.
    clock_gettime(ClockId::CLOCK_MONOTONIC).map_or(0, |ts| {
        (ts.tv_sec() as u64)
            .saturating_mul(1_000_000)
            .saturating_add(ts.tv_nsec() as u64 / 1_000)
    })
}

#[cfg(not(target_os = "linux"))]
fn monotonic_us() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Sleep on an absolute CLOCK_MONOTONIC deadline so signal interruptions
/// resume without stretching the delay.
#[cfg(target_os = "linux")]
fn os_sleep_us(us: u64) {
    use nix::errno::Errno;
    use nix::sys::time::TimeSpec;
    use nix::time::{clock_gettime, clock_nanosleep, ClockId, ClockNanosleepFlags};

    let Ok(now) = clock_gettime(ClockId::CLOCK_MONOTONIC) else {
        std::thread::sleep(Duration::from_micros(us));
        return;
    };
    let deadline = now + TimeSpec::from(Duration::from_micros(us));

    loop {
        match clock_nanosleep(
            ClockId::CLOCK_MONOTONIC,
            ClockNanosleepFlags::TIMER_ABSTIME,
            &deadline,
        ) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn os_sleep_us(us: u64) {
    std::thread::sleep(Duration::from_micros(us));
}

/// Manually driven clock for deterministic tests and host simulation.
///
/// Clones share the same time. Time moves when [`advance_us`] is called or
/// when sleepers make it move: a sleeping thread waits for its own deadline,
/// and once every thread woken by this clock has gone back to sleep (or
/// exited), time jumps to the earliest pending deadline. Several workers
/// sleeping on one clock therefore see the same timeline they would see on
/// a real clock, without real delays.
///
/// A thread that returns from a sleep counts as running until it sleeps on
/// the clock again or exits, so a thread that stops using the clock after
/// sleeping on it holds time still for the others.
///
/// [`advance_us`]: VirtualClock::advance_us
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    shared: Arc<VirtualShared>,
}

#[derive(Debug, Default)]
struct VirtualShared {
    state: Mutex<VirtualState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct VirtualState {
    now_us: u64,
    /// Deadline of every thread sleeping on the clock.
    sleeping: HashMap<ThreadId, u64>,
    /// Threads woken by the clock that have not slept again.
    running: HashSet<ThreadId>,
    /// Outstanding [`ClockHold`]s.
    holds: usize,
}

impl VirtualState {
    /// Move time to `now_us` and wake every sleeper whose deadline passed.
    fn set_now(&mut self, now_us: u64) {
        self.now_us = now_us;
        let due: Vec<ThreadId> = self
            .sleeping
            .iter()
            .filter(|(_, deadline)| **deadline <= now_us)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.sleeping.remove(&id);
            self.running.insert(id);
        }
    }

    fn earliest_deadline(&self) -> Option<u64> {
        self.sleeping.values().copied().min()
    }

    fn can_advance(&self) -> bool {
        self.running.is_empty() && self.holds == 0
    }
}

/// Keeps a [`VirtualClock`] from advancing on its own until dropped.
///
/// Explicit [`VirtualClock::advance_us`] calls still move time.
#[derive(Debug)]
#[must_use = "time is only held while the guard is alive"]
pub struct ClockHold {
    shared: Arc<VirtualShared>,
}

impl Drop for ClockHold {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.holds -= 1;
        drop(state);
        self.shared.changed.notify_all();
    }
}

/// Clocks the current thread has slept on; leaving them on thread exit
/// lets the remaining sleepers advance.
struct ClockMemberships {
    thread: ThreadId,
    clocks: Vec<Weak<VirtualShared>>,
}

impl Drop for ClockMemberships {
    fn drop(&mut self) {
        for shared in self.clocks.iter().filter_map(Weak::upgrade) {
            let mut state = shared.lock();
            state.running.remove(&self.thread);
            state.sleeping.remove(&self.thread);
            drop(state);
            shared.changed.notify_all();
        }
    }
}

thread_local! {
    static MEMBERSHIPS: RefCell<ClockMemberships> = RefCell::new(ClockMemberships {
        thread: std::thread::current().id(),
        clocks: Vec::new(),
    });
}

impl VirtualShared {
    fn lock(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VirtualClock {
    /// Create a virtual clock starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a virtual clock starting at `start_us`.
    #[must_use]
    pub fn starting_at(start_us: u64) -> Self {
        let clock = Self::default();
        clock.shared.lock().now_us = start_us;
        clock
    }

    /// Move time forward by `us` microseconds, waking sleepers whose
    /// deadline passed.
    pub fn advance_us(&self, us: u64) {
        let mut state = self.shared.lock();
        let target = state.now_us.saturating_add(us);
        state.set_now(target);
        drop(state);
        self.shared.changed.notify_all();
    }

    /// Move time forward by `ms` milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms.saturating_mul(1_000));
    }

    /// Move time forward to `us`. Earlier values are ignored.
    pub fn advance_to_us(&self, us: u64) {
        let mut state = self.shared.lock();
        if us > state.now_us {
            state.set_now(us);
        }
        drop(state);
        self.shared.changed.notify_all();
    }

    /// Stop sleepers from advancing time until the guard is dropped, so
    /// several threads can start sleeping from the same instant.
    pub fn hold(&self) -> ClockHold {
        self.shared.lock().holds += 1;
        ClockHold {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of threads currently sleeping on this clock.
    #[must_use]
    pub fn sleepers(&self) -> usize {
        self.shared.lock().sleeping.len()
    }

    fn join_current_thread(&self) {
        // Unavailable only while the thread is being torn down
        let _ = MEMBERSHIPS.try_with(|memberships| {
            let mut memberships = memberships.borrow_mut();
            memberships.clocks.retain(|clock| clock.strong_count() > 0);
            let ptr = Arc::as_ptr(&self.shared);
            if !memberships.clocks.iter().any(|clock| clock.as_ptr() == ptr) {
                memberships.clocks.push(Arc::downgrade(&self.shared));
            }
        });
    }
}

impl Clock for VirtualClock {
    fn now_us(&self) -> u64 {
        self.shared.lock().now_us
    }

    fn sleep_us(&self, us: u64) {
        if us == 0 {
            return;
        }
        self.join_current_thread();
        let me = std::thread::current().id();

        let mut state = self.shared.lock();
        state.running.remove(&me);
        let deadline = state.now_us.saturating_add(us);
        state.sleeping.insert(me, deadline);
        self.shared.changed.notify_all();

        while state.sleeping.contains_key(&me) {
            if state.can_advance() && state.earliest_deadline() == Some(deadline) {
                state.set_now(deadline);
                self.shared.changed.notify_all();
            } else {
                state = self
                    .shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

/// Milliseconds on the system monotonic clock.
#[must_use]
pub fn millis() -> u64 {
    monotonic_us() / 1_000
}

/// Microseconds on the system monotonic clock.
#[must_use]
pub fn micros() -> u64 {
    monotonic_us()
}

/// Busy-wait for `ms` milliseconds.
pub fn delay_ms(ms: u64) {
    MonotonicClock::spinning().sleep_ms(ms);
}

/// Busy-wait for `us` microseconds.
pub fn delay_us(us: u64) {
    MonotonicClock::spinning().sleep_us(us);
}
