//! Software PWM engine.
//!
//! Each active pin owns one worker thread that toggles the pin through a
//! [`DigitalOutputPort`] and sleeps on a [`Clock`] between edges:
//!
//! ```text
//! period_us = 1_000_000 / frequency_hz
//!
//!  duty = 30          on_us = period * 30 / 100, off_us = period - on_us
//!  HIGH  ┌─────┐            ┌─────┐
//!  LOW ──┘     └────────────┘     └──────
//!        |<on->|<---off---->|
//! ```
//!
//! The controlling thread changes duty with plain atomic stores; workers
//! pick the new value up at the start of their next period. The slot table
//! is guarded by one mutex that is never held while a worker sleeps or
//! while `stop` joins a worker.

use crossbeam_utils::CachePadded;
use pi_common::config::SoftPwmConfig;
use pi_common::error::{ToolkitError, ToolkitResult};
use pi_common::pin::{Level, Pin, PinMode};
use pi_gpio::DigitalOutputPort;
use pi_timing::{Clock, MonotonicClock};
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Default number of simultaneously active pins.
pub const DEFAULT_CAPACITY: usize = 8;

/// Frequency used when none (or a non-positive one) is given.
pub const DEFAULT_FREQUENCY_HZ: u32 = 100;

/// Largest duty cycle in percent.
pub const MAX_DUTY: u8 = 100;

/// Period in microseconds for `frequency_hz`, falling back to
/// `default_hz` when `frequency_hz <= 0`.
///
/// Never returns zero.
#[must_use]
pub fn period_for(frequency_hz: i32, default_hz: u32) -> u64 {
    let hz = u32::try_from(frequency_hz)
        .ok()
        .filter(|hz| *hz > 0)
        .unwrap_or(default_hz)
        .max(1);
    (1_000_000 / u64::from(hz)).max(1)
}

/// Split one period into HIGH and LOW time for `duty` percent.
///
/// Duty values above 100 are treated as 100.
#[must_use]
pub fn split_period(period_us: u64, duty: u8) -> (u64, u64) {
    match duty {
        0 => (0, period_us),
        d if d >= MAX_DUTY => (period_us, 0),
        d => {
            let on = period_us * u64::from(d) / u64::from(MAX_DUTY);
            (on, period_us - on)
        }
    }
}

/// State shared between the engine and one worker.
#[derive(Debug)]
struct SlotShared {
    duty: AtomicU8,
    period_us: AtomicU64,
    running: AtomicBool,
}

impl SlotShared {
    fn new(period_us: u64) -> Self {
        Self {
            duty: AtomicU8::new(0),
            period_us: AtomicU64::new(period_us),
            running: AtomicBool::new(true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Running,
    /// A `stop` call is joining the worker; the slot is not yet free.
    Stopping,
}

#[derive(Debug)]
struct Slot {
    pin: Pin,
    state: SlotState,
    shared: Arc<CachePadded<SlotShared>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct SlotTable {
    slots: Vec<Option<Slot>>,
}

impl SlotTable {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    fn position(&self, pin: Pin) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.pin == pin))
    }

    fn get(&self, pin: Pin) -> Option<&Slot> {
        self.slots.iter().flatten().find(|s| s.pin == pin)
    }

    fn running(&self, pin: Pin) -> Option<&Slot> {
        self.get(pin).filter(|s| s.state == SlotState::Running)
    }

    fn is_stopping(&self, pin: Pin) -> bool {
        self.get(pin)
            .is_some_and(|s| s.state == SlotState::Stopping)
    }

    fn free_index(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }
}

/// Decrements the live worker count when a worker exits, including by panic.
struct LiveWorker(Arc<AtomicUsize>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fixed-capacity set of software PWM channels, one worker thread each.
///
/// All methods take `&self`; the engine can be shared across threads
/// behind an `Arc`. Dropping the engine stops every worker and leaves
/// their pins LOW.
pub struct PwmEngine {
    port: Arc<dyn DigitalOutputPort>,
    clock: Arc<dyn Clock>,
    table: Mutex<SlotTable>,
    /// Signalled whenever a stopping slot is freed.
    slot_freed: Condvar,
    live_workers: Arc<AtomicUsize>,
    /// Worker stack size in bytes; 0 selects the platform default.
    stack_size: AtomicUsize,
    capacity: usize,
    default_frequency_hz: u32,
}

assert_impl_all!(PwmEngine: Send, Sync);

impl PwmEngine {
    /// Create an engine with the default capacity and frequency on the
    /// system monotonic clock.
    #[must_use]
    pub fn new(port: Arc<dyn DigitalOutputPort>) -> Self {
        Self::from_config(port, &SoftPwmConfig::default())
    }

    /// Create an engine from configuration on the system monotonic clock,
    /// sleeping with the configured strategy.
    #[must_use]
    pub fn from_config(port: Arc<dyn DigitalOutputPort>, config: &SoftPwmConfig) -> Self {
        let clock = Arc::new(MonotonicClock::new(config.sleep_strategy));
        Self::with_clock(port, clock, config)
    }

    /// Create an engine whose workers time their edges with `clock`.
    #[must_use]
    pub fn with_clock(
        port: Arc<dyn DigitalOutputPort>,
        clock: Arc<dyn Clock>,
        config: &SoftPwmConfig,
    ) -> Self {
        let capacity = config.max_channels;
        debug!(
            capacity,
            default_frequency_hz = config.default_frequency_hz,
            port = port.name(),
            "Software PWM engine created"
        );
        Self {
            port,
            clock,
            table: Mutex::new(SlotTable::with_capacity(capacity)),
            slot_freed: Condvar::new(),
            live_workers: Arc::new(AtomicUsize::new(0)),
            stack_size: AtomicUsize::new(config.worker_stack_size.unwrap_or(0)),
            capacity,
            default_frequency_hz: config.default_frequency_hz,
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for_free<'a>(&self, guard: MutexGuard<'a, SlotTable>) -> MutexGuard<'a, SlotTable> {
        self.slot_freed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start PWM on `pin` at the default frequency with duty 0.
    ///
    /// # Errors
    ///
    /// See [`init_with_frequency`](Self::init_with_frequency).
    pub fn init(&self, pin: Pin) -> ToolkitResult<()> {
        self.init_with_frequency(pin, 0)
    }

    /// Start PWM on `pin` at `frequency_hz` with duty 0.
    ///
    /// A non-positive frequency selects the default. Calling this for a pin
    /// that is already active succeeds without changing anything. If the
    /// pin is being stopped by another thread, this waits for the stop to
    /// finish and then starts a fresh channel.
    ///
    /// # Errors
    ///
    /// - [`ToolkitError::CapacityExceeded`] if every slot is in use
    /// - [`ToolkitError::ThreadSpawnFailure`] if the worker cannot be
    ///   created; the slot stays free
    pub fn init_with_frequency(&self, pin: Pin, frequency_hz: i32) -> ToolkitResult<()> {
        let period_us = period_for(frequency_hz, self.default_frequency_hz);

        let mut table = self.lock_table();
        loop {
            match table.get(pin).map(|s| s.state) {
                Some(SlotState::Running) => {
                    debug!(pin, "Software PWM already active");
                    return Ok(());
                }
                Some(SlotState::Stopping) => table = self.wait_for_free(table),
                None => break,
            }
        }

        let Some(index) = table.free_index() else {
            warn!(pin, capacity = self.capacity, "No free software PWM slot");
            return Err(ToolkitError::CapacityExceeded {
                capacity: self.capacity,
            });
        };

        self.port.set_mode(pin, PinMode::Output);

        let shared = Arc::new(CachePadded::new(SlotShared::new(period_us)));
        let handle = self.spawn_worker(pin, Arc::clone(&shared))?;

        table.slots[index] = Some(Slot {
            pin,
            state: SlotState::Running,
            shared,
            handle: Some(handle),
        });

        info!(pin, period_us, slot = index, "Software PWM started");
        Ok(())
    }

    fn spawn_worker(
        &self,
        pin: Pin,
        shared: Arc<CachePadded<SlotShared>>,
    ) -> ToolkitResult<JoinHandle<()>> {
        let port = Arc::clone(&self.port);
        let clock = Arc::clone(&self.clock);
        let live = Arc::clone(&self.live_workers);

        // Count before spawning so the guard inside the worker never underflows
        self.live_workers.fetch_add(1, Ordering::AcqRel);

        let mut builder = thread::Builder::new().name(format!("soft-pwm-{pin}"));
        let stack_size = self.stack_size.load(Ordering::Relaxed);
        if stack_size > 0 {
            builder = builder.stack_size(stack_size);
        }

        builder
            .spawn(move || {
                let _live = LiveWorker(live);
                run_worker(pin, &shared, port.as_ref(), clock.as_ref());
            })
            .map_err(|e| {
                self.live_workers.fetch_sub(1, Ordering::AcqRel);
                warn!(pin, "Failed to spawn software PWM worker: {e}");
                ToolkitError::ThreadSpawnFailure(format!("soft-pwm-{pin}: {e}"))
            })
    }

    /// Set the duty cycle of `pin` in percent, clamped to `0..=100`.
    ///
    /// Does nothing if `pin` is not active.
    pub fn write(&self, pin: Pin, duty: i32) {
        let duty = u8::try_from(duty.clamp(0, i32::from(MAX_DUTY))).unwrap_or(MAX_DUTY);
        let table = self.lock_table();
        if let Some(slot) = table.running(pin) {
            slot.shared.duty.store(duty, Ordering::Relaxed);
            trace!(pin, duty, "Software PWM duty set");
        }
    }

    /// Change the frequency of an active channel. A non-positive frequency
    /// selects the default.
    ///
    /// Takes effect at the start of the worker's next period. Does nothing
    /// if `pin` is not active.
    pub fn set_frequency(&self, pin: Pin, frequency_hz: i32) {
        let period_us = period_for(frequency_hz, self.default_frequency_hz);
        let table = self.lock_table();
        if let Some(slot) = table.running(pin) {
            slot.shared.period_us.store(period_us, Ordering::Relaxed);
            debug!(pin, period_us, "Software PWM frequency changed");
        }
    }

    /// Stop PWM on `pin`, wait for its worker to exit, and drive it LOW.
    ///
    /// Does nothing if `pin` is not active. If another thread is already
    /// stopping `pin`, waits until that stop has completed.
    pub fn stop(&self, pin: Pin) {
        let mut table = self.lock_table();
        let Some(index) = table.position(pin) else {
            return;
        };

        if table.is_stopping(pin) {
            while table.is_stopping(pin) {
                table = self.wait_for_free(table);
            }
            return;
        }

        let handle = table.slots[index].as_mut().and_then(|slot| {
            slot.state = SlotState::Stopping;
            slot.shared.running.store(false, Ordering::Release);
            slot.handle.take()
        });
        drop(table);

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(pin, "Software PWM worker panicked");
            }
        }
        self.port.write(pin, Level::Low);

        self.lock_table().slots[index] = None;
        self.slot_freed.notify_all();

        info!(pin, "Software PWM stopped");
    }

    /// Set the stack size of workers started from now on. `None` restores
    /// the platform default.
    pub fn set_worker_stack_size(&self, bytes: Option<usize>) {
        self.stack_size.store(bytes.unwrap_or(0), Ordering::Relaxed);
    }

    /// Stop every active channel.
    pub fn stop_all(&self) {
        for pin in self.active_pins() {
            self.stop(pin);
        }
    }

    /// Current duty of `pin`, or `None` if it is not active.
    pub fn duty(&self, pin: Pin) -> Option<u8> {
        self.lock_table()
            .running(pin)
            .map(|s| s.shared.duty.load(Ordering::Relaxed))
    }

    /// Current period of `pin` in microseconds, or `None` if it is not
    /// active.
    pub fn period_us(&self, pin: Pin) -> Option<u64> {
        self.lock_table()
            .running(pin)
            .map(|s| s.shared.period_us.load(Ordering::Relaxed))
    }

    /// Whether `pin` has a running channel.
    pub fn is_active(&self, pin: Pin) -> bool {
        self.lock_table().running(pin).is_some()
    }

    /// Pins with a running channel, in slot order.
    pub fn active_pins(&self) -> Vec<Pin> {
        self.lock_table()
            .slots
            .iter()
            .flatten()
            .filter(|s| s.state == SlotState::Running)
            .map(|s| s.pin)
            .collect()
    }

    /// Maximum number of simultaneously active pins.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Worker threads that have been started and have not yet exited.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PwmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PwmEngine")
            .field("capacity", &self.capacity)
            .field("active_pins", &self.active_pins())
            .field("live_workers", &self.live_workers())
            .finish_non_exhaustive()
    }
}

impl Drop for PwmEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn run_worker(pin: Pin, shared: &SlotShared, port: &dyn DigitalOutputPort, clock: &dyn Clock) {
    debug!(pin, "Software PWM worker started");

    while shared.running.load(Ordering::Acquire) {
        let duty = shared.duty.load(Ordering::Relaxed);
        let period_us = shared.period_us.load(Ordering::Relaxed);
        let (on_us, off_us) = split_period(period_us, duty);

        if on_us > 0 {
            port.write(pin, Level::High);
            clock.sleep_us(on_us);
        }
        if off_us > 0 {
            port.write(pin, Level::Low);
            clock.sleep_us(off_us);
        }
    }

    debug!(pin, "Software PWM worker exited");
}
