//! Simulated GPIO port for host machines and tests.
//!
//! Records every mode change and level transition in memory, timestamped by
//! an injected [`Clock`], so tests can assert on exact waveforms produced by
//! the PWM workers without touching hardware.

use crate::DigitalOutputPort;
use pi_common::pin::{is_valid_pin, Level, Pin, PinMode, GPIO_PIN_COUNT};
use pi_timing::{Clock, MonotonicClock};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Default number of level transitions kept in the history ring.
pub const DEFAULT_HISTORY_CAPACITY: usize = 65_536;

/// A recorded level transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinEvent {
    /// Pin written.
    pub pin: Pin,
    /// Level driven.
    pub level: Level,
    /// Clock time of the write in microseconds.
    pub at_us: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PinState {
    mode: Option<PinMode>,
    level: Level,
    input: Level,
}

#[derive(Debug)]
struct SimState {
    pins: [PinState; GPIO_PIN_COUNT],
    history: VecDeque<PinEvent>,
    history_capacity: usize,
    released: bool,
}

/// In-memory GPIO port.
pub struct SimulatedPort {
    clock: Arc<dyn Clock>,
    state: Mutex<SimState>,
}

impl SimulatedPort {
    /// Create a port timestamped by the system monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    /// Create a port timestamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_history_capacity(clock, DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a port keeping at most `capacity` events; older events are
    /// dropped first.
    #[must_use]
    pub fn with_history_capacity(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            clock,
            state: Mutex::new(SimState {
                pins: [PinState::default(); GPIO_PIN_COUNT],
                history: VecDeque::with_capacity(capacity.min(4096)),
                history_capacity: capacity,
                released: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current mode of `pin`, if it was ever configured.
    pub fn mode(&self, pin: Pin) -> Option<PinMode> {
        if !is_valid_pin(pin) {
            return None;
        }
        self.lock().pins[usize::from(pin)].mode
    }

    /// Last level driven on `pin`.
    pub fn level(&self, pin: Pin) -> Level {
        if !is_valid_pin(pin) {
            return Level::Low;
        }
        self.lock().pins[usize::from(pin)].level
    }

    /// Set the externally driven level seen by `read` on a non-output pin.
    pub fn set_input(&self, pin: Pin, level: Level) {
        if !is_valid_pin(pin) {
            return;
        }
        self.lock().pins[usize::from(pin)].input = level;
    }

    /// Whether [`release`](DigitalOutputPort::release) has been called.
    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    /// All recorded transitions, oldest first.
    pub fn history(&self) -> Vec<PinEvent> {
        self.lock().history.iter().copied().collect()
    }

    /// Recorded transitions for `pin`, oldest first.
    pub fn events_for(&self, pin: Pin) -> Vec<PinEvent> {
        self.lock()
            .history
            .iter()
            .filter(|e| e.pin == pin)
            .copied()
            .collect()
    }

    /// Discard recorded transitions.
    pub fn clear_history(&self) {
        self.lock().history.clear();
    }
}

impl Default for SimulatedPort {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimulatedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimulatedPort")
            .field("events", &state.history.len())
            .field("released", &state.released)
            .finish_non_exhaustive()
    }
}

impl DigitalOutputPort for SimulatedPort {
    fn set_mode(&self, pin: Pin, mode: PinMode) {
        if !is_valid_pin(pin) {
            return;
        }
        let mut state = self.lock();
        if state.released {
            return;
        }
        state.pins[usize::from(pin)].mode = Some(mode);
        debug!(pin, %mode, "Simulated set_mode");
    }

    fn write(&self, pin: Pin, level: Level) {
        if !is_valid_pin(pin) {
            return;
        }
        let at_us = self.clock.now_us();
        let mut state = self.lock();
        if state.released {
            return;
        }
        state.pins[usize::from(pin)].level = level;
        if state.history_capacity > 0 {
            if state.history.len() == state.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(PinEvent { pin, level, at_us });
        }
        trace!(pin, %level, at_us, "Simulated write");
    }

    fn read(&self, pin: Pin) -> Level {
        if !is_valid_pin(pin) {
            return Level::Low;
        }
        let state = self.lock();
        if state.released {
            return Level::Low;
        }
        let pin = &state.pins[usize::from(pin)];
        match pin.mode {
            Some(PinMode::Output) => pin.level,
            _ => pin.input,
        }
    }

    fn release(&self) {
        let mut state = self.lock();
        if !state.released {
            state.released = true;
            debug!(events = state.history.len(), "Simulated port released");
        }
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
