//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Inspecting the test process (/proc/self/status)
//! - Waiting on conditions with a deadline
//! - Measuring PWM waveforms recorded by the simulated port

#![allow(dead_code)] // Not every test file uses every helper

use pi_common::pin::{Level, Pin};
use pi_gpio::PinEvent;
use std::fs;
use std::time::{Duration, Instant};

/// Read a numeric field such as `Threads:` or `VmRSS:` from
/// `/proc/self/status`.
pub fn proc_status_field(field: &str) -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Number of OS threads in this process.
pub fn thread_count() -> Option<u64> {
    proc_status_field("Threads:")
}

/// Current process memory usage in bytes.
pub fn memory_usage() -> u64 {
    proc_status_field("VmRSS:").map_or(0, |kb| kb * 1024)
}

/// Check if running as root (required for SCHED_FIFO).
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions
    unsafe { libc::geteuid() == 0 }
}

/// Poll `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Waveform statistics over complete HIGH-then-LOW periods.
#[derive(Debug, Clone, Copy, Default)]
pub struct Waveform {
    /// Complete periods measured.
    pub periods: usize,
    /// Mean HIGH time in microseconds.
    pub mean_on_us: f64,
    /// Mean period in microseconds.
    pub mean_period_us: f64,
}

impl Waveform {
    /// Measured duty as a fraction of the period.
    pub fn duty(&self) -> f64 {
        if self.mean_period_us == 0.0 {
            0.0
        } else {
            self.mean_on_us / self.mean_period_us
        }
    }
}

/// Measure `pin`'s waveform from rising edge to rising edge.
pub fn measure(events: &[PinEvent], pin: Pin) -> Waveform {
    let events: Vec<&PinEvent> = events.iter().filter(|e| e.pin == pin).collect();
    let mut on_total = 0u64;
    let mut period_total = 0u64;
    let mut periods = 0usize;

    for w in events.windows(3) {
        if w[0].level == Level::High && w[1].level == Level::Low && w[2].level == Level::High {
            on_total += w[1].at_us - w[0].at_us;
            period_total += w[2].at_us - w[0].at_us;
            periods += 1;
        }
    }

    if periods == 0 {
        return Waveform::default();
    }
    Waveform {
        periods,
        mean_on_us: on_total as f64 / periods as f64,
        mean_period_us: period_total as f64 / periods as f64,
    }
}
