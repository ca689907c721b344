//! Thread leak check for the software PWM engine.
//!
//! Runs as its own test binary with a single test so the process thread
//! count is not disturbed by other tests running in parallel.

use pi_gpio::SimulatedPort;
use pi_runtime::PwmEngine;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn thread_count() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|rest| rest.trim().parse().ok())
}

#[test]
fn test_init_stop_cycles_leave_no_threads() {
    let Some(baseline) = thread_count() else {
        eprintln!("SKIPPED: /proc/self/status not available");
        return;
    };

    let engine = PwmEngine::new(Arc::new(SimulatedPort::new()));
    for cycle in 0..50 {
        engine.init(18).unwrap();
        engine.write(18, cycle * 2);
        engine.stop(18);
    }
    assert_eq!(engine.live_workers(), 0);

    // Joined threads disappear from /proc promptly; allow a short grace period
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut current = thread_count().unwrap_or(0);
    while current > baseline && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
        current = thread_count().unwrap_or(0);
    }
    assert_eq!(current, baseline, "threads before {baseline}, after {current}");

    drop(engine);
    assert_eq!(thread_count(), Some(baseline));
}
