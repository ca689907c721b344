//! Software PWM acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Measured duty on the real clock is within 5 percentage points of the
//!   requested duty at 100 Hz
//! - Exact on/off split on a virtual clock
//! - Capacity K accepts K pins, rejects K+1, accepts again after one stop
//! - Stopped pins are LOW and stay LOW

use super::common::{measure, wait_until};
use pi_common::config::SoftPwmConfig;
use pi_common::error::ToolkitError;
use pi_common::pin::Level;
use pi_gpio::{DigitalOutputPort, SimulatedPort};
use pi_runtime::PwmEngine;
use pi_timing::VirtualClock;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn real_engine(capacity: usize) -> (Arc<SimulatedPort>, PwmEngine) {
    let port = Arc::new(SimulatedPort::new());
    let config = SoftPwmConfig {
        max_channels: capacity,
        ..SoftPwmConfig::default()
    };
    let engine = PwmEngine::from_config(port.clone(), &config);
    (port, engine)
}

#[test]
fn test_duty_accuracy_on_real_clock() {
    let (port, engine) = real_engine(1);
    engine.init(18).unwrap();

    for duty in [25, 50, 75] {
        engine.write(18, duty);
        thread::sleep(Duration::from_millis(30));
        port.clear_history();
        thread::sleep(Duration::from_millis(200));

        let wave = measure(&port.history(), 18);
        assert!(wave.periods >= 10, "only {} periods at {duty}%", wave.periods);
        let measured = wave.duty() * 100.0;
        assert!(
            (measured - f64::from(duty)).abs() < 5.0,
            "requested {duty}%, measured {measured:.1}%"
        );
        assert!(
            (wave.mean_period_us - 10_000.0).abs() < 2_000.0,
            "mean period {:.0}us",
            wave.mean_period_us
        );
    }

    engine.stop(18);
    assert_eq!(port.level(18), Level::Low);
}

#[test]
fn test_exact_split_on_virtual_clock() {
    let clock = VirtualClock::new();
    let port = Arc::new(SimulatedPort::with_clock(Arc::new(clock.clone())));
    let engine = PwmEngine::with_clock(port.clone(), Arc::new(clock), &SoftPwmConfig::default());

    engine.init_with_frequency(13, 50).unwrap();
    engine.write(13, 10);
    port.clear_history();
    assert!(wait_until(Duration::from_secs(5), || port.events_for(13).len() > 100));
    engine.stop(13);

    let wave = measure(&port.history(), 13);
    assert!(wave.periods > 10);
    assert!((wave.mean_on_us - 2_000.0).abs() < f64::EPSILON);
    assert!((wave.mean_period_us - 20_000.0).abs() < f64::EPSILON);
}

#[test]
fn test_capacity_and_recovery() {
    let (_, engine) = real_engine(4);
    for pin in 4..8 {
        engine.init(pin).unwrap();
    }
    assert_eq!(
        engine.init(8),
        Err(ToolkitError::CapacityExceeded { capacity: 4 })
    );
    // Failed init leaves no trace
    assert_eq!(engine.active_pins(), vec![4, 5, 6, 7]);
    assert_eq!(engine.live_workers(), 4);

    engine.stop(6);
    engine.init(8).unwrap();
    assert!(engine.is_active(8));
    assert!(!engine.is_active(6));

    engine.stop_all();
    assert_eq!(engine.live_workers(), 0);
}

#[test]
fn test_stopped_pin_stays_low() {
    let (port, engine) = real_engine(1);
    engine.init(18).unwrap();
    engine.write(18, 100);
    assert!(wait_until(Duration::from_secs(1), || port.level(18) == Level::High));

    engine.stop(18);
    port.clear_history();
    thread::sleep(Duration::from_millis(30));

    assert_eq!(port.read(18), Level::Low);
    assert!(port.events_for(18).is_empty());
    // Writes after stop are ignored
    engine.write(18, 100);
    assert_eq!(engine.duty(18), None);
}

#[test]
fn test_many_pins_concurrently() {
    let (port, engine) = real_engine(8);
    let engine = Arc::new(engine);
    let pins: Vec<u8> = (20..28).collect();

    for &pin in &pins {
        engine.init(pin).unwrap();
    }

    let handles: Vec<_> = pins
        .iter()
        .map(|&pin| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for step in 0..100 {
                    engine.write(pin, step);
                }
                engine.write(pin, 50);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for &pin in &pins {
        assert_eq!(engine.duty(pin), Some(50));
    }

    thread::sleep(Duration::from_millis(50));
    engine.stop_all();
    for &pin in &pins {
        assert_eq!(port.level(pin), Level::Low);
    }
}
