//! The demo control loop.
//!
//! Three periodic timers share one polling loop:
//! - blink: toggles the LED pin
//! - sensor: polling placeholder
//! - update: steps the software PWM duty and mirrors it on the hardware
//!   PWM servo pin
//!
//! The loop never blocks on a timer; it only sleeps for the configured
//! loop interval between polls.

use pi_common::config::DemoConfig;
use pi_common::pin::{Level, PinMode};
use pi_gpio::{DigitalOutputPort, HardwarePwm};
use pi_runtime::PwmEngine;
use pi_timing::{Clock, PeriodicTimer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemoStats {
    /// LED toggles.
    pub blinks: u64,
    /// Sensor poll expiries.
    pub sensor_polls: u64,
    /// Duty steps.
    pub pwm_updates: u64,
    /// Loop iterations.
    pub iterations: u64,
}

/// Next duty in the stepping sequence: add `step`, wrap to 0 past 100.
#[must_use]
pub fn next_duty(duty: i32, step: u8) -> i32 {
    let next = duty + i32::from(step);
    if next > 100 {
        0
    } else {
        next
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Devices and timers driven by the demo loop.
pub struct Demo<C: Clock + Clone> {
    config: DemoConfig,
    clock: C,
    port: Arc<dyn DigitalOutputPort>,
    pwm: PwmEngine,
    hw_pwm: Box<dyn HardwarePwm>,
    blink: PeriodicTimer<C>,
    sensor: PeriodicTimer<C>,
    update: PeriodicTimer<C>,
    led: Level,
    duty: i32,
    stats: DemoStats,
}

impl<C: Clock + Clone> Demo<C> {
    /// Configure the pins and start both PWM outputs.
    ///
    /// A software PWM start failure is logged and the loop continues
    /// without it.
    pub fn start(
        config: DemoConfig,
        clock: C,
        port: Arc<dyn DigitalOutputPort>,
        pwm: PwmEngine,
        mut hw_pwm: Box<dyn HardwarePwm>,
    ) -> Self {
        info!(pin = config.led_pin, "Starting non-blocking blink");
        info!(pin = config.sw_pwm_pin, "Starting software PWM");
        info!(pin = config.hw_pwm_pin, "Starting hardware PWM");

        port.set_mode(config.led_pin, PinMode::Output);

        if let Err(e) = pwm.init(config.sw_pwm_pin) {
            warn!(pin = config.sw_pwm_pin, "Failed to start software PWM: {e}");
        }

        let servo_hz = i32::try_from(config.servo_frequency_hz).unwrap_or(i32::MAX);
        let neutral = i32::try_from(config.servo_neutral_permille).unwrap_or(i32::MAX);
        hw_pwm.configure(config.hw_pwm_pin, servo_hz, neutral);

        let blink = PeriodicTimer::with_clock(clock.clone(), millis(config.blink_interval));
        let sensor = PeriodicTimer::with_clock(clock.clone(), millis(config.sensor_poll_interval));
        let update = PeriodicTimer::with_clock(clock.clone(), millis(config.pwm_update_interval));

        Self {
            config,
            clock,
            port,
            pwm,
            hw_pwm,
            blink,
            sensor,
            update,
            led: Level::Low,
            duty: 0,
            stats: DemoStats::default(),
        }
    }

    /// Run one loop iteration: service every expired timer once.
    pub fn poll(&mut self) {
        let now = self.clock.now_ms();
        self.stats.iterations += 1;

        if self.blink.tick_at(now) {
            self.led = self.led.toggled();
            self.port.write(self.config.led_pin, self.led);
            self.stats.blinks += 1;
            info!(pin = self.config.led_pin, level = %self.led, "Blink");
        }

        if self.sensor.tick_at(now) {
            self.stats.sensor_polls += 1;
            debug!("Sensor poll");
        }

        if self.update.tick_at(now) {
            self.duty = next_duty(self.duty, self.config.pwm_step);
            self.pwm.write(self.config.sw_pwm_pin, self.duty);

            let servo_hz = i32::try_from(self.config.servo_frequency_hz).unwrap_or(i32::MAX);
            self.hw_pwm
                .configure(self.config.hw_pwm_pin, servo_hz, self.duty * 10);
            self.stats.pwm_updates += 1;
            info!(duty = self.duty, "PWM duty stepped");
        }
    }

    /// Poll until `duration` has elapsed (zero runs until `stop` returns
    /// true) or `stop` returns true, sleeping `loop_sleep` between polls.
    pub fn run(&mut self, duration: Duration, stop: impl Fn() -> bool) -> DemoStats {
        let started = self.clock.now_ms();
        let limit = millis(duration);
        let sleep_us = micros(self.config.loop_sleep);

        loop {
            if limit > 0 && self.clock.now_ms().saturating_sub(started) >= limit {
                info!(elapsed_ms = limit, "Demo duration reached");
                break;
            }
            if stop() {
                info!("Shutdown signal received, leaving demo loop");
                break;
            }
            self.poll();
            self.clock.sleep_us(sleep_us);
        }
        self.stats
    }

    /// Current software PWM duty.
    pub fn duty(&self) -> i32 {
        self.duty
    }

    /// Current LED level.
    pub fn led(&self) -> Level {
        self.led
    }

    /// Counters so far.
    pub fn stats(&self) -> DemoStats {
        self.stats
    }

    /// Stop software and hardware PWM and release the GPIO port.
    pub fn shutdown(mut self) -> DemoStats {
        self.pwm.stop(self.config.sw_pwm_pin);
        self.hw_pwm.stop();
        self.port.release();
        info!(stats = ?self.stats, "Demo cleanup complete");
        self.stats
    }
}
