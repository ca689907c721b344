//! GPIO and hardware PWM access for the BCM2711.
//!
//! This crate provides:
//! - [`DigitalOutputPort`] trait abstracting pin configuration and level I/O
//! - [`mmap`] module with the memory-mapped register implementation
//! - [`simulated`] module with an in-memory, event-recording implementation
//! - [`hw_pwm`] module driving the PWM peripheral
//! - [`registers`] module with the register map arithmetic

pub mod hw_pwm;
pub mod mmap;
pub mod registers;
pub mod simulated;

pub use hw_pwm::{open_hw_pwm, ChannelState, HardwarePwm, MmapHwPwm, PwmChannel, SimulatedHwPwm};
pub use mmap::MmapGpio;
pub use simulated::{PinEvent, SimulatedPort};

use pi_common::config::{GpioBackend, GpioConfig};
use pi_common::error::ToolkitResult;
use pi_common::pin::{AltFunction, Level, Pin, PinMode};
use std::sync::Arc;
use tracing::info;

/// Digital pin access.
///
/// Shared between the controlling thread and every PWM worker, so all
/// methods take `&self`. Pins outside `0..=53` are ignored and read as
/// [`Level::Low`]; so does every pin once the port has been released.
pub trait DigitalOutputPort: Send + Sync {
    /// Configure the direction or function of `pin`.
    fn set_mode(&self, pin: Pin, mode: PinMode);

    /// Drive `pin` to `level`.
    fn write(&self, pin: Pin, level: Level);

    /// Read the current level of `pin`.
    fn read(&self, pin: Pin) -> Level;

    /// Route `pin` to an alternate peripheral function.
    fn set_alt_function(&self, pin: Pin, function: AltFunction) {
        self.set_mode(pin, PinMode::Alt(function));
    }

    /// Release the underlying hardware. Later calls become no-ops.
    fn release(&self) {
        // Default: nothing to release
    }

    /// Implementation name for logs.
    fn name(&self) -> &'static str;
}

/// Open the port implementation selected by `config.backend`.
///
/// # Errors
///
/// Returns [`InitializationFailure`](pi_common::ToolkitError::InitializationFailure)
/// if the memory-mapped backend cannot map its device.
pub fn open_port(config: &GpioConfig) -> ToolkitResult<Arc<dyn DigitalOutputPort>> {
    let port: Arc<dyn DigitalOutputPort> = match config.backend {
        GpioBackend::Simulated => Arc::new(SimulatedPort::new()),
        GpioBackend::Mmap => Arc::new(MmapGpio::open(&config.device)?),
    };
    info!(backend = port.name(), "GPIO port opened");
    Ok(port)
}
