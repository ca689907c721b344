//! Hardware PWM peripheral.
//!
//! The BCM2711 has two PWM channels fed by the PWM clock manager. The clock
//! is divided down from the oscillator to 1 MHz, so a channel's range
//! register is the period in microseconds and its data register the high
//! time. Channels run in mark-space mode.
//!
//! | Channel | Pins | Function |
//! |---------|------|----------|
//! | PWM0    | 12   | ALT0     |
//! | PWM0    | 18   | ALT5     |
//! | PWM1    | 13   | ALT0     |
//! | PWM1    | 19   | ALT5     |
//!
//! Every other pin is ignored.

use crate::mmap::RegisterBlock;
use crate::registers::BLOCK_SIZE;
use crate::DigitalOutputPort;
use pi_common::config::{GpioBackend, GpioConfig, HwPwmConfig};
use pi_common::error::{ToolkitError, ToolkitResult};
use pi_common::pin::{AltFunction, Pin};
use pi_timing::{Clock, MonotonicClock};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Frequency of the divided PWM clock.
pub const PWM_CLOCK_HZ: u32 = 1_000_000;

/// Largest duty value, in per-mille.
pub const MAX_DUTY_PERMILLE: i32 = 1000;

/// Offset of the PWM0 block from the peripheral base.
pub const PWM_OFFSET: u64 = 0x20_C000;
/// Offset of the clock manager block from the peripheral base.
pub const CLK_OFFSET: u64 = 0x10_1000;

const PWM_CTL: usize = 0;
const PWM_RNG1: usize = 4;
const PWM_DAT1: usize = 5;
const PWM_RNG2: usize = 8;
const PWM_DAT2: usize = 9;

const CM_PWMCTL: usize = 40;
const CM_PWMDIV: usize = 41;
const CM_PASSWD: u32 = 0x5A << 24;
const CM_KILL: u32 = 1 << 5;
const CM_ENAB: u32 = 1 << 4;
const CM_BUSY: u32 = 1 << 7;
const CM_SRC_OSC: u32 = 1;
const CM_DIVI_SHIFT: u32 = 12;
const CM_DIVI_MAX: u32 = 0xFFF;

/// Upper bound on 1 µs waits for the clock manager to go idle.
const CLOCK_BUSY_POLLS: u32 = 10_000;

/// One of the two PWM channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PwmChannel {
    /// Channel 1 in the datasheet, pins 12 and 18.
    Pwm0,
    /// Channel 2 in the datasheet, pins 13 and 19.
    Pwm1,
}

impl PwmChannel {
    fn index(self) -> usize {
        match self {
            Self::Pwm0 => 0,
            Self::Pwm1 => 1,
        }
    }

    /// (range register, data register, enable bit, mark-space bit)
    fn registers(self) -> (usize, usize, u32, u32) {
        match self {
            Self::Pwm0 => (PWM_RNG1, PWM_DAT1, 1 << 0, 1 << 7),
            Self::Pwm1 => (PWM_RNG2, PWM_DAT2, 1 << 8, 1 << 15),
        }
    }
}

/// Channel and pin function for a PWM-capable pin.
#[must_use]
pub fn channel_for(pin: Pin) -> Option<(PwmChannel, AltFunction)> {
    match pin {
        12 => Some((PwmChannel::Pwm0, AltFunction::Alt0)),
        13 => Some((PwmChannel::Pwm1, AltFunction::Alt0)),
        18 => Some((PwmChannel::Pwm0, AltFunction::Alt5)),
        19 => Some((PwmChannel::Pwm1, AltFunction::Alt5)),
        _ => None,
    }
}

/// Range and data register values for a frequency and per-mille duty on
/// the 1 MHz PWM clock.
#[must_use]
pub fn range_and_data(frequency_hz: u32, duty_permille: u32) -> (u32, u32) {
    let range = (PWM_CLOCK_HZ / frequency_hz.max(1)).max(1);
    let permille = u64::from(duty_permille.min(MAX_DUTY_PERMILLE.unsigned_abs()));
    let data = u64::from(range) * permille / 1000;
    (range, u32::try_from(data).unwrap_or(range))
}

/// Validate and normalize raw `configure` arguments.
///
/// Returns `None` when the call must be ignored (frequency not positive or
/// pin without a PWM channel).
fn normalize(
    pin: Pin,
    frequency_hz: i32,
    duty_permille: i32,
) -> Option<(PwmChannel, AltFunction, u32, u32)> {
    let frequency = u32::try_from(frequency_hz).ok().filter(|f| *f > 0)?;
    let (channel, function) = channel_for(pin)?;
    let duty = duty_permille.clamp(0, MAX_DUTY_PERMILLE).unsigned_abs();
    Some((channel, function, frequency, duty))
}

/// Physical address of the block at `offset` from `peripheral_base`.
fn block_address(peripheral_base: u64, offset: u64) -> ToolkitResult<u64> {
    peripheral_base.checked_add(offset).ok_or_else(|| {
        ToolkitError::InitializationFailure(format!(
            "peripheral base {peripheral_base:#x} + {offset:#x} overflows"
        ))
    })
}

/// Configured state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelState {
    /// Pin routed to the channel.
    pub pin: Pin,
    /// Output frequency in Hz.
    pub frequency_hz: u32,
    /// Duty in per-mille.
    pub duty_permille: u32,
    /// Range register value (period in PWM clock ticks).
    pub range: u32,
    /// Data register value (high time in PWM clock ticks).
    pub data: u32,
}

/// Hardware PWM output.
///
/// Like the GPIO port, invalid arguments are ignored rather than reported:
/// non-positive frequencies, pins outside {12, 13, 18, 19}, and calls after
/// [`stop`](Self::stop).
pub trait HardwarePwm: Send {
    /// Route `pin` to its PWM channel and start it at `frequency_hz` with
    /// `duty_permille` (clamped to `0..=1000`).
    fn configure(&mut self, pin: Pin, frequency_hz: i32, duty_permille: i32);

    /// Disable both channels and release the peripheral.
    fn stop(&mut self);

    /// Implementation name for logs.
    fn name(&self) -> &'static str;
}

struct PwmBlocks {
    pwm: RegisterBlock,
    clk: RegisterBlock,
}

/// Register-level hardware PWM over `/dev/mem`.
pub struct MmapHwPwm {
    blocks: Option<PwmBlocks>,
    port: Arc<dyn DigitalOutputPort>,
    clock: MonotonicClock,
}

impl MmapHwPwm {
    /// Map the PWM and clock manager blocks and start the PWM clock at
    /// [`PWM_CLOCK_HZ`].
    ///
    /// # Errors
    ///
    /// Returns [`InitializationFailure`](pi_common::ToolkitError::InitializationFailure)
    /// when the device cannot be mapped (typically missing root privileges).
    pub fn open(config: &HwPwmConfig, port: Arc<dyn DigitalOutputPort>) -> ToolkitResult<Self> {
        let pwm_address = block_address(config.peripheral_base, PWM_OFFSET)?;
        let clk_address = block_address(config.peripheral_base, CLK_OFFSET)?;
        let pwm = RegisterBlock::map(&config.device, pwm_address, BLOCK_SIZE)?;
        let clk = RegisterBlock::map(&config.device, clk_address, BLOCK_SIZE)?;

        let this = Self {
            blocks: Some(PwmBlocks { pwm, clk }),
            port,
            clock: MonotonicClock::default(),
        };
        this.start_clock(config.oscillator_hz);
        info!(
            device = %config.device.display(),
            oscillator_hz = config.oscillator_hz,
            "Hardware PWM initialized"
        );
        Ok(this)
    }

    fn start_clock(&self, oscillator_hz: u32) {
        let Some(blocks) = &self.blocks else {
            return;
        };
        let divisor = (oscillator_hz / PWM_CLOCK_HZ).clamp(1, CM_DIVI_MAX);

        blocks.clk.write(CM_PWMCTL, CM_PASSWD | CM_KILL);
        self.clock.sleep_us(100);

        let mut polls = 0;
        while blocks.clk.read(CM_PWMCTL) & CM_BUSY != 0 {
            if polls == CLOCK_BUSY_POLLS {
                warn!("PWM clock still busy, programming divisor anyway");
                break;
            }
            polls += 1;
            self.clock.sleep_us(1);
        }

        blocks
            .clk
            .write(CM_PWMDIV, CM_PASSWD | (divisor << CM_DIVI_SHIFT));
        blocks.clk.write(CM_PWMCTL, CM_PASSWD | CM_ENAB | CM_SRC_OSC);
        self.clock.sleep_us(100);
        debug!(divisor, "PWM clock enabled");
    }

    /// Whether the peripheral is still mapped.
    pub fn is_mapped(&self) -> bool {
        self.blocks.is_some()
    }
}

impl std::fmt::Debug for MmapHwPwm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapHwPwm")
            .field("mapped", &self.is_mapped())
            .finish_non_exhaustive()
    }
}

impl HardwarePwm for MmapHwPwm {
    fn configure(&mut self, pin: Pin, frequency_hz: i32, duty_permille: i32) {
        let Some((channel, function, frequency, duty)) =
            normalize(pin, frequency_hz, duty_permille)
        else {
            debug!(pin, frequency_hz, "Hardware PWM request ignored");
            return;
        };
        let Some(blocks) = &self.blocks else {
            return;
        };

        self.port.set_alt_function(pin, function);

        let (range, data) = range_and_data(frequency, duty);
        let (rng_reg, dat_reg, enable, mark_space) = channel.registers();

        // The channel must be idle while range and data change.
        blocks.pwm.write(PWM_CTL, blocks.pwm.read(PWM_CTL) & !enable);
        self.clock.sleep_us(10);
        blocks.pwm.write(rng_reg, range);
        blocks.pwm.write(dat_reg, data);
        blocks
            .pwm
            .write(PWM_CTL, blocks.pwm.read(PWM_CTL) | mark_space | enable);

        debug!(pin, ?channel, frequency, duty, range, data, "Hardware PWM configured");
    }

    fn stop(&mut self) {
        if let Some(blocks) = self.blocks.take() {
            blocks.pwm.write(PWM_CTL, 0);
            info!("Hardware PWM stopped");
        }
    }

    fn name(&self) -> &'static str {
        "mmap"
    }
}

impl Drop for MmapHwPwm {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hardware PWM stand-in that records channel configuration.
pub struct SimulatedHwPwm {
    port: Arc<dyn DigitalOutputPort>,
    channels: [Option<ChannelState>; 2],
    stopped: bool,
}

impl SimulatedHwPwm {
    /// Create a simulated peripheral routing pins through `port`.
    #[must_use]
    pub fn new(port: Arc<dyn DigitalOutputPort>) -> Self {
        Self {
            port,
            channels: [None, None],
            stopped: false,
        }
    }

    /// Current configuration of `channel`.
    pub fn channel(&self, channel: PwmChannel) -> Option<ChannelState> {
        self.channels[channel.index()]
    }

    /// Whether [`stop`](HardwarePwm::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl std::fmt::Debug for SimulatedHwPwm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedHwPwm")
            .field("channels", &self.channels)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl HardwarePwm for SimulatedHwPwm {
    fn configure(&mut self, pin: Pin, frequency_hz: i32, duty_permille: i32) {
        if self.stopped {
            return;
        }
        let Some((channel, function, frequency, duty)) =
            normalize(pin, frequency_hz, duty_permille)
        else {
            debug!(pin, frequency_hz, "Simulated hardware PWM request ignored");
            return;
        };
        self.port.set_alt_function(pin, function);
        let (range, data) = range_and_data(frequency, duty);
        self.channels[channel.index()] = Some(ChannelState {
            pin,
            frequency_hz: frequency,
            duty_permille: duty,
            range,
            data,
        });
        debug!(pin, ?channel, frequency, duty, "Simulated hardware PWM configured");
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.channels = [None, None];
            self.stopped = true;
            debug!("Simulated hardware PWM stopped");
        }
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// Open the hardware PWM implementation selected by configuration.
///
/// The register-level peripheral is used only when `hw_pwm.enabled` is set
/// and the GPIO backend is `mmap`; otherwise a [`SimulatedHwPwm`] is
/// returned.
///
/// # Errors
///
/// Propagates mapping failures of [`MmapHwPwm::open`].
pub fn open_hw_pwm(
    hw_pwm: &HwPwmConfig,
    gpio: &GpioConfig,
    port: Arc<dyn DigitalOutputPort>,
) -> ToolkitResult<Box<dyn HardwarePwm>> {
    if hw_pwm.enabled && gpio.backend == GpioBackend::Mmap {
        Ok(Box::new(MmapHwPwm::open(hw_pwm, port)?))
    } else {
        Ok(Box::new(SimulatedHwPwm::new(port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatedPort;
    use pi_common::pin::PinMode;

    fn simulated() -> (Arc<SimulatedPort>, SimulatedHwPwm) {
        let port = Arc::new(SimulatedPort::new());
        let pwm = SimulatedHwPwm::new(port.clone());
        (port, pwm)
    }

    #[test]
    fn test_channel_mapping() {
        assert_eq!(channel_for(12), Some((PwmChannel::Pwm0, AltFunction::Alt0)));
        assert_eq!(channel_for(18), Some((PwmChannel::Pwm0, AltFunction::Alt5)));
        assert_eq!(channel_for(13), Some((PwmChannel::Pwm1, AltFunction::Alt0)));
        assert_eq!(channel_for(19), Some((PwmChannel::Pwm1, AltFunction::Alt5)));
        for pin in [0, 11, 14, 17, 20, 53, 255] {
            assert_eq!(channel_for(pin), None, "pin {pin}");
        }
    }

    #[test]
    fn test_range_and_data() {
        assert_eq!(range_and_data(50, 75), (20_000, 1_500));
        assert_eq!(range_and_data(1_000, 500), (1_000, 500));
        assert_eq!(range_and_data(1_000, 0), (1_000, 0));
        assert_eq!(range_and_data(1_000, 1_000), (1_000, 1_000));
        // Above the PWM clock the range bottoms out at one tick
        assert_eq!(range_and_data(2_000_000, 1_000), (1, 1));
    }

    #[test]
    fn test_configure_routes_pin() {
        let (port, mut pwm) = simulated();
        pwm.configure(18, 50, 75);

        assert_eq!(port.mode(18), Some(PinMode::Alt(AltFunction::Alt5)));
        let state = pwm.channel(PwmChannel::Pwm0).unwrap();
        assert_eq!(state.pin, 18);
        assert_eq!(state.frequency_hz, 50);
        assert_eq!(state.duty_permille, 75);
        assert_eq!(state.range, 20_000);
        assert_eq!(state.data, 1_500);
        assert_eq!(pwm.channel(PwmChannel::Pwm1), None);
    }

    #[test]
    fn test_duty_clamped() {
        let (_, mut pwm) = simulated();
        pwm.configure(13, 1_000, 5_000);
        assert_eq!(pwm.channel(PwmChannel::Pwm1).unwrap().duty_permille, 1_000);
        pwm.configure(13, 1_000, -20);
        assert_eq!(pwm.channel(PwmChannel::Pwm1).unwrap().duty_permille, 0);
    }

    #[test]
    fn test_invalid_requests_ignored() {
        let (port, mut pwm) = simulated();
        pwm.configure(17, 1_000, 500);
        pwm.configure(12, 0, 500);
        pwm.configure(12, -50, 500);
        assert_eq!(pwm.channel(PwmChannel::Pwm0), None);
        assert_eq!(port.mode(17), None);
        assert_eq!(port.mode(12), None);
    }

    #[test]
    fn test_stop_is_idempotent_and_final() {
        let (_, mut pwm) = simulated();
        pwm.configure(12, 1_000, 500);
        pwm.stop();
        pwm.stop();
        assert!(pwm.is_stopped());
        assert_eq!(pwm.channel(PwmChannel::Pwm0), None);

        pwm.configure(12, 1_000, 500);
        assert_eq!(pwm.channel(PwmChannel::Pwm0), None);
    }

    #[test]
    fn test_factory_defaults_to_simulated() {
        let port: Arc<dyn DigitalOutputPort> = Arc::new(SimulatedPort::new());
        let pwm = open_hw_pwm(&HwPwmConfig::default(), &GpioConfig::default(), port).unwrap();
        assert_eq!(pwm.name(), "simulated");
    }

    #[test]
    fn test_factory_mmap_without_device_fails() {
        let port: Arc<dyn DigitalOutputPort> = Arc::new(SimulatedPort::new());
        let hw = HwPwmConfig {
            enabled: true,
            device: "/nonexistent/mem".into(),
            ..HwPwmConfig::default()
        };
        let gpio = GpioConfig {
            backend: GpioBackend::Mmap,
            ..GpioConfig::default()
        };
        assert!(open_hw_pwm(&hw, &gpio, port).is_err());
    }

    #[test]
    fn test_overflowing_peripheral_base_rejected() {
        assert_eq!(block_address(0xFE00_0000, PWM_OFFSET).unwrap(), 0xFE20_C000);
        assert!(block_address(u64::MAX - 0x1000, CLK_OFFSET).is_err());

        let port: Arc<dyn DigitalOutputPort> = Arc::new(SimulatedPort::new());
        let config = HwPwmConfig {
            enabled: true,
            device: "/nonexistent/mem".into(),
            peripheral_base: u64::MAX,
            ..HwPwmConfig::default()
        };
        // Rejected before the device is touched
        match MmapHwPwm::open(&config, port) {
            Err(ToolkitError::InitializationFailure(msg)) => {
                assert!(msg.contains("overflows"), "{msg}");
            }
            other => panic!("expected overflow error, got {other:?}"),
        }
    }
}
