//! Configuration structures for the toolkit.
//!
//! Supports TOML deserialization with defaults that run safely on a
//! development host (simulated GPIO, real-time features off) and explicit
//! values for deployment on the board.

use crate::error::{ToolkitError, ToolkitResult};
use crate::pin::Pin;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level toolkit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    /// GPIO backend selection.
    pub gpio: GpioConfig,

    /// Software PWM engine configuration.
    pub soft_pwm: SoftPwmConfig,

    /// Hardware PWM peripheral configuration.
    pub hw_pwm: HwPwmConfig,

    /// Real-time scheduling configuration.
    pub realtime: RealtimeConfig,

    /// Demo application parameters.
    pub demo: DemoConfig,
}

/// Which implementation backs the digital output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpioBackend {
    /// In-memory simulation with logging; works on any host.
    #[default]
    Simulated,
    /// Memory-mapped GPIO registers via `/dev/gpiomem`.
    Mmap,
}

/// GPIO configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    /// Port implementation.
    pub backend: GpioBackend,

    /// Device node exposing the GPIO register block.
    pub device: PathBuf,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            backend: GpioBackend::Simulated,
            device: PathBuf::from("/dev/gpiomem"),
        }
    }
}

/// How blocking delays are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SleepStrategy {
    /// Yield to the OS scheduler (`clock_nanosleep`).
    #[default]
    Os,
    /// Busy-wait on the monotonic clock.
    Spin,
    /// OS sleep for most of the delay, then spin for the final stretch.
    Hybrid {
        /// Length of the spinning tail in microseconds.
        spin_threshold_us: u64,
    },
}

/// Software PWM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftPwmConfig {
    /// Maximum number of concurrently driven pins.
    pub max_channels: usize,

    /// Frequency used when none (or a non-positive one) is requested.
    pub default_frequency_hz: u32,

    /// Delay strategy for worker threads.
    pub sleep_strategy: SleepStrategy,

    /// Stack size of each worker thread in bytes; the platform default
    /// when unset.
    pub worker_stack_size: Option<usize>,
}

impl Default for SoftPwmConfig {
    fn default() -> Self {
        Self {
            max_channels: 8,
            default_frequency_hz: 100,
            sleep_strategy: SleepStrategy::Os,
            worker_stack_size: None,
        }
    }
}

/// Hardware PWM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HwPwmConfig {
    /// Drive the PWM peripheral (requires root for `/dev/mem`).
    pub enabled: bool,

    /// Device node for physical memory access.
    pub device: PathBuf,

    /// Physical base address of the peripheral window.
    pub peripheral_base: u64,

    /// Oscillator feeding the PWM clock manager.
    pub oscillator_hz: u32,
}

impl Default for HwPwmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: PathBuf::from("/dev/mem"),
            peripheral_base: 0xFE00_0000,
            oscillator_hz: 54_000_000,
        }
    }
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enable real-time scheduling (requires privileges).
    pub enabled: bool,

    /// SCHED_FIFO priority; the policy maximum when unset.
    pub priority: Option<u8>,

    /// CPU core to pin the control thread to.
    pub cpu: Option<usize>,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,
}

/// Demo application parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Pin toggled by the blink timer.
    pub led_pin: Pin,

    /// Pin driven by software PWM.
    pub sw_pwm_pin: Pin,

    /// Pin driven by hardware PWM.
    pub hw_pwm_pin: Pin,

    /// LED toggle interval.
    #[serde(with = "humantime_serde")]
    pub blink_interval: Duration,

    /// Sensor polling interval.
    #[serde(with = "humantime_serde")]
    pub sensor_poll_interval: Duration,

    /// Interval between duty cycle steps.
    #[serde(with = "humantime_serde")]
    pub pwm_update_interval: Duration,

    /// Total run time of the demo loop.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Sleep between loop iterations.
    #[serde(with = "humantime_serde")]
    pub loop_sleep: Duration,

    /// Servo frequency for the hardware PWM pin.
    pub servo_frequency_hz: u32,

    /// Servo neutral position in parts per thousand.
    pub servo_neutral_permille: u32,

    /// Duty cycle increment per update, in percent.
    pub pwm_step: u8,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            led_pin: 21,
            sw_pwm_pin: 18,
            hw_pwm_pin: 12,
            blink_interval: Duration::from_millis(500),
            sensor_poll_interval: Duration::from_millis(100),
            pwm_update_interval: Duration::from_secs(1),
            duration: Duration::from_secs(5),
            loop_sleep: Duration::from_millis(1),
            servo_frequency_hz: 50,
            servo_neutral_permille: 75,
            pwm_step: 25,
        }
    }
}

impl ToolkitConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check values that deserialize fine but cannot be used.
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::Config`] describing the first problem found.
    pub fn validate(&self) -> ToolkitResult<()> {
        if self.soft_pwm.max_channels == 0 {
            return Err(ToolkitError::Config(
                "soft_pwm.max_channels must be at least 1".into(),
            ));
        }
        if self.soft_pwm.default_frequency_hz == 0 {
            return Err(ToolkitError::Config(
                "soft_pwm.default_frequency_hz must be positive".into(),
            ));
        }
        if self.hw_pwm.oscillator_hz < 1_000_000 {
            return Err(ToolkitError::Config(format!(
                "hw_pwm.oscillator_hz {} is below the 1 MHz PWM clock",
                self.hw_pwm.oscillator_hz
            )));
        }
        if let Some(priority) = self.realtime.priority {
            if !(1..=99).contains(&priority) {
                return Err(ToolkitError::Config(format!(
                    "realtime.priority {priority} outside 1-99"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ToolkitConfig::default();
        assert_eq!(config.gpio.backend, GpioBackend::Simulated);
        assert_eq!(config.soft_pwm.max_channels, 8);
        assert_eq!(config.soft_pwm.default_frequency_hz, 100);
        assert_eq!(config.demo.blink_interval, Duration::from_millis(500));
        assert!(!config.realtime.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [gpio]
            backend = "mmap"

            [soft_pwm]
            max_channels = 4
            default_frequency_hz = 500
            sleep_strategy = "spin"
            worker_stack_size = 65536

            [realtime]
            enabled = true
            priority = 80
            cpu = 3

            [demo]
            blink_interval = "250ms"
            duration = "10s"
        "#;

        let config = ToolkitConfig::from_toml(toml).unwrap();
        assert_eq!(config.gpio.backend, GpioBackend::Mmap);
        assert_eq!(config.gpio.device, PathBuf::from("/dev/gpiomem"));
        assert_eq!(config.soft_pwm.max_channels, 4);
        assert_eq!(config.soft_pwm.sleep_strategy, SleepStrategy::Spin);
        assert_eq!(config.soft_pwm.worker_stack_size, Some(65_536));
        assert_eq!(config.realtime.priority, Some(80));
        assert_eq!(config.realtime.cpu, Some(3));
        assert_eq!(config.demo.blink_interval, Duration::from_millis(250));
        assert_eq!(config.demo.duration, Duration::from_secs(10));
        // Untouched fields keep their defaults
        assert_eq!(config.demo.led_pin, 21);
    }

    #[test]
    fn test_hybrid_sleep_strategy() {
        let toml = r#"
            [soft_pwm]
            sleep_strategy = { hybrid = { spin_threshold_us = 200 } }
        "#;
        let config = ToolkitConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.soft_pwm.sleep_strategy,
            SleepStrategy::Hybrid {
                spin_threshold_us: 200
            }
        );

        let json: SleepStrategy = serde_json::from_str(r#""os""#).unwrap();
        assert_eq!(json, SleepStrategy::Os);
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = ToolkitConfig::default();
        let toml = config.to_toml().unwrap();
        let parsed = ToolkitConfig::from_toml(&toml).unwrap();
        assert_eq!(config.demo.pwm_update_interval, parsed.demo.pwm_update_interval);
        assert_eq!(config.hw_pwm.peripheral_base, parsed.hw_pwm.peripheral_base);
    }

    #[test]
    fn test_validate_rejects_zero_channels() {
        let mut config = ToolkitConfig::default();
        config.soft_pwm.max_channels = 0;
        assert!(matches!(config.validate(), Err(ToolkitError::Config(_))));

        let mut config = ToolkitConfig::default();
        config.realtime.priority = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[demo]\nled_pin = 5").unwrap();

        let config = ToolkitConfig::from_file(file.path()).unwrap();
        assert_eq!(config.demo.led_pin, 5);

        let missing = ToolkitConfig::from_file(std::path::Path::new("/nonexistent/pi.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
