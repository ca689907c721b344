//! pi-toolkit demo entry point.
//!
//! Blinks an LED, steps a software PWM duty cycle, and drives a servo on
//! hardware PWM from one non-blocking polling loop, then cleans up.

mod demo;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use pi_common::config::{GpioBackend, ToolkitConfig};
use pi_runtime::{init_realtime, PwmEngine};
use pi_timing::MonotonicClock;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::demo::Demo;
use crate::signals::SignalHandler;

/// Demo command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "pi-toolkit-demo",
    about = "pi-toolkit demo - non-blocking blink, software PWM, and hardware PWM servo",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use the simulated GPIO port and hardware PWM.
    #[arg(long, short = 's')]
    simulated: bool,

    /// Run time, e.g. "5s" or "2m" (overrides config; 0 runs until a signal).
    #[arg(long, short = 'd', value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting pi-toolkit demo");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    info!(
        backend = ?config.gpio.backend,
        hw_pwm = config.hw_pwm.enabled,
        duration = %humantime::format_duration(config.demo.duration),
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;

    run_demo(&config, &signal_handler)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "pi_toolkit_demo={level},pi_runtime={level},pi_gpio={level},pi_timing={level},pi_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `PI_TOOLKIT_CONFIG` environment variable
/// 3. `/etc/pi-toolkit/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<ToolkitConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return ToolkitConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("PI_TOOLKIT_CONFIG") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from PI_TOOLKIT_CONFIG");
            return ToolkitConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from PI_TOOLKIT_CONFIG={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "PI_TOOLKIT_CONFIG set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/pi-toolkit/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return ToolkitConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(ToolkitConfig::default())
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &mut ToolkitConfig, args: &Args) {
    if args.simulated {
        config.gpio.backend = GpioBackend::Simulated;
        config.hw_pwm.enabled = false;
    }
    if let Some(duration) = args.duration {
        config.demo.duration = duration;
    }
}

/// Bring up the hardware, run the loop, and clean up.
fn run_demo(config: &ToolkitConfig, signal_handler: &SignalHandler) -> Result<()> {
    let rt_status = init_realtime(&config.realtime).context("Real-time setup failed")?;
    info!(?rt_status, "Real-time status");

    let port = pi_gpio::open_port(&config.gpio).context("Failed to initialize GPIO")?;

    let pwm = PwmEngine::from_config(port.clone(), &config.soft_pwm);

    let hw_pwm = match pi_gpio::open_hw_pwm(&config.hw_pwm, &config.gpio, port.clone()) {
        Ok(hw) => hw,
        Err(e) => {
            warn!("Failed to initialize hardware PWM, using simulation: {e}");
            Box::new(pi_gpio::SimulatedHwPwm::new(port.clone()))
        }
    };
    info!(
        gpio = port.name(),
        hw_pwm = hw_pwm.name(),
        "Devices ready"
    );

    let clock = MonotonicClock::default();
    let mut demo = Demo::start(config.demo.clone(), clock, port, pwm, hw_pwm);

    demo.run(config.demo.duration, || signal_handler.shutdown_requested());

    info!("Shutting down...");
    let stats = demo.shutdown();

    info!(
        blinks = stats.blinks,
        pwm_updates = stats.pwm_updates,
        iterations = stats.iterations,
        signals = signal_handler.state().signal_count(),
        "Done"
    );
    Ok(())
}
