//! Real-time scheduling and memory locking utilities.
//!
//! Optional jitter reduction for timing-critical loops:
//! - Memory locking (mlockall) to prevent page faults
//! - SCHED_FIFO priority so normal processes cannot preempt the loop
//! - CPU affinity, best combined with an `isolcpus=` kernel parameter
//!
//! Everything here is advisory. The toolkit runs correctly without it.

use pi_common::config::RealtimeConfig;
use pi_common::error::{ToolkitError, ToolkitResult};
use tracing::{debug, info, warn};

/// Result of real-time initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeStatus {
    /// Whether memory was locked successfully.
    pub memory_locked: bool,
    /// Applied SCHED_FIFO priority.
    pub priority: Option<u8>,
    /// CPU the calling thread is pinned to.
    pub cpu: Option<usize>,
}

/// Apply the real-time settings in `config` to the calling thread.
///
/// Missing privileges degrade to a warning and leave the matching status
/// field unset: EPERM/ENOMEM from the memory lock, any scheduler refusal,
/// and affinity failures on an online CPU.
///
/// # Errors
///
/// - [`ToolkitError::InvalidCpu`] if `config.cpu` is not online
/// - [`ToolkitError::Realtime`] if the memory lock fails for any other
///   reason
pub fn init_realtime(config: &RealtimeConfig) -> ToolkitResult<RealtimeStatus> {
    if !config.enabled {
        info!("Real-time scheduling disabled in configuration");
        return Ok(RealtimeStatus::default());
    }

    info!("Initializing real-time environment");

    let memory_locked = if config.lock_memory {
        lock_memory()?
    } else {
        false
    };

    let requested = match config.priority {
        Some(priority) => Some(priority),
        None => max_fifo_priority().ok(),
    };
    let priority = match requested {
        Some(priority) => match set_fifo_priority(priority) {
            Ok(applied) => Some(applied),
            Err(e) => {
                warn!(
                    "{e} - running without RT priority. \
                     Consider running with CAP_SYS_NICE capability or as root."
                );
                None
            }
        },
        None => None,
    };

    let cpu = match config.cpu {
        Some(core) => match pin_to_cpu(core) {
            Ok(()) => Some(core),
            Err(e @ ToolkitError::InvalidCpu { .. }) => return Err(e),
            Err(e) => {
                warn!(core, "{e}");
                None
            }
        },
        None => {
            debug!("No CPU affinity configured");
            None
        }
    };

    let status = RealtimeStatus {
        memory_locked,
        priority,
        cpu,
    };

    info!(?status, "Real-time initialization complete");
    Ok(status)
}

/// Switch the calling process to SCHED_FIFO at the highest priority the
/// policy allows.
///
/// Returns the applied priority.
///
/// # Errors
///
/// Returns [`ToolkitError::Realtime`] if the priority range cannot be
/// queried or the scheduler change is refused (usually EPERM without root).
pub fn elevate_priority() -> ToolkitResult<u8> {
    let priority = max_fifo_priority()?;
    set_fifo_priority(priority)
}

/// Highest SCHED_FIFO priority, usually 99.
#[cfg(target_os = "linux")]
fn max_fifo_priority() -> ToolkitResult<u8> {
    // SAFETY: sched_get_priority_max only reads its argument
    let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    if max == -1 {
        let err = std::io::Error::last_os_error();
        return Err(ToolkitError::Realtime(format!(
            "sched_get_priority_max failed: {err}"
        )));
    }
    u8::try_from(max)
        .map_err(|_| ToolkitError::Realtime(format!("unexpected SCHED_FIFO maximum {max}")))
}

#[cfg(not(target_os = "linux"))]
fn max_fifo_priority() -> ToolkitResult<u8> {
    Err(ToolkitError::Realtime(
        "real-time scheduling not available on this platform".into(),
    ))
}

/// Set SCHED_FIFO at `priority` (clamped to 1..=99) for the calling process.
#[cfg(target_os = "linux")]
fn set_fifo_priority(priority: u8) -> ToolkitResult<u8> {
    let clamped = priority.clamp(1, 99);
    if clamped != priority {
        warn!(
            original = priority,
            clamped, "Scheduler priority clamped to valid range"
        );
    }

    debug!(priority = clamped, "Setting SCHED_FIFO");

    let param = libc::sched_param {
        sched_priority: i32::from(clamped),
    };
    // SAFETY: `param` is a valid sched_param and pid 0 names the caller
    let result = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        return Err(ToolkitError::Realtime(format!(
            "sched_setscheduler failed: {err}"
        )));
    }

    info!(priority = clamped, "SCHED_FIFO priority set");
    Ok(clamped)
}

#[cfg(not(target_os = "linux"))]
fn set_fifo_priority(priority: u8) -> ToolkitResult<u8> {
    warn!(priority, "Real-time scheduling not available on this platform");
    Err(ToolkitError::Realtime(
        "real-time scheduling not available on this platform".into(),
    ))
}

/// Number of online CPU cores.
///
/// # Errors
///
/// Returns [`ToolkitError::Realtime`] if the count cannot be determined.
#[cfg(unix)]
pub fn cpu_count() -> ToolkitResult<usize> {
    // SAFETY: sysconf is safe to call
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    usize::try_from(count)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            ToolkitError::Realtime(format!(
                "sysconf(_SC_NPROCESSORS_ONLN) failed: {}",
                std::io::Error::last_os_error()
            ))
        })
}

#[cfg(not(unix))]
pub fn cpu_count() -> ToolkitResult<usize> {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .map_err(|e| ToolkitError::Realtime(format!("cannot determine CPU count: {e}")))
}

/// Pin the calling thread to CPU `core`.
///
/// # Errors
///
/// Returns [`ToolkitError::InvalidCpu`] if `core` is not below
/// [`cpu_count`], or [`ToolkitError::Realtime`] if the affinity call fails.
pub fn pin_to_cpu(core: usize) -> ToolkitResult<()> {
    let available = cpu_count()?;
    if core >= available {
        return Err(ToolkitError::InvalidCpu { core, available });
    }
    set_cpu_affinity(core)
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(core: usize) -> ToolkitResult<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    debug!(core, "Setting CPU affinity");

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(core)
        .map_err(|e| ToolkitError::Realtime(format!("Invalid CPU index {core}: {e}")))?;

    // Pid 0 is the calling thread
    sched_setaffinity(Pid::from_raw(0), &cpu_set)
        .map_err(|e| ToolkitError::Realtime(format!("sched_setaffinity failed: {e}")))?;

    info!(core, "CPU affinity set");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(core: usize) -> ToolkitResult<()> {
    warn!(core, "CPU affinity not available on this platform");
    Err(ToolkitError::Realtime(
        "CPU affinity not available on this platform".into(),
    ))
}

/// Lock all current and future memory pages.
#[cfg(target_os = "linux")]
fn lock_memory() -> ToolkitResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    debug!("Locking memory pages with mlockall");

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked successfully");
            Ok(true)
        }
        Err(e) => {
            // EPERM/ENOMEM are common without CAP_IPC_LOCK or a raised RLIMIT_MEMLOCK
            if e == nix::errno::Errno::EPERM || e == nix::errno::Errno::ENOMEM {
                warn!(
                    "mlockall failed with {e} - running without CAP_IPC_LOCK capability. \
                     Page faults may occur during execution."
                );
                Ok(false)
            } else {
                Err(ToolkitError::Realtime(format!("mlockall failed: {e}")))
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> ToolkitResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_rt() {
        let config = RealtimeConfig {
            enabled: false,
            ..Default::default()
        };

        let status = init_realtime(&config).unwrap();
        assert_eq!(status, RealtimeStatus::default());
    }

    #[test]
    fn test_cpu_count() {
        let count = cpu_count().unwrap();
        assert!(count >= 1);
    }

    #[test]
    fn test_pin_to_invalid_cpu() {
        let available = cpu_count().unwrap();
        let err = pin_to_cpu(available).unwrap_err();
        assert_eq!(
            err,
            ToolkitError::InvalidCpu {
                core: available,
                available
            }
        );
        assert!(matches!(
            pin_to_cpu(usize::MAX),
            Err(ToolkitError::InvalidCpu { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_to_allowed_cpu() {
        use nix::sched::sched_getaffinity;
        use nix::unistd::Pid;

        // The cpuset may exclude some online CPUs
        let allowed = sched_getaffinity(Pid::from_raw(0)).unwrap();
        let available = cpu_count().unwrap();
        let core = (0..available)
            .find(|&c| allowed.is_set(c).unwrap_or(false))
            .unwrap();

        // Runs on its own thread so the test harness keeps its affinity
        std::thread::spawn(move || pin_to_cpu(core))
            .join()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_invalid_cpu_in_config_is_an_error() {
        let available = cpu_count().unwrap();
        let config = RealtimeConfig {
            enabled: true,
            priority: Some(1),
            cpu: Some(available + 1),
            lock_memory: false,
        };
        // Priority may fail with EPERM; that only warns
        let result = std::thread::spawn(move || init_realtime(&config))
            .join()
            .unwrap();
        assert!(matches!(result, Err(ToolkitError::InvalidCpu { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_fifo_priority() {
        let max = max_fifo_priority().unwrap();
        assert!((1..=99).contains(&max));
    }
}
