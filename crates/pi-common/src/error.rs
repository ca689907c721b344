use thiserror::Error;

/// Toolkit error types covering hardware access, PWM slot management, and
/// real-time scheduling failures.
///
/// Invalid pin numbers and non-positive frequencies are deliberately absent:
/// those inputs are clamped or ignored by the operations that receive them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolkitError {
    /// A hardware resource (register mapping, device node, privilege) could
    /// not be acquired.
    #[error("initialization failure: {0}")]
    InitializationFailure(String),

    /// Every software PWM slot is in use.
    #[error("PWM capacity exceeded: all {capacity} slots are in use")]
    CapacityExceeded {
        /// Number of slots in the table.
        capacity: usize,
    },

    /// The OS refused to create a PWM worker thread.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawnFailure(String),

    /// A scheduler or affinity system call failed.
    #[error("real-time setup failed: {0}")]
    Realtime(String),

    /// A CPU index outside the online CPU range was requested.
    #[error("invalid CPU core {core} ({available} cores online)")]
    InvalidCpu {
        /// Requested core.
        core: usize,
        /// Number of online cores.
        available: usize,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for toolkit operations.
pub type ToolkitResult<T> = Result<T, ToolkitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ToolkitError::CapacityExceeded { capacity: 8 };
        assert_eq!(
            err.to_string(),
            "PWM capacity exceeded: all 8 slots are in use"
        );

        let err = ToolkitError::InvalidCpu {
            core: 7,
            available: 4,
        };
        assert_eq!(err.to_string(), "invalid CPU core 7 (4 cores online)");
    }
}
