//! Signal handling for an early, clean exit from the demo loop.
//!
//! SIGINT and SIGTERM set an atomic flag that the loop polls between
//! iterations, so PWM outputs are always stopped and the GPIO port released
//! before the process exits.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Signals that end the demo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM.
    Terminate,
    /// SIGINT (Ctrl+C).
    Interrupt,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Shutdown state shared between the signal relay and the demo loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// Create a new signal state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Request shutdown (can be called from any thread).
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    fn record_signal(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        info!(signal = %kind, "Signal received");
        self.request_shutdown();
    }

    /// Get the total number of signals received.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

// Handlers may only touch atomics; the relay thread does the rest.
static SIGINT_FLAG: AtomicBool = AtomicBool::new(false);
static SIGTERM_FLAG: AtomicBool = AtomicBool::new(false);

/// Handle for signal management.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Create a handler and register SIGINT and SIGTERM handlers.
    ///
    /// On non-Unix platforms only [`request_shutdown`](Self::request_shutdown)
    /// ends the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler cannot be installed or the relay
    /// thread cannot be spawned.
    pub fn new() -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(SignalState::new()),
        };

        #[cfg(unix)]
        handler.register_unix_handlers()?;

        Ok(handler)
    }

    #[cfg(unix)]
    fn register_unix_handlers(&self) -> std::io::Result<()> {
        use std::os::raw::c_int;

        extern "C" fn sigint_handler(_: c_int) {
            SIGINT_FLAG.store(true, Ordering::Relaxed);
        }

        extern "C" fn sigterm_handler(_: c_int) {
            SIGTERM_FLAG.store(true, Ordering::Relaxed);
        }

        // Relay the static flags into our state until shutdown
        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("signal-relay".into())
            .spawn(move || {
                while !state.shutdown_requested() {
                    if SIGINT_FLAG.swap(false, Ordering::Relaxed) {
                        state.record_signal(SignalKind::Interrupt);
                    }
                    if SIGTERM_FLAG.swap(false, Ordering::Relaxed) {
                        state.record_signal(SignalKind::Terminate);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                debug!("Signal relay thread exited");
            })?;

        let handlers: [(c_int, extern "C" fn(c_int)); 2] = [
            (libc::SIGINT, sigint_handler),
            (libc::SIGTERM, sigterm_handler),
        ];
        for (signal, handler) in handlers {
            // SAFETY: the handlers only store to static atomics
            let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
            if previous == libc::SIG_ERR {
                return Err(std::io::Error::last_os_error());
            }
        }

        debug!("Unix signal handlers registered");
        Ok(())
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Manually request shutdown.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Get the signal state for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}
