//! Timing primitives for polling control loops.
//!
//! - **Clock** ([`clock`]): monotonic time, pluggable sleep strategies, and a
//!   virtual clock for tests
//! - **Periodic timer** ([`timer`]): non-blocking, drift-compensating interval
//!   detection
//!
//! # Example
//!
//! ```no_run
//! use pi_timing::PeriodicTimer;
//!
//! let mut blink = PeriodicTimer::new(500);
//! let mut poll = PeriodicTimer::new(100);
//!
//! loop {
//!     if blink.tick() {
//!         // toggle LED
//!     }
//!     if poll.tick() {
//!         // read sensor
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! }
//! ```

pub mod clock;
pub mod timer;

pub use clock::{
    delay_ms, delay_us, micros, millis, Clock, ClockHold, MonotonicClock, VirtualClock,
};
pub use timer::PeriodicTimer;
