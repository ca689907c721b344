//! Acceptance tests for pi-toolkit.
//!
//! These tests exercise the timing properties of the toolkit on the real
//! monotonic clock with the simulated GPIO port:
//! - Periodic timer expiry counts under polling
//! - Software PWM duty accuracy and slot lifecycle
//! - Real-time aids on the host
//!
//! Real-time priority tests need root (or CAP_SYS_NICE); without it they
//! check that the refusal is reported as an error.

mod acceptance;
