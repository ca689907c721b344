//! Integration tests for pi-toolkit acceptance testing.

mod common;
mod pwm_test;
mod realtime_test;
mod timer_test;
