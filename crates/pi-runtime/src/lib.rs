#![doc = "Real-time engine for pi-toolkit: software PWM workers and scheduling aids."]

pub mod realtime;
pub mod soft_pwm;

pub use realtime::*;
pub use soft_pwm::*;
