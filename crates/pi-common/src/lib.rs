#![doc = "Common types shared across the pi-toolkit workspace."]

pub mod config;
pub mod error;
pub mod pin;

pub use config::*;
pub use error::*;
pub use pin::*;
