//! Pin identifiers, logic levels, and function-select modes for the BCM2711
//! GPIO block.
//!
//! Pins use BCM numbering. The valid range is fixed by the chip
//! (`0..=53`); operations receiving a pin outside it ignore the call rather
//! than failing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// BCM GPIO pin number.
pub type Pin = u8;

/// Lowest valid BCM pin number.
pub const GPIO_PIN_MIN: Pin = 0;

/// Highest valid BCM pin number.
pub const GPIO_PIN_MAX: Pin = 53;

/// Number of pins in the GPIO block.
pub const GPIO_PIN_COUNT: usize = GPIO_PIN_MAX as usize + 1;

/// Check whether `pin` lies in the chip's GPIO range.
#[inline]
#[must_use]
pub fn is_valid_pin(pin: Pin) -> bool {
    (GPIO_PIN_MIN..=GPIO_PIN_MAX).contains(&pin)
}

/// Digital logic level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Logic low (0 V).
    #[default]
    Low,
    /// Logic high (3.3 V).
    High,
}

impl Level {
    /// Return the opposite level.
    #[must_use]
    pub fn toggled(self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }

    /// Returns true for [`Level::High`].
    #[must_use]
    pub fn is_high(self) -> bool {
        self == Self::High
    }
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value {
            Self::High
        } else {
            Self::Low
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Alternate pin functions.
///
/// The discriminants are the 3-bit GPFSEL encodings, which are not in
/// numeric order of the function index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AltFunction {
    /// Alternate function 0.
    Alt0 = 0b100,
    /// Alternate function 1.
    Alt1 = 0b101,
    /// Alternate function 2.
    Alt2 = 0b110,
    /// Alternate function 3.
    Alt3 = 0b111,
    /// Alternate function 4.
    Alt4 = 0b011,
    /// Alternate function 5.
    Alt5 = 0b010,
}

impl AltFunction {
    /// GPFSEL field value for this function.
    #[inline]
    #[must_use]
    pub fn fsel_bits(self) -> u32 {
        self as u32
    }
}

/// Pin direction or function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    /// Digital input.
    Input,
    /// Digital output.
    Output,
    /// Peripheral-controlled alternate function.
    Alt(AltFunction),
}

impl PinMode {
    /// GPFSEL field value for this mode.
    #[must_use]
    pub fn fsel_bits(self) -> u32 {
        match self {
            Self::Input => 0b000,
            Self::Output => 0b001,
            Self::Alt(function) => function.fsel_bits(),
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "INPUT"),
            Self::Output => write!(f, "OUTPUT"),
            Self::Alt(function) => write!(f, "{function:?}"),
        }
    }
}
