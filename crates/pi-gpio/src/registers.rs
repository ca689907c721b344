//! BCM2711 GPIO register map and the pure offset arithmetic used by the
//! memory-mapped port.
//!
//! Offsets are in 32-bit words from the start of the GPIO block.

use pi_common::pin::Pin;

/// Size of one mapped register block in bytes.
pub const BLOCK_SIZE: usize = 4 * 1024;

/// Function select register for pins 0-9; pins 10-19 use the next word, etc.
pub const GPFSEL0: usize = 0;
/// Output set register for pins 0-31 (0x1C).
pub const GPSET0: usize = 7;
/// Output clear register for pins 0-31 (0x28).
pub const GPCLR0: usize = 10;
/// Pin level register for pins 0-31 (0x34).
pub const GPLEV0: usize = 13;

/// Width of one function select field.
const FSEL_BITS: u32 = 3;
/// Pins covered by one function select register.
const FSEL_PINS_PER_REG: Pin = 10;
const FSEL_MASK: u32 = 0b111;

/// Register word and bit shift of `pin`'s function select field.
#[inline]
#[must_use]
pub fn fsel_location(pin: Pin) -> (usize, u32) {
    let reg = GPFSEL0 + usize::from(pin / FSEL_PINS_PER_REG);
    let shift = u32::from(pin % FSEL_PINS_PER_REG) * FSEL_BITS;
    (reg, shift)
}

/// Replace the 3-bit field at `shift` in `current` with `bits`.
#[inline]
#[must_use]
pub fn fsel_update(current: u32, shift: u32, bits: u32) -> u32 {
    (current & !(FSEL_MASK << shift)) | ((bits & FSEL_MASK) << shift)
}

/// Bank offset (0 for pins 0-31, 1 for 32-53) and bit mask of `pin` in the
/// set/clear/level registers.
#[inline]
#[must_use]
pub fn bank_location(pin: Pin) -> (usize, u32) {
    (usize::from(pin / 32), 1 << (pin % 32))
}
