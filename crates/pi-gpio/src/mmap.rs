//! Memory-mapped GPIO port.
//!
//! Maps the GPIO register block from `/dev/gpiomem` (no root required on
//! Raspberry Pi OS) and drives pins with volatile register accesses:
//!
//! - Function select: read-modify-write of GPFSELn, serialized by a write lock
//! - Output: single writes to GPSETn / GPCLRn, which only affect set bits
//! - Input: single read of GPLEVn
//!
//! After [`release`](DigitalOutputPort::release) the mapping is gone and
//! every operation degrades to a no-op (reads return LOW).

use crate::registers::{
    bank_location, fsel_location, fsel_update, BLOCK_SIZE, GPCLR0, GPLEV0, GPSET0,
};
use crate::DigitalOutputPort;
use pi_common::error::{ToolkitError, ToolkitResult};
use pi_common::pin::{is_valid_pin, Level, Pin, PinMode};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

/// A mapped window of 32-bit peripheral registers.
pub(crate) struct RegisterBlock {
    base: NonNull<u32>,
    words: usize,
}

// SAFETY: the mapping is process-wide device memory; accesses are single
// volatile loads/stores and callers serialize read-modify-write sequences.
unsafe impl Send for RegisterBlock {}
unsafe impl Sync for RegisterBlock {}

impl RegisterBlock {
    /// Map `len` bytes of `device` starting at physical `offset`.
    #[cfg(unix)]
    pub(crate) fn map(device: &Path, offset: u64, len: usize) -> ToolkitResult<Self> {
        use nix::sys::mman::{mmap, MapFlags, ProtFlags};
        use std::fs::OpenOptions;
        use std::num::NonZeroUsize;
        use std::os::unix::fs::OpenOptionsExt;

        let length = NonZeroUsize::new(len).ok_or_else(|| {
            ToolkitError::InitializationFailure("cannot map an empty register block".into())
        })?;
        let offset = libc::off_t::try_from(offset).map_err(|_| {
            ToolkitError::InitializationFailure(format!("offset {offset:#x} out of range"))
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(device)
            .map_err(|e| {
                ToolkitError::InitializationFailure(format!(
                    "cannot open {}: {e}",
                    device.display()
                ))
            })?;

        // SAFETY: fresh shared mapping of a device node; no Rust object aliases it.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                offset,
            )
        }
        .map_err(|e| {
            ToolkitError::InitializationFailure(format!(
                "mmap of {} at {offset:#x} failed: {e}",
                device.display()
            ))
        })?;

        debug!(device = %device.display(), offset, len, "Register block mapped");

        // The mapping outlives the descriptor, so `file` can close here.
        Ok(Self {
            base: ptr.cast::<u32>(),
            words: len / std::mem::size_of::<u32>(),
        })
    }

    #[cfg(not(unix))]
    pub(crate) fn map(device: &Path, _offset: u64, _len: usize) -> ToolkitResult<Self> {
        Err(ToolkitError::InitializationFailure(format!(
            "memory-mapped registers ({}) are not available on this platform",
            device.display()
        )))
    }

    /// Volatile read of register `word`; out-of-block reads return 0.
    #[inline]
    pub(crate) fn read(&self, word: usize) -> u32 {
        if word >= self.words {
            return 0;
        }
        // SAFETY: `word` is within the mapped block.
        unsafe { std::ptr::read_volatile(self.base.as_ptr().add(word)) }
    }

    /// Volatile write of register `word`; out-of-block writes are dropped.
    #[inline]
    pub(crate) fn write(&self, word: usize, value: u32) {
        if word >= self.words {
            return;
        }
        // SAFETY: `word` is within the mapped block.
        unsafe { std::ptr::write_volatile(self.base.as_ptr().add(word), value) }
    }
}

#[cfg(unix)]
impl Drop for RegisterBlock {
    fn drop(&mut self) {
        let len = self.words * std::mem::size_of::<u32>();
        // SAFETY: `base` came from mmap with this length and is unmapped once.
        if let Err(e) = unsafe { nix::sys::mman::munmap(self.base.cast(), len) } {
            warn!("munmap of register block failed: {e}");
        }
    }
}

/// GPIO port backed by the memory-mapped BCM2711 register block.
pub struct MmapGpio {
    regs: RwLock<Option<RegisterBlock>>,
}

impl MmapGpio {
    /// Map the GPIO block exposed by `device` (usually `/dev/gpiomem`).
    ///
    /// # Errors
    ///
    /// Returns [`ToolkitError::InitializationFailure`] if the device cannot
    /// be opened or mapped.
    pub fn open(device: &Path) -> ToolkitResult<Self> {
        let block = RegisterBlock::map(device, 0, BLOCK_SIZE)?;
        info!(device = %device.display(), "GPIO registers mapped");
        Ok(Self {
            regs: RwLock::new(Some(block)),
        })
    }

    /// Whether the register block is still mapped.
    pub fn is_mapped(&self) -> bool {
        self.regs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn with_regs<R>(&self, f: impl FnOnce(&RegisterBlock) -> R) -> Option<R> {
        let guard = self.regs.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f)
    }
}

impl std::fmt::Debug for MmapGpio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapGpio")
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

impl DigitalOutputPort for MmapGpio {
    fn set_mode(&self, pin: Pin, mode: PinMode) {
        if !is_valid_pin(pin) {
            return;
        }
        let guard = self.regs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(regs) = guard.as_ref() {
            let (reg, shift) = fsel_location(pin);
            regs.write(reg, fsel_update(regs.read(reg), shift, mode.fsel_bits()));
        }
    }

    fn write(&self, pin: Pin, level: Level) {
        if !is_valid_pin(pin) {
            return;
        }
        let (bank, mask) = bank_location(pin);
        let base = if level.is_high() { GPSET0 } else { GPCLR0 };
        self.with_regs(|regs| regs.write(base + bank, mask));
    }

    fn read(&self, pin: Pin) -> Level {
        if !is_valid_pin(pin) {
            return Level::Low;
        }
        let (bank, mask) = bank_location(pin);
        self.with_regs(|regs| Level::from(regs.read(GPLEV0 + bank) & mask != 0))
            .unwrap_or(Level::Low)
    }

    fn release(&self) {
        let mut guard = self.regs.write().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            info!("GPIO registers unmapped");
        }
    }

    fn name(&self) -> &'static str {
        "mmap"
    }
}
