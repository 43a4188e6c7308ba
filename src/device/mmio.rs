//! Word-aligned 32-bit access to the device register window.
//!
//! The device is a 32-bit MMIO slave; every transaction is a complete
//! 32-bit read or write. [`RegisterBus`] is the seam between the engine
//! and whatever provides the window: [`MappedMmio`] maps a PCI BAR
//! resource file, and the behavioural simulation implements the same
//! trait in-process.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::Result;

/// 32-bit register access over a mapped window.
///
/// Offsets are byte offsets from the window base and must be word
/// aligned; implementations may debug-assert that.
pub trait RegisterBus: Send + Sync {
    fn read32(&self, off: u32) -> u32;
    fn write32(&self, off: u32, val: u32);

    /// Byte-block write, used for SRAM regions (descriptor tables and the
    /// command block).
    fn write_block(&self, off: u32, data: &[u8]);

    /// Length of the window in bytes.
    fn window_len(&self) -> u32;

    /// Base address of the window in this process, for the user-mapping
    /// control surface.
    fn base_addr(&self) -> usize;
}

/// A register window mapped from a file (a PCI BAR resource node).
pub struct MappedMmio {
    map: MmapMut,
}

// SAFETY: all access goes through volatile 32-bit loads/stores on a
// mapping that lives as long as self; the hardware serializes concurrent
// word transactions.
unsafe impl Send for MappedMmio {}
// SAFETY: see above.
unsafe impl Sync for MappedMmio {}

impl MappedMmio {
    /// Maps the full register window read-write from `path` (for PCI
    /// devices, the BAR0 resource file exposed by the platform).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: the resource file represents device memory owned by
        // this process for the lifetime of the mapping.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self { map })
    }

    #[inline]
    fn word_ptr(&self, off: u32) -> *mut u32 {
        debug_assert_eq!(off & 3, 0, "register offset {off:#x} not word aligned");
        debug_assert!(off < self.map.len() as u32);
        // Register state changes under the hardware's feet, so the map is
        // only ever touched through volatile word accesses.
        unsafe { self.map.as_ptr().add(off as usize).cast_mut().cast() }
    }
}

impl RegisterBus for MappedMmio {
    fn read32(&self, off: u32) -> u32 {
        // SAFETY: word_ptr bounds-checks the offset against the mapping.
        unsafe { self.word_ptr(off).read_volatile() }
    }

    fn write32(&self, off: u32, val: u32) {
        // SAFETY: word_ptr bounds-checks the offset against the mapping.
        unsafe { self.word_ptr(off).write_volatile(val) }
    }

    fn write_block(&self, off: u32, data: &[u8]) {
        // SRAM accepts word writes only; stage each dword.
        let mut off = off;
        for chunk in data.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.write32(off, u32::from_le_bytes(word));
            off += 4;
        }
    }

    fn window_len(&self) -> u32 {
        self.map.len() as u32
    }

    fn base_addr(&self) -> usize {
        self.map.as_ptr() as usize
    }
}
