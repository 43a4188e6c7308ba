//! Input level calibration.
//!
//! Hunts for the highest AGC gain level that does not clip: walk the
//! level up while captured samples stay inside the rails, then back down
//! until a pass comes through clean. The device is left programmed with
//! the settled level.

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::reader::{CxDevice, ReaderHandle};

/// Clipped-sample count at which a pass fails.
pub const CLIP_LIMIT: usize = 20;

/// A sample sitting exactly on a rail weighs this much; one hit is an
/// instant fail.
const RAIL_PENALTY: usize = 2 * CLIP_LIMIT;

/// Counting stops here; the pass already failed.
const SCAN_CUTOFF: usize = 4 * CLIP_LIMIT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipStats {
    pub low: u32,
    pub high: u32,
    pub clipped: usize,
    pub samples: usize,
}

/// Scans 8-bit samples; the soft rails sit at 0x08 and 0xF8.
pub fn scan_eight_bit(data: &[u8]) -> ClipStats {
    let mut stats = ClipStats {
        low: 255,
        high: 0,
        clipped: 0,
        samples: data.len(),
    };
    for &sample in data {
        stats.low = stats.low.min(sample as u32);
        stats.high = stats.high.max(sample as u32);
        if sample == 0 || sample == 0xFF {
            stats.clipped += RAIL_PENALTY;
        } else if sample < 0x08 || sample > 0xF8 {
            stats.clipped += 1;
        }
        if stats.clipped >= SCAN_CUTOFF {
            break;
        }
    }
    stats
}

/// Scans 10-bit captures (16-bit little-endian words); the soft rails
/// sit at 0x0800 and 0xF800.
pub fn scan_ten_bit(data: &[u8]) -> ClipStats {
    let mut stats = ClipStats {
        low: 65535,
        high: 0,
        clipped: 0,
        samples: data.len() / 2,
    };
    for word in data.chunks_exact(2) {
        let sample = u16::from_le_bytes([word[0], word[1]]);
        stats.low = stats.low.min(sample as u32);
        stats.high = stats.high.max(sample as u32);
        if sample == 0 || sample == 0xFFFF {
            stats.clipped += RAIL_PENALTY;
        } else if sample < 0x0800 || sample > 0xF800 {
            stats.clipped += 1;
        }
        if stats.clipped >= SCAN_CUTOFF {
            break;
        }
    }
    stats
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ascending,
    Descending,
}

/// The hunt itself, independent of where samples come from.
///
/// Feed it one verdict per measurement pass; it answers with the next
/// level to program, or `None` once settled.
#[derive(Debug)]
pub struct LevelAdjuster {
    level: i32,
    phase: Phase,
}

impl LevelAdjuster {
    pub fn new(start_level: u32) -> Self {
        Self {
            level: start_level.min(crate::device::LEVEL_MAX) as i32,
            phase: Phase::Ascending,
        }
    }

    /// The level the last measurement ran at.
    pub fn level(&self) -> u32 {
        self.level as u32
    }

    pub fn observe(&mut self, clipped: bool) -> Option<u32> {
        match (self.phase, clipped) {
            (Phase::Ascending, false) => self.level += 1,
            (Phase::Ascending, true) => {
                self.phase = Phase::Descending;
                self.level -= 1;
            }
            (Phase::Descending, true) => self.level -= 1,
            // Clean again on the way down: settled at this level.
            (Phase::Descending, false) => return None,
        }
        // Off either end of the range: settle at the boundary, which is
        // the last level actually programmed.
        if self.level < 0 {
            self.level = 0;
            return None;
        }
        if self.level > crate::device::LEVEL_MAX as i32 {
            self.level = crate::device::LEVEL_MAX as i32;
            return None;
        }
        Some(self.level as u32)
    }
}

/// Where calibration samples come from.
pub trait LevelTarget {
    fn tenbit(&self) -> Result<bool>;
    fn set_level(&mut self, level: u32) -> Result<()>;
    /// Fills `buf` completely (or as far as the stream allows).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// The in-process device as a calibration target.
pub struct DeviceLevelTarget {
    device: Arc<CxDevice>,
    handle: ReaderHandle,
}

impl DeviceLevelTarget {
    pub fn new(device: Arc<CxDevice>) -> Self {
        let handle = device.open();
        Self { device, handle }
    }
}

impl LevelTarget for DeviceLevelTarget {
    fn tenbit(&self) -> Result<bool> {
        Ok(self.device.config().tenbit)
    }

    fn set_level(&mut self, level: u32) -> Result<()> {
        self.device.set_level(level)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.handle.read(buf))
    }
}

/// Runs the hunt and returns the settled level.
///
/// After each level change, `discard_len` bytes are read and thrown away
/// so the measurement only sees samples captured at the new gain (the
/// ring still holds a full lap of old ones).
pub fn run(
    target: &mut dyn LevelTarget,
    start_level: u32,
    read_len: usize,
    discard_len: usize,
) -> Result<u32> {
    let tenbit = target.tenbit()?;
    let mut adjuster = LevelAdjuster::new(start_level);
    let mut buf = vec![0u8; read_len.max(discard_len)];

    loop {
        let level = adjuster.level();
        target.set_level(level)?;
        info!(level, "testing level");

        target.read(&mut buf[..discard_len])?;
        let n = target.read(&mut buf[..read_len])?;

        let stats = if tenbit {
            scan_ten_bit(&buf[..n])
        } else {
            scan_eight_bit(&buf[..n])
        };
        info!(
            low = stats.low,
            high = stats.high,
            clipped = stats.clipped,
            samples = stats.samples,
            "scan pass"
        );

        if adjuster.observe(stats.clipped >= CLIP_LIMIT).is_none() {
            return Ok(adjuster.level());
        }
    }
}
