//! Central error type for the capture stack.
//!
//! One `thiserror` enum covers all components; binaries wrap it in
//! `anyhow` at the top level. Ring construction keeps a distinct variant
//! per protocol step purely for diagnostics.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CxError>;

#[derive(Error, Debug)]
pub enum CxError {
    // Ring construction, one variant per step.
    #[error("ring size {0} is not a multiple of the allocation granularity")]
    RingSizeAlignment(usize),

    #[error("failed to create ring backing object: {0}")]
    RingBackingCreate(std::io::Error),

    #[error("failed to size ring backing object: {0}")]
    RingBackingSize(std::io::Error),

    #[error("failed to reserve ring address range: {0}")]
    RingReserve(std::io::Error),

    #[error("failed to map lower ring view: {0}")]
    RingMapLow(std::io::Error),

    #[error("failed to map upper ring view: {0}")]
    RingMapHigh(std::io::Error),

    #[error("insufficient ring space reserved: {requested} > {reserved}")]
    RingSpaceExhausted { requested: usize, reserved: usize },

    // Control surface.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("register address {0:#010x} out of range")]
    RegisterOutOfRange(u32),

    #[error("unknown control code {0:#x}")]
    UnknownControl(u32),

    #[error("control buffer too small: need {need}, got {got}")]
    ControlBufferTooSmall { need: usize, got: usize },

    // Device bring-up.
    #[error("unknown vendor/device id {vendor:04X}:{device:04X}")]
    UnknownDevice { vendor: u16, device: u16 },

    #[error("DMA allocation cannot satisfy the 32-bit bus address constraint")]
    DmaAddressRange,

    #[error("DMA allocation of {0} bytes failed")]
    DmaAlloc(usize),

    #[error("invalid DMA geometry: {0}")]
    DmaGeometry(&'static str),

    // Server & sources.
    #[error("audio: {0}")]
    Audio(String),

    #[error("capture bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CxError {
    /// Diagnostic step number for ring construction failures (1..=6),
    /// matching the construction protocol ordering.
    pub fn ring_step(&self) -> Option<u8> {
        match self {
            CxError::RingSizeAlignment(_) => Some(1),
            CxError::RingBackingCreate(_) => Some(2),
            CxError::RingBackingSize(_) => Some(3),
            CxError::RingReserve(_) => Some(4),
            CxError::RingMapLow(_) => Some(5),
            CxError::RingMapHigh(_) => Some(6),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_err() -> std::io::Error {
        std::io::Error::from_raw_os_error(12)
    }

    #[test]
    fn ring_steps_are_dense() {
        let errs = [
            CxError::RingSizeAlignment(123),
            CxError::RingBackingCreate(os_err()),
            CxError::RingBackingSize(os_err()),
            CxError::RingReserve(os_err()),
            CxError::RingMapLow(os_err()),
            CxError::RingMapHigh(os_err()),
        ];
        let steps: Vec<u8> = errs.iter().filter_map(|e| e.ring_step()).collect();
        assert_eq!(steps, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn non_ring_errors_have_no_step() {
        assert!(CxError::InvalidParameter("vmux").ring_step().is_none());
    }
}
