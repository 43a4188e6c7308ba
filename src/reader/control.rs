//! Dense control-code surface over raw byte buffers.
//!
//! The typed methods on [`CxDevice`] do the real work; this module gives
//! them the fixed-size wire shape external tooling (the property page,
//! diagnostics) speaks: a small integer code, an input buffer and an
//! output buffer, with sizes checked before anything executes.

use std::sync::Arc;

use tracing::error;

use super::{CxDevice, ReaderHandle};
use crate::error::{CxError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlCode {
    ConfigGet,
    StateGet,
    CaptureStateGet,
    OuflowGet,
    VmuxGet,
    LevelGet,
    TenbitGet,
    SixdbGet,
    CenterOffsetGet,
    RegisterGet,
    BusNumberGet,
    DeviceAddressGet,
    PathGet,
    OuflowReset,
    VmuxSet,
    LevelSet,
    TenbitSet,
    SixdbSet,
    CenterOffsetSet,
    RegisterSet,
    NonBlockingSet,
    Mmap,
    Munmap,
}

impl CtlCode {
    pub fn from_raw(code: u32) -> Option<Self> {
        Some(match code {
            0x700 => Self::ConfigGet,
            0x701 => Self::StateGet,
            0x800 => Self::CaptureStateGet,
            0x810 => Self::OuflowGet,
            0x821 => Self::VmuxGet,
            0x822 => Self::LevelGet,
            0x823 => Self::TenbitGet,
            0x824 => Self::SixdbGet,
            0x825 => Self::CenterOffsetGet,
            0x82F => Self::RegisterGet,
            0x830 => Self::BusNumberGet,
            0x831 => Self::DeviceAddressGet,
            0x832 => Self::PathGet,
            0x910 => Self::OuflowReset,
            0x921 => Self::VmuxSet,
            0x922 => Self::LevelSet,
            0x923 => Self::TenbitSet,
            0x924 => Self::SixdbSet,
            0x925 => Self::CenterOffsetSet,
            0x92F => Self::RegisterSet,
            0x930 => Self::NonBlockingSet,
            0xA00 => Self::Mmap,
            0xA01 => Self::Munmap,
            _ => return None,
        })
    }
}

fn input_u32(input: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = input
        .try_into()
        .map_err(|_| CxError::InvalidParameter("input size"))?;
    Ok(u32::from_le_bytes(bytes))
}

fn output_bytes(output: &mut [u8], bytes: &[u8]) -> Result<usize> {
    if output.len() < bytes.len() {
        return Err(CxError::ControlBufferTooSmall {
            need: bytes.len(),
            got: output.len(),
        });
    }
    output[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

fn output_u32(output: &mut [u8], value: u32) -> Result<usize> {
    output_bytes(output, &value.to_le_bytes())
}

/// Executes one control request; returns the number of output bytes
/// written. Failures leave device state unchanged.
pub fn dispatch(
    dev: &Arc<CxDevice>,
    handle: &mut ReaderHandle,
    code: u32,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize> {
    let Some(code) = CtlCode::from_raw(code) else {
        error!(code = format_args!("{code:#x}"), "unknown control code");
        return Err(CxError::UnknownControl(code));
    };

    match code {
        CtlCode::ConfigGet => {
            let config = dev.config();
            let mut bytes = [0u8; 20];
            for (i, word) in [
                config.vmux,
                config.level,
                config.tenbit as u32,
                config.sixdb as u32,
                config.center_offset,
            ]
            .into_iter()
            .enumerate()
            {
                bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
            }
            output_bytes(output, &bytes)
        }

        CtlCode::StateGet => output_bytes(output, &dev.state().to_bytes()),

        CtlCode::CaptureStateGet => output_bytes(output, &[dev.is_capturing() as u8]),

        CtlCode::OuflowGet => output_u32(output, dev.ouflow_count()),

        CtlCode::VmuxGet => output_u32(output, dev.config().vmux),
        CtlCode::LevelGet => output_u32(output, dev.config().level),
        CtlCode::TenbitGet => output_u32(output, dev.config().tenbit as u32),
        CtlCode::SixdbGet => output_u32(output, dev.config().sixdb as u32),
        CtlCode::CenterOffsetGet => output_u32(output, dev.config().center_offset),

        CtlCode::RegisterGet => {
            let addr = input_u32(input)?;
            output_u32(output, dev.register_get(addr)?)
        }

        CtlCode::BusNumberGet => output_u32(output, dev.info().bus_number),
        CtlCode::DeviceAddressGet => output_u32(output, dev.info().device_address),

        CtlCode::PathGet => output_bytes(output, dev.info().path.as_bytes()),

        CtlCode::OuflowReset => {
            dev.reset_ouflow_count();
            Ok(0)
        }

        CtlCode::VmuxSet => {
            dev.set_vmux(input_u32(input)?)?;
            Ok(0)
        }
        CtlCode::LevelSet => {
            dev.set_level(input_u32(input)?)?;
            Ok(0)
        }
        CtlCode::TenbitSet => {
            dev.set_tenbit(input_u32(input)?)?;
            Ok(0)
        }
        CtlCode::SixdbSet => {
            dev.set_sixdb(input_u32(input)?)?;
            Ok(0)
        }
        CtlCode::CenterOffsetSet => {
            dev.set_center_offset(input_u32(input)?)?;
            Ok(0)
        }

        CtlCode::RegisterSet => {
            if input.len() != 8 {
                error!(len = input.len(), "invalid data for register set");
                return Err(CxError::InvalidParameter("input size"));
            }
            let addr = u32::from_le_bytes([input[0], input[1], input[2], input[3]]);
            let value = u32::from_le_bytes([input[4], input[5], input[6], input[7]]);
            dev.register_set(addr, value)?;
            Ok(0)
        }

        CtlCode::NonBlockingSet => {
            handle.set_non_blocking(true);
            Ok(0)
        }

        CtlCode::Mmap => {
            let addr = handle.mmap();
            output_bytes(output, &(addr as u64).to_le_bytes())
        }

        CtlCode::Munmap => {
            handle.munmap();
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_table_round_trips() {
        for raw in [
            0x700, 0x701, 0x800, 0x810, 0x821, 0x822, 0x823, 0x824, 0x825, 0x82F, 0x830, 0x831,
            0x832, 0x910, 0x921, 0x922, 0x923, 0x924, 0x925, 0x92F, 0x930, 0xA00, 0xA01,
        ] {
            assert!(CtlCode::from_raw(raw).is_some(), "code {raw:#x}");
        }
        assert!(CtlCode::from_raw(0x7FF).is_none());
    }

    #[test]
    fn input_size_is_exact() {
        assert!(input_u32(&[1, 2, 3]).is_err());
        assert!(input_u32(&[1, 2, 3, 4, 5]).is_err());
        assert_eq!(input_u32(&[1, 0, 0, 0]).unwrap(), 1);
    }

    #[test]
    fn short_output_is_rejected() {
        let mut out = [0u8; 2];
        assert!(matches!(
            output_u32(&mut out, 7),
            Err(CxError::ControlBufferTooSmall { need: 4, got: 2 })
        ));
    }
}
