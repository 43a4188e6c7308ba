//! The DMA ring engine and its hardware model.
//!
//! - [`regs`]: register map and typed values
//! - [`mmio`]: the 32-bit register access seam ([`mmio::RegisterBus`])
//! - [`dma`]: pinned DMA memory and ring geometry
//! - [`risc`]: RISC program synthesis
//! - [`interrupt`]: interrupt dispatch and the DPC event
//! - [`engine`]: the engine itself
//! - [`sim`]: behavioural chip simulation
//!
//! The enumeration plumbing is an external collaborator: it supplies a
//! mapped register window, a DMA allocator with real bus addresses and an
//! interrupt delivery channel. [`sim::build_sim_device`] supplies all
//! three in-process.

pub mod dma;
pub mod engine;
pub mod interrupt;
pub mod mmio;
pub mod regs;
pub mod risc;
pub mod sim;

pub use dma::{DmaAllocator, DmaBuf, DmaGeometry, DmaRing};
pub use engine::{CxEngine, DeviceConfig, DeviceState};
pub use mmio::{MappedMmio, RegisterBus};

use crate::error::{CxError, Result};

// Tuning parameter ranges and defaults, enforced by the control surface.
pub const VMUX_DEFAULT: u32 = 2;
pub const VMUX_MAX: u32 = 3;
pub const LEVEL_DEFAULT: u32 = 16;
pub const LEVEL_MAX: u32 = 31;
pub const TENBIT_DEFAULT: bool = false;
pub const SIXDB_DEFAULT: bool = false;
pub const CENTER_OFFSET_DEFAULT: u32 = 0;
pub const CENTER_OFFSET_MAX: u32 = 63;

/// Rejects parts this driver does not understand.
pub fn check_device_id(vendor: u16, device: u16) -> Result<()> {
    if vendor != regs::VENDOR_ID || device != regs::DEVICE_ID {
        return Err(CxError::UnknownDevice { vendor, device });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::engine::CxEngine;
    use super::sim::{SimBusMemory, SimChip, SimDmaAllocator};
    use super::*;
    use std::sync::Arc;

    fn small_geometry() -> DmaGeometry {
        DmaGeometry {
            page_size: 4096,
            ring_bytes: 64 * 4096,
            irq_period_in_pages: 4,
        }
    }

    fn sim_engine() -> (Arc<CxEngine>, Arc<SimChip>) {
        let mem = SimBusMemory::new();
        let allocator = SimDmaAllocator::new(Arc::clone(&mem));
        let ring = DmaRing::alloc(&allocator, small_geometry()).unwrap();
        let (chip, _irq_rx) = SimChip::new(mem);
        let engine = Arc::new(CxEngine::new(
            Arc::clone(&chip) as Arc<dyn RegisterBus>,
            ring,
            DeviceConfig::default(),
        ));
        engine.init();
        engine.enable_interrupt_line();
        (engine, chip)
    }

    #[test]
    fn unknown_parts_are_rejected() {
        assert!(check_device_id(regs::VENDOR_ID, regs::DEVICE_ID).is_ok());
        assert!(matches!(
            check_device_id(0x8086, 0x1234),
            Err(CxError::UnknownDevice { .. })
        ));
    }

    #[test]
    fn init_programs_the_front_end() {
        let (engine, chip) = sim_engine();
        let bus = engine.bus();

        assert_eq!(bus.read32(regs::CONTR_BRIGHT), 0xFF00);
        assert_eq!(bus.read32(regs::COLOR_FORMAT_CTRL), 0xEE);
        assert_eq!(bus.read32(regs::SAMPLE_RATE_CONV), 0x20000);
        assert_eq!(bus.read32(regs::PLL), regs::pll(0x10, 0, 1));
        assert_eq!(bus.read32(regs::AFE_CFG), 0x12);
        assert_eq!(bus.read32(regs::I2C_CONTROL), 0x3);
        assert_eq!(
            bus.read32(regs::VBI_PACKET),
            regs::vbi_packet(2, regs::CDT_BUF_LEN)
        );
        assert_eq!(bus.read32(regs::PLL_ADJUST) & regs::PLL_ADJUST_EN, 0);

        // VBI DMA channel describes the CDT.
        assert_eq!(bus.read32(regs::VBI_DMA_CNT1), regs::CDT_BUF_LEN / 8 - 1);
        assert_eq!(bus.read32(regs::VBI_DMA_PTR2), regs::SRAM_CDT_BASE >> 2);
        assert_eq!(bus.read32(regs::VBI_DMA_CNT2), regs::CDT_BUF_COUNT * 2);

        // Config application: default vmux lands in the mux field.
        assert_eq!((bus.read32(regs::INPUT_FORMAT) >> 14) & 3, VMUX_DEFAULT);
        // Level with a frozen loop.
        assert_eq!(
            bus.read32(regs::AGC_GAIN_ADJUST_4),
            regs::agc_gain_4(0, 0xFF, LEVEL_DEFAULT, false, false, false)
        );

        drop(chip);
    }

    #[test]
    fn cmds_block_points_at_the_program() {
        let (engine, chip) = sim_engine();
        let bus = engine.bus();
        // First command word is the RISC program's bus address; the
        // allocator hands addresses out from its fixed base.
        let risc_addr = bus.read32(regs::SRAM_CMDS_VBI_BASE);
        assert_eq!(risc_addr, 0x0100_0000);
        assert_eq!(bus.read32(regs::SRAM_CMDS_VBI_BASE + 4), regs::SRAM_CDT_BASE);
        assert_eq!(
            bus.read32(regs::SRAM_CMDS_VBI_BASE + 8),
            regs::CDT_BUF_COUNT * 2
        );
        assert_eq!(
            bus.read32(regs::SRAM_CMDS_VBI_BASE + 12),
            regs::SRAM_RISC_QUEUE_BASE
        );
        drop(chip);
    }

    #[test]
    fn cdt_descriptors_cover_the_sram_buffers() {
        let (engine, _chip) = sim_engine();
        let bus = engine.bus();
        for i in 0..regs::CDT_BUF_COUNT {
            let descriptor = bus.read32(regs::SRAM_CDT_BASE + i * regs::CDT_DESCRIPTOR_LEN);
            assert_eq!(descriptor, regs::SRAM_CDT_BUF_BASE + i * regs::CDT_BUF_LEN);
        }
    }

    #[test]
    fn start_and_stop_toggle_the_paths() {
        let (engine, chip) = sim_engine();
        assert!(!chip.running());

        engine.start_capture();
        assert!(engine.is_capturing());
        assert!(chip.running());
        assert_eq!(
            engine.bus().read32(regs::VID_INT_MSK),
            regs::VidInt::capture_mask().bits()
        );

        // A second start is a no-op.
        engine.start_capture();
        assert!(engine.is_capturing());

        engine.stop_capture();
        assert!(!engine.is_capturing());
        assert!(!chip.running());
        assert_eq!(engine.bus().read32(regs::VID_INT_MSK), 0);
    }

    #[test]
    fn isr_claims_only_risci1() {
        let (engine, chip) = sim_engine();
        engine.start_capture();

        // Status zero: not our interrupt.
        assert!(!engine.isr());

        // Unrecognized source only: observed, cleared, not claimed.
        chip.write_block(
            regs::VID_INT_STAT,
            &regs::VidInt::VBIF_OF.bits().to_le_bytes(),
        );
        assert!(!engine.isr());
        assert_eq!(engine.bus().read32(regs::VID_INT_MSTAT), 0);

        // RISCI1 set: claimed and cleared.
        chip.write_block(
            regs::VID_INT_STAT,
            &regs::VidInt::VBI_RISCI1.bits().to_le_bytes(),
        );
        assert!(engine.isr());
        assert_eq!(engine.bus().read32(regs::VID_INT_MSTAT), 0);
    }

    #[test]
    fn dpc_rounds_the_counter_down() {
        let (engine, chip) = sim_engine();
        engine.start_capture();

        // 6 pages produced with an IRQ period of 4: only the first 4 are
        // guaranteed resident.
        assert_eq!(chip.step_pages(6), 6);
        assert_eq!(chip.gp_cnt(), 6);
        engine.dpc();
        assert_eq!(engine.last_gp_cnt(), 4);

        // Two more complete the second interrupt period.
        chip.step_pages(2);
        engine.dpc();
        assert_eq!(engine.last_gp_cnt(), 8);
    }

    #[test]
    fn gp_counter_wraps_with_the_ring() {
        let (engine, chip) = sim_engine();
        engine.start_capture();

        // A full ring resets the counter to zero.
        chip.step_pages(64);
        assert_eq!(chip.gp_cnt(), 0);
        engine.dpc();
        assert_eq!(engine.last_gp_cnt(), 0);

        chip.step_pages(4);
        assert_eq!(chip.gp_cnt(), 4);
    }

    #[test]
    fn sim_executes_the_program_with_a_gapless_pattern() {
        let (engine, chip) = sim_engine();
        engine.start_capture();
        chip.step_pages(2);

        let mut first = vec![0u8; 4096];
        let mut second = vec![0u8; 4096];
        engine.copy_page(0, 0, &mut first);
        engine.copy_page(1, 0, &mut second);

        let mut expected = 0u8;
        for &b in first.iter().chain(second.iter()) {
            assert_eq!(b, expected);
            expected = expected.wrapping_add(1);
        }
    }

    #[test]
    fn overflow_bit_is_sticky_until_cleared() {
        let (engine, chip) = sim_engine();
        assert!(!engine.ouflow_state());
        chip.inject_overflow();
        assert!(engine.ouflow_state());
        assert!(engine.ouflow_state(), "reading must not clear it");
        engine.reset_ouflow_state();
        assert!(!engine.ouflow_state());
    }

    #[test]
    fn irq_delivery_follows_the_masks() {
        let mem = SimBusMemory::new();
        let allocator = SimDmaAllocator::new(Arc::clone(&mem));
        let ring = DmaRing::alloc(&allocator, small_geometry()).unwrap();
        let (chip, irq_rx) = SimChip::new(mem);
        let engine = Arc::new(CxEngine::new(
            Arc::clone(&chip) as Arc<dyn RegisterBus>,
            ring,
            DeviceConfig::default(),
        ));
        engine.init();

        // PCI line still masked: producing pages raises status but no
        // interrupt message.
        engine.start_capture();
        chip.step_pages(4);
        assert!(irq_rx.try_recv().is_err());

        engine.enable_interrupt_line();
        chip.step_pages(4);
        assert!(irq_rx.try_recv().is_ok());
    }

    #[test]
    fn state_snapshot_wire_layout() {
        let state = DeviceState {
            last_gp_cnt: 1,
            initial_page: 2,
            ouflow_count: 3,
            reader_count: 4,
            is_capturing: true,
        };
        let bytes = state.to_bytes();
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_le_bytes());
    }
}
