//! CX2388x register map.
//!
//! Offsets and bit layouts for the registers the capture path programs,
//! plus the on-chip SRAM layout used by the VBI DMA channel. Every access
//! through [`super::mmio::RegisterBus`] is a word-aligned 32-bit
//! transaction; the typed value structs below pack the documented fields
//! into those words.

use bitflags::bitflags;

/// PCI identity of the supported parts.
pub const VENDOR_ID: u16 = 0x14F1;
pub const DEVICE_ID: u16 = 0x8800;

/// Size of the register BAR.
pub const MMIO_LEN: u32 = 0x40_0000;

/// Range accepted by the register peek/poke surface.
pub const REGISTER_BASE: u32 = 0x18_0000;
pub const REGISTER_END: u32 = 0x3F_FFFC;

// --- On-chip SRAM layout (VBI channel) ---------------------------------

pub const SRAM_CMDS_VBI_BASE: u32 = 0x18_0100;
pub const SRAM_RISC_QUEUE_BASE: u32 = 0x18_0800;
pub const SRAM_CDT_BASE: u32 = 0x18_0900;
pub const SRAM_CDT_BUF_BASE: u32 = 0x18_1000;

/// FIFO burst length; must stay a multiple of 8.
pub const CDT_BUF_LEN: u32 = 2048;
/// Cluster descriptor count.
pub const CDT_BUF_COUNT: u32 = 8;
/// Bytes per CDT descriptor entry in SRAM.
pub const CDT_DESCRIPTOR_LEN: u32 = 16;
/// RISC queue size programmed into the command block.
pub const RISC_QUEUE_SIZE: u32 = 0x40;

// --- DMA controller ----------------------------------------------------

/// Device control 2; bit 5 runs the RISC processor.
pub const DEV_CNTRL2: u32 = 0x20_0034;
pub const DEV_CNTRL2_RUN_RISC: u32 = 1 << 5;

pub const PCI_INT_MSK: u32 = 0x20_0040;
pub const PCI_INT_STAT: u32 = 0x20_0044;
pub const PCI_INT_MSTAT: u32 = 0x20_0048;

pub const VID_INT_MSK: u32 = 0x20_0050;
/// Write-one-to-clear.
pub const VID_INT_STAT: u32 = 0x20_0054;
/// Status AND mask, read-only.
pub const VID_INT_MSTAT: u32 = 0x20_0058;

/// VBI DMA channel: buffer size, cluster table pointer, table size.
pub const VBI_DMA_CNT1: u32 = 0x30_0110;
pub const VBI_DMA_PTR2: u32 = 0x30_00D0;
pub const VBI_DMA_CNT2: u32 = 0x30_0150;

bitflags! {
    /// PCI-level interrupt mask bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciInt: u32 {
        const VID_INT = 1 << 0;
    }
}

bitflags! {
    /// Video interrupt status/mask word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VidInt: u32 {
        const VBI_RISCI1 = 1 << 3;
        const VBI_RISCI2 = 1 << 7;
        const VBIF_OF    = 1 << 11;
        const VBI_SYNC   = 1 << 15;
        const OPC_ERR    = 1 << 16;
    }
}

impl VidInt {
    /// The set unmasked while capturing.
    pub const fn capture_mask() -> Self {
        Self::VBI_RISCI1
            .union(Self::VBI_RISCI2)
            .union(Self::VBIF_OF)
            .union(Self::VBI_SYNC)
            .union(Self::OPC_ERR)
    }
}

// --- Video decoder -----------------------------------------------------

/// Sticky status; bit 0 reports loss-of-sync / FIFO overflow.
pub const DEVICE_STATUS: u32 = 0x31_0100;
pub const DEVICE_STATUS_LOF: u32 = 1 << 0;

pub const INPUT_FORMAT: u32 = 0x31_0104;
pub const PLL: u32 = 0x31_0108;
pub const PLL_ADJUST: u32 = 0x31_010C;
pub const PLL_ADJUST_EN: u32 = 1 << 16;
pub const SAMPLE_RATE_CONV: u32 = 0x31_0110;
pub const OUTPUT_FORMAT: u32 = 0x31_0164;
pub const CONTR_BRIGHT: u32 = 0x31_0170;
pub const CAPTURE_CTRL: u32 = 0x31_0180;
pub const COLOR_FORMAT_CTRL: u32 = 0x31_0184;
pub const VBI_PACKET: u32 = 0x31_0188;

pub const AGC_CONTROL: u32 = 0x31_0200;
pub const AGC_SYNC_SLICER: u32 = 0x31_0204;
pub const AGC_SYNC_TIP_ADJUST_1: u32 = 0x31_0208;
pub const AGC_SYNC_TIP_ADJUST_2: u32 = 0x31_020C;
pub const AGC_SYNC_TIP_ADJUST_3: u32 = 0x31_0210;
pub const AGC_GAIN_ADJUST_1: u32 = 0x31_0214;
pub const AGC_GAIN_ADJUST_2: u32 = 0x31_0218;
pub const AGC_GAIN_ADJUST_3: u32 = 0x31_021C;
pub const AGC_GAIN_ADJUST_4: u32 = 0x31_0220;

/// Video IPB DMA control; bit 3 enables the VBI FIFO, bit 7 the VBI RISC
/// path.
pub const VID_DMA_CNTRL: u32 = 0x31_C000;
pub const VID_DMA_VBI_FIFO_EN: u32 = 1 << 3;
pub const VID_DMA_VBI_RISC_EN: u32 = 1 << 7;

/// GP page counter for the VBI channel.
pub const VBI_GP_CNT: u32 = 0x31_C02C;

// --- Misc / analog front end / I2C -------------------------------------

pub const AFE_CFG: u32 = 0x35_C04C;
pub const I2C_CONTROL: u32 = 0x36_8000;

// --- Typed register values ---------------------------------------------
//
// Field packing helpers for the registers the initialization sequence
// programs. Bit positions are listed next to each field.

/// OUTPUT_FORMAT: range bit 0, hsfmt bit 1, hactext bit 3.
pub const fn output_format(range: bool, hsfmt: bool, hactext: bool) -> u32 {
    (range as u32) | (hsfmt as u32) << 1 | (hactext as u32) << 3
}

/// CONTR_BRIGHT: brightness bits 7:0, contrast bits 15:8.
pub const fn contrast_brightness(contrast: u8, brightness: u8) -> u32 {
    (contrast as u32) << 8 | brightness as u32
}

/// VBI_PACKET: vertical delay bits 16:11, frame size bits 31:17.
pub const fn vbi_packet(v_delay: u32, frame_size: u32) -> u32 {
    frame_size << 17 | v_delay << 11
}

/// COLOR_FORMAT_CTRL: even format bits 3:0, odd format bits 7:4.
pub const fn color_format(even: u8, odd: u8) -> u32 {
    (odd as u32) << 4 | even as u32
}

/// AFE_CFG: background power-down bit 1, DAC power-down bit 4.
pub const fn afe_cfg(bg_pwrdn: bool, dac_pwrdn: bool) -> u32 {
    (bg_pwrdn as u32) << 1 | (dac_pwrdn as u32) << 4
}

/// PLL: fraction bits 19:0, integer bits 25:20, DDS bit 26.
pub const fn pll(int: u32, frac: u32, dds: u32) -> u32 {
    dds << 26 | int << 20 | frac
}

/// AGC_SYNC_SLICER: sync sample delay bits 7:0, backporch sample delay
/// bits 15:8, mm multiplier bits 18:16, slice enables bits 19-21.
pub const fn agc_sync_slicer(sync_sam_dly: u8, bp_sam_dly: u8) -> u32 {
    (bp_sam_dly as u32) << 8 | sync_sam_dly as u32
}

/// AGC_CONTROL: interval count bits 11:0, backporch reference bits 23:12,
/// backporch reference select bit 24, VBI AGC enable bit 25, VBI clamp
/// enable bit 26.
pub const fn agc_control(
    intrvl_cnt: u32,
    bp_ref: u32,
    bp_ref_sel: bool,
    agc_vbi_en: bool,
    clamp_vbi_en: bool,
) -> u32 {
    (clamp_vbi_en as u32) << 26
        | (agc_vbi_en as u32) << 25
        | (bp_ref_sel as u32) << 24
        | bp_ref << 12
        | intrvl_cnt
}

/// AGC_SYNC_TIP_ADJUST_1: tracking saturation bits 7:0, tracking mode
/// threshold bits 17:8.
pub const fn agc_sync_tip_1(trk_sat: u32, trk_mode_thr: u32) -> u32 {
    trk_mode_thr << 8 | trk_sat
}

/// AGC_SYNC_TIP_ADJUST_2: acquisition saturation bits 7:0, acquisition
/// gain bits 9:8, acquisition mode threshold bits 17:10.
pub const fn agc_sync_tip_2(acq_sat: u32, acq_gain: u32, acq_mode_thr: u32) -> u32 {
    acq_mode_thr << 10 | acq_gain << 8 | acq_sat
}

/// AGC_SYNC_TIP_ADJUST_3: accumulator max bits 7:0, accumulator min bits
/// 15:8, low sync-tip threshold bits 28:16. The accumulator max field is
/// where the center offset lands.
pub const fn agc_sync_tip_3(acc_max: u32, acc_min: u32, low_stip_th: u32) -> u32 {
    low_stip_th << 16 | acc_min << 8 | acc_max
}

/// AGC_GAIN_ADJUST_1: tracking AGC saturation bits 3:0, core threshold
/// bits 7:4, mode threshold bits 16:8.
pub const fn agc_gain_1(trk_agc_sat: u32, trk_agc_core_th: u32, trk_agc_mode_th: u32) -> u32 {
    trk_agc_mode_th << 8 | trk_agc_core_th << 4 | trk_agc_sat
}

/// AGC_GAIN_ADJUST_2: acquisition AGC saturation bits 3:0, acquisition
/// gain bits 5:4, acquisition mode threshold bits 16:8.
pub const fn agc_gain_2(acq_agc_sat: u32, acq_gain: u32, acq_agc_mode_th: u32) -> u32 {
    acq_agc_mode_th << 8 | acq_gain << 4 | acq_agc_sat
}

/// AGC_GAIN_ADJUST_3: accumulator increment bits 7:0, accumulator max
/// bits 15:8, accumulator min bits 23:16.
pub const fn agc_gain_3(acc_inc: u32, acc_max: u32, acc_min: u32) -> u32 {
    acc_min << 16 | acc_max << 8 | acc_inc
}

/// AGC_GAIN_ADJUST_4: high accumulator bits 7:0, low accumulator bits
/// 15:8, initial VGA value bits 20:16, initial 6 dB bit 21, VGA enable
/// bit 22, slice reference enable bit 23. The gain loop is frozen by
/// clearing both enables and pinning the accumulator window.
pub const fn agc_gain_4(
    high_acc: u32,
    low_acc: u32,
    init_vga: u32,
    init_6db: bool,
    vga_en: bool,
    slice_ref_en: bool,
) -> u32 {
    (slice_ref_en as u32) << 23
        | (vga_en as u32) << 22
        | (init_6db as u32) << 21
        | init_vga << 16
        | low_acc << 8
        | high_acc
}

/// INPUT_FORMAT: format bits 3:0, S-Video bit 4, S-Video chroma select
/// bit 5, AGC enable bit 13, Y ADC mux select bits 15:14.
pub const fn input_format(vmux: u32) -> u32 {
    vmux << 14 | 1 << 13 | 1 << 5 | 1 << 4 | 0x1
}

/// CAPTURE_CTRL: capture even bit 1, capture odd bit 2, 16-bit raw bit 5,
/// capture raw-all bit 6.
pub const fn capture_ctrl(tenbit: bool) -> u32 {
    1 << 6 | (tenbit as u32) << 5 | 1 << 2 | 1 << 1
}

/// I2C_CONTROL: SDA bit 0, SCL bit 1; both driven high puts the bus under
/// software control.
pub const fn i2c_lines(sda: bool, scl: bool) -> u32 {
    (scl as u32) << 1 | sda as u32
}

/// Command block for the VBI channel, written to SRAM in word order:
/// initial RISC address, CDT base, CDT size (qwords), RISC queue base,
/// RISC queue size (dwords).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdsBlock {
    pub initial_risc_addr: u32,
    pub cdt_base: u32,
    pub cdt_size: u32,
    pub risc_base: u32,
    pub risc_size: u32,
}

impl CmdsBlock {
    pub fn to_words(self) -> [u32; 5] {
        [
            self.initial_risc_addr,
            self.cdt_base,
            self.cdt_size,
            self.risc_base,
            self.risc_size,
        ]
    }
}
