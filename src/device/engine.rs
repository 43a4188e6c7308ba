//! The DMA ring engine.
//!
//! Owns the register window, the RISC program and the page ring, and
//! turns them into a running, self-refilling sample stream. The values
//! written during initialization lock the AGC level loop to a fixed gain
//! so the stream represents raw ADC samples with a known mapping.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use super::dma::{DmaGeometry, DmaRing};
use super::interrupt::DpcEvent;
use super::mmio::RegisterBus;
use super::regs;
use super::risc;

/// Analog front-end tuning parameters. Mutated only through the control
/// surface; reads are individual word-sized atomics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub vmux: u32,
    pub level: u32,
    pub tenbit: bool,
    pub sixdb: bool,
    pub center_offset: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vmux: super::VMUX_DEFAULT,
            level: super::LEVEL_DEFAULT,
            tenbit: super::TENBIT_DEFAULT,
            sixdb: super::SIXDB_DEFAULT,
            center_offset: super::CENTER_OFFSET_DEFAULT,
        }
    }
}

/// Snapshot of the engine's shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub last_gp_cnt: u32,
    pub initial_page: u32,
    pub ouflow_count: u32,
    pub reader_count: u32,
    pub is_capturing: bool,
}

impl DeviceState {
    /// Fixed wire layout: five little-endian words.
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (i, word) in [
            self.last_gp_cnt,
            self.initial_page,
            self.ouflow_count,
            self.reader_count,
            self.is_capturing as u32,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

struct ConfigCells {
    vmux: AtomicU32,
    level: AtomicU32,
    tenbit: AtomicU32,
    sixdb: AtomicU32,
    center_offset: AtomicU32,
}

struct StateCells {
    last_gp_cnt: AtomicU32,
    initial_page: AtomicU32,
    ouflow_count: AtomicU32,
    reader_count: AtomicU32,
    is_capturing: AtomicBool,
}

pub struct CxEngine {
    mmio: Arc<dyn RegisterBus>,
    ring: DmaRing,
    config: ConfigCells,
    state: StateCells,
    event: DpcEvent,
    unexpected_irq_logged: AtomicBool,
}

impl CxEngine {
    pub fn new(mmio: Arc<dyn RegisterBus>, ring: DmaRing, config: DeviceConfig) -> Self {
        Self {
            mmio,
            ring,
            config: ConfigCells {
                vmux: AtomicU32::new(config.vmux),
                level: AtomicU32::new(config.level),
                tenbit: AtomicU32::new(config.tenbit as u32),
                sixdb: AtomicU32::new(config.sixdb as u32),
                center_offset: AtomicU32::new(config.center_offset),
            },
            state: StateCells {
                last_gp_cnt: AtomicU32::new(0),
                initial_page: AtomicU32::new(0),
                ouflow_count: AtomicU32::new(0),
                reader_count: AtomicU32::new(0),
                is_capturing: AtomicBool::new(false),
            },
            event: DpcEvent::new(),
            unexpected_irq_logged: AtomicBool::new(false),
        }
    }

    #[inline]
    fn read(&self, off: u32) -> u32 {
        self.mmio.read32(off)
    }

    #[inline]
    fn write(&self, off: u32, val: u32) {
        self.mmio.write32(off, val)
    }

    pub fn geometry(&self) -> DmaGeometry {
        self.ring.geometry
    }

    pub fn bus(&self) -> &dyn RegisterBus {
        &*self.mmio
    }

    pub fn event(&self) -> &DpcEvent {
        &self.event
    }

    // --- Initialization -------------------------------------------------

    /// Full bring-up: SRAM tables, RISC program, front-end registers and
    /// the current tuning config. Runs on every entry to the powered
    /// state.
    pub fn init(&self) {
        self.init_cdt();
        self.init_risc();
        self.init_cmds();

        // Clear any pending interrupt status (write-one-to-clear).
        self.write(regs::VID_INT_STAT, self.read(regs::VID_INT_STAT));

        // Allow full range.
        self.write(regs::OUTPUT_FORMAT, regs::output_format(true, true, true));
        self.write(regs::CONTR_BRIGHT, regs::contrast_brightness(0xFF, 0));

        // Bytes moved from the peripheral to the FIFO per burst; the FIFO
        // transfers this much even when a smaller buffer remains. Must be
        // a multiple of 8.
        self.write(regs::VBI_PACKET, regs::vbi_packet(2, regs::CDT_BUF_LEN));

        // Raw passthrough on both fields.
        self.write(regs::COLOR_FORMAT_CTRL, regs::color_format(0xE, 0xE));

        // Power down the audio and chroma DAC+ADC paths.
        self.write(regs::AFE_CFG, regs::afe_cfg(true, true));

        // Sample-rate converter source at 8xfsc.
        self.write(regs::SAMPLE_RATE_CONV, 0x20000);

        // PLL 1:1.
        self.write(regs::PLL, regs::pll(0x10, 0, 1));

        // Back porch and sync sample delays at maximum.
        self.write(regs::AGC_SYNC_SLICER, regs::agc_sync_slicer(0xFF, 0xFF));
        self.write(
            regs::AGC_CONTROL,
            regs::agc_control(0xFFF, 0x100, true, false, false),
        );
        self.write(regs::AGC_SYNC_TIP_ADJUST_1, regs::agc_sync_tip_1(0x0F, 0x1C0));
        self.write(regs::AGC_SYNC_TIP_ADJUST_2, regs::agc_sync_tip_2(0xF, 0, 0x20));
        self.write(regs::AGC_GAIN_ADJUST_1, regs::agc_gain_1(7, 0xE, 0xE0));
        self.write(regs::AGC_GAIN_ADJUST_2, regs::agc_gain_2(0xF, 2, 0x20));
        self.write(regs::AGC_GAIN_ADJUST_3, regs::agc_gain_3(0x50, 0x28, 0x28));

        // Disable PLL auto-adjust; stabilizes output once the chip
        // detects a signal.
        let pll_adjust = self.read(regs::PLL_ADJUST) & !regs::PLL_ADJUST_EN;
        self.write(regs::PLL_ADJUST, pll_adjust);

        // SDA/SCL high, software control.
        self.write(regs::I2C_CONTROL, regs::i2c_lines(true, true));

        self.apply_vmux();
        self.apply_tenbit();
        self.apply_level();
        self.apply_center_offset();
    }

    /// Programs the cluster descriptor table and the VBI DMA channel
    /// registers describing it.
    fn init_cdt(&self) {
        info!(
            count = regs::CDT_BUF_COUNT,
            len = regs::CDT_BUF_LEN,
            "init cdt table"
        );

        let mut cdt_ptr = regs::SRAM_CDT_BASE;
        let mut buf_ptr = regs::SRAM_CDT_BUF_BASE;
        for _ in 0..regs::CDT_BUF_COUNT {
            let mut descriptor = [0u8; regs::CDT_DESCRIPTOR_LEN as usize];
            descriptor[..4].copy_from_slice(&buf_ptr.to_le_bytes());
            self.mmio.write_block(cdt_ptr, &descriptor);
            cdt_ptr += regs::CDT_DESCRIPTOR_LEN;
            buf_ptr += regs::CDT_BUF_LEN;
        }

        // Size of one buffer in qwords, minus one.
        self.write(regs::VBI_DMA_CNT1, regs::CDT_BUF_LEN / 8 - 1);
        self.write(regs::VBI_DMA_PTR2, regs::SRAM_CDT_BASE >> 2);
        self.write(regs::VBI_DMA_CNT2, regs::CDT_BUF_COUNT * 2);
    }

    fn init_risc(&self) {
        let words = risc::build_program(&self.ring);
        info!(
            bus_addr = format_args!("{:08X}", self.ring.instr.bus_addr),
            kbytes = words * 4 / 1024,
            "filled risc instruction stream"
        );
    }

    fn init_cmds(&self) {
        let cmds = regs::CmdsBlock {
            initial_risc_addr: self.ring.instr.bus_addr,
            cdt_base: regs::SRAM_CDT_BASE,
            cdt_size: regs::CDT_BUF_COUNT * 2,
            risc_base: regs::SRAM_RISC_QUEUE_BASE,
            risc_size: regs::RISC_QUEUE_SIZE,
        };
        let mut bytes = [0u8; 20];
        for (i, word) in cmds.to_words().into_iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        self.mmio.write_block(regs::SRAM_CMDS_VBI_BASE, &bytes);
    }

    /// Masks everything and halts the FIFO and RISC paths (power-down).
    pub fn disable(&self) {
        self.write(regs::VID_INT_MSK, 0);
        self.write(regs::VID_INT_STAT, 0xFFFF_FFFF);
        self.write(regs::VID_DMA_CNTRL, 0);
        self.write(regs::DEV_CNTRL2, 0);
    }

    /// Restores the AGC block to its power-on defaults; used when the
    /// device leaves the capture role for good.
    pub fn reset_front_end(&self) {
        self.write(
            regs::AGC_CONTROL,
            regs::agc_control(0x555, 0xE0, false, false, false),
        );
        self.write(
            regs::AGC_SYNC_SLICER,
            regs::agc_sync_slicer(0x1C, 0x60) | 4 << 16 | 1 << 19 | 1 << 20 | 1 << 21,
        );
        self.write(regs::AGC_SYNC_TIP_ADJUST_1, regs::agc_sync_tip_1(0xF, 0x1C0));
        self.write(regs::AGC_SYNC_TIP_ADJUST_2, regs::agc_sync_tip_2(0x3F, 1, 0x20));
        self.write(
            regs::AGC_SYNC_TIP_ADJUST_3,
            regs::agc_sync_tip_3(0x40, 0xE0, 0x1E48),
        );
        self.write(regs::AGC_GAIN_ADJUST_1, regs::agc_gain_1(7, 0xE, 0xE0));
        self.write(regs::AGC_GAIN_ADJUST_2, regs::agc_gain_2(0xF, 2, 0x20));
        self.write(regs::AGC_GAIN_ADJUST_3, regs::agc_gain_3(0xC0, 0x38, 0x28));
        self.write(
            regs::AGC_GAIN_ADJUST_4,
            regs::agc_gain_4(0x34, 0x2C, 0xA, false, true, true),
        );
    }

    // --- Start / stop ---------------------------------------------------

    pub fn start_capture(&self) {
        if self.is_capturing() {
            error!("already capturing");
            return;
        }

        info!("starting capture");

        self.write(regs::DEV_CNTRL2, regs::DEV_CNTRL2_RUN_RISC);
        self.write(
            regs::VID_DMA_CNTRL,
            regs::VID_DMA_VBI_FIFO_EN | regs::VID_DMA_VBI_RISC_EN,
        );
        self.write(regs::VID_INT_MSK, regs::VidInt::capture_mask().bits());

        self.state.is_capturing.store(true, Ordering::SeqCst);
    }

    pub fn stop_capture(&self) {
        info!("stopping capture");

        self.state.is_capturing.store(false, Ordering::SeqCst);

        self.write(regs::VID_INT_MSK, 0);
        self.write(regs::VID_INT_STAT, 0xFFFF_FFFF);
        self.write(regs::VID_DMA_CNTRL, 0);
        self.write(regs::DEV_CNTRL2, 0);
    }

    /// Unmasks the device interrupt at the PCI level (interrupt-enable
    /// callback of the enumeration plumbing).
    pub fn enable_interrupt_line(&self) {
        info!("enabling interrupts");
        self.write(regs::PCI_INT_MSK, regs::PciInt::VID_INT.bits());
    }

    pub fn disable_interrupt_line(&self) {
        info!("disabling interrupts");
        self.write(regs::PCI_INT_MSK, 0);
    }

    // --- ISR / DPC ------------------------------------------------------

    /// Interrupt service routine. Returns whether the interrupt was
    /// claimed; an unclaimed interrupt must be passed on so other devices
    /// sharing the line can see it.
    pub fn isr(&self) -> bool {
        let mstat = self.read(regs::VID_INT_MSTAT);

        let recognized = mstat & regs::VidInt::VBI_RISCI1.bits() != 0;

        if !recognized && mstat != 0 {
            // Unexpected interrupt source; report the first occurrence.
            if !self.unexpected_irq_logged.swap(true, Ordering::Relaxed) {
                error!(
                    stat = format_args!("{:#010x}", self.read(regs::VID_INT_STAT)),
                    masked = format_args!("{:#010x}", mstat),
                    "unrecognized interrupt status"
                );
            }
        }

        // Write-one-to-clear everything observed.
        self.write(regs::VID_INT_STAT, mstat);

        recognized
    }

    /// Deferred procedure call, run after each claimed interrupt.
    ///
    /// The GP counter is not guaranteed to be in sync with resident
    /// pages: it can advance before the page reaches main memory. A page
    /// that raised an interrupt is guaranteed resident, so the counter is
    /// rounded down to the last interrupt boundary before publication.
    pub fn dpc(&self) {
        let gp = self.read(regs::VBI_GP_CNT) & !(self.ring.geometry.irq_period_in_pages - 1);
        self.state.last_gp_cnt.store(gp, Ordering::Release);
        self.event.set();
    }

    // --- Shared state ---------------------------------------------------

    pub fn is_capturing(&self) -> bool {
        self.state.is_capturing.load(Ordering::SeqCst)
    }

    pub fn last_gp_cnt(&self) -> u32 {
        self.state.last_gp_cnt.load(Ordering::Acquire)
    }

    /// Latches the capture start page from the last published cursor.
    pub fn latch_initial_page(&self) {
        self.state
            .initial_page
            .store(self.last_gp_cnt(), Ordering::SeqCst);
    }

    pub fn initial_page(&self) -> u32 {
        self.state.initial_page.load(Ordering::SeqCst)
    }

    pub fn reader_count(&self) -> u32 {
        self.state.reader_count.load(Ordering::SeqCst)
    }

    pub fn inc_reader_count(&self) -> u32 {
        self.state.reader_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn dec_reader_count(&self) -> u32 {
        self.state.reader_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn ouflow_count(&self) -> u32 {
        self.state.ouflow_count.load(Ordering::SeqCst)
    }

    pub fn inc_ouflow_count(&self) {
        self.state.ouflow_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Zeroes the over/underflow counter, returning the previous value.
    pub fn reset_ouflow_count(&self) -> u32 {
        let prev = self.state.ouflow_count.swap(0, Ordering::SeqCst);
        info!(previous = prev, "resetting over/underflow count");
        prev
    }

    /// Sticky loss-of-sync / FIFO overflow bit.
    pub fn ouflow_state(&self) -> bool {
        self.read(regs::DEVICE_STATUS) & regs::DEVICE_STATUS_LOF != 0
    }

    pub fn reset_ouflow_state(&self) {
        let status = self.read(regs::DEVICE_STATUS) & !regs::DEVICE_STATUS_LOF;
        self.write(regs::DEVICE_STATUS, status);
    }

    pub fn config_snapshot(&self) -> DeviceConfig {
        DeviceConfig {
            vmux: self.config.vmux.load(Ordering::Relaxed),
            level: self.config.level.load(Ordering::Relaxed),
            tenbit: self.config.tenbit.load(Ordering::Relaxed) != 0,
            sixdb: self.config.sixdb.load(Ordering::Relaxed) != 0,
            center_offset: self.config.center_offset.load(Ordering::Relaxed),
        }
    }

    pub fn state_snapshot(&self) -> DeviceState {
        DeviceState {
            last_gp_cnt: self.last_gp_cnt(),
            initial_page: self.initial_page(),
            ouflow_count: self.ouflow_count(),
            reader_count: self.reader_count(),
            is_capturing: self.is_capturing(),
        }
    }

    // --- Tuning ---------------------------------------------------------
    //
    // Each setter writes the hardware register first, then the in-memory
    // cell; a value the hardware rejects must fail before any state
    // changes.

    pub fn set_vmux(&self, vmux: u32) {
        info!(vmux, "setting vmux");
        self.write(regs::INPUT_FORMAT, regs::input_format(vmux));
        self.config.vmux.store(vmux, Ordering::Relaxed);
    }

    pub fn set_level(&self, level: u32) {
        info!(level, "setting level");
        let sixdb = self.config.sixdb.load(Ordering::Relaxed) != 0;
        self.write_level(level, sixdb);
        self.config.level.store(level, Ordering::Relaxed);
    }

    pub fn set_sixdb(&self, sixdb: bool) {
        info!(sixdb, "setting sixdb");
        let level = self.config.level.load(Ordering::Relaxed);
        self.write_level(level, sixdb);
        self.config.sixdb.store(sixdb as u32, Ordering::Relaxed);
    }

    pub fn set_tenbit(&self, tenbit: bool) {
        info!(tenbit, "setting tenbit");
        self.write(regs::CAPTURE_CTRL, regs::capture_ctrl(tenbit));
        self.config.tenbit.store(tenbit as u32, Ordering::Relaxed);
    }

    pub fn set_center_offset(&self, center_offset: u32) {
        info!(center_offset, "setting center_offset");
        self.write(
            regs::AGC_SYNC_TIP_ADJUST_3,
            regs::agc_sync_tip_3(center_offset, 0xFF, 0x1E48),
        );
        self.config.center_offset.store(center_offset, Ordering::Relaxed);
    }

    fn write_level(&self, level: u32, sixdb: bool) {
        // Gain, not offset: the accumulator window is pinned and both
        // loop enables stay clear.
        self.write(
            regs::AGC_GAIN_ADJUST_4,
            regs::agc_gain_4(0x00, 0xFF, level, sixdb, false, false),
        );
    }

    fn apply_vmux(&self) {
        self.set_vmux(self.config.vmux.load(Ordering::Relaxed));
    }

    fn apply_level(&self) {
        self.set_level(self.config.level.load(Ordering::Relaxed));
    }

    fn apply_tenbit(&self) {
        self.set_tenbit(self.config.tenbit.load(Ordering::Relaxed) != 0);
    }

    fn apply_center_offset(&self) {
        self.set_center_offset(self.config.center_offset.load(Ordering::Relaxed));
    }

    // --- Data access ----------------------------------------------------

    /// Copies out of a resident DMA page.
    pub fn copy_page(&self, page_no: u32, page_off: usize, dst: &mut [u8]) {
        self.ring.copy_from_page(page_no, page_off, dst);
    }

    /// Logs a warning if capture stops with readers outstanding; state
    /// consistency check used by the device teardown path.
    pub fn warn_if_busy(&self) {
        let readers = self.reader_count();
        if readers != 0 {
            warn!(readers, "device torn down with readers outstanding");
        }
    }
}
