//! Behavioural CX2388x simulation.
//!
//! [`SimChip`] implements [`RegisterBus`] over a private register file
//! with the semantics the engine depends on: write-one-to-clear interrupt
//! status, masked-status reads and the sticky overflow bit. On top of
//! that it *executes* the RISC program the engine synthesized: it walks
//! the instruction stream out of simulated bus memory, fills the DMA
//! pages with a deterministic byte pattern, advances the GP counter and
//! raises IRQ1, so the whole capture path can run without hardware.
//!
//! Tests drive it deterministically with [`SimChip::step_pages`];
//! [`SimRunner`] paces it in real time for server integration.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use super::dma::{DmaAllocator, DmaBuf, DmaGeometry, DmaRegion, DmaRing};
use super::interrupt::{self, IrqReceiver, IrqSender};
use super::mmio::RegisterBus;
use super::regs;
use crate::error::{CxError, Result};
use crate::reader::{CxDevice, DeviceInfo};
use crate::store::TuningStore;

/// Bus address space shared between the allocator and the chip model.
#[derive(Default)]
pub struct SimBusMemory {
    regions: Mutex<Vec<(u32, Arc<DmaRegion>)>>,
}

impl SimBusMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, bus_addr: u32, region: Arc<DmaRegion>) {
        self.regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((bus_addr, region));
    }

    /// Translates a bus range to a host pointer, or None when the device
    /// would fault.
    fn translate(&self, bus_addr: u32, len: usize) -> Option<*mut u8> {
        let regions = self.regions.lock().unwrap_or_else(|e| e.into_inner());
        for (base, region) in regions.iter() {
            let end = base + region.len() as u32;
            if bus_addr >= *base && bus_addr + len as u32 <= end {
                // SAFETY: offset is inside the region by the check above.
                return Some(unsafe { region.as_ptr().add((bus_addr - base) as usize) });
            }
        }
        None
    }

    fn read_u32(&self, bus_addr: u32) -> Option<u32> {
        let ptr = self.translate(bus_addr, 4)?;
        let mut word = [0u8; 4];
        // SAFETY: translate guarantees 4 readable bytes.
        unsafe { std::ptr::copy_nonoverlapping(ptr, word.as_mut_ptr(), 4) };
        Some(u32::from_le_bytes(word))
    }
}

/// Allocates pinned host memory and assigns sequential 32-bit bus
/// addresses, registering every region with the shared bus memory.
pub struct SimDmaAllocator {
    mem: Arc<SimBusMemory>,
    next: AtomicU32,
}

impl SimDmaAllocator {
    pub fn new(mem: Arc<SimBusMemory>) -> Self {
        Self {
            mem,
            next: AtomicU32::new(0x0100_0000),
        }
    }
}

impl DmaAllocator for SimDmaAllocator {
    fn alloc(&self, len: usize) -> Result<DmaBuf> {
        let region = DmaRegion::alloc(len, 4096)?;
        let aligned = (len as u32 + 0xFFF) & !0xFFF;
        let bus_addr = self.next.fetch_add(aligned, Ordering::SeqCst);
        if bus_addr.checked_add(aligned).is_none() {
            return Err(CxError::DmaAddressRange);
        }
        self.mem.register(bus_addr, Arc::clone(&region));
        Ok(DmaBuf { region, bus_addr })
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Sync { reset: bool },
    Write {
        target: u32,
        count: u32,
        cnt_inc: bool,
        cnt_reset: bool,
        irq1: bool,
    },
    Jump,
}

#[derive(Default)]
struct ExecState {
    program: Option<Vec<Op>>,
    pc: usize,
    sample: u8,
}

/// The chip model.
pub struct SimChip {
    registers: Mutex<Vec<u8>>,
    mem: Arc<SimBusMemory>,
    irq_tx: Mutex<IrqSender>,
    exec: Mutex<ExecState>,
}

impl SimChip {
    pub fn new(mem: Arc<SimBusMemory>) -> (Arc<Self>, IrqReceiver) {
        let (irq_tx, irq_rx) = interrupt::irq_channel();
        (
            Arc::new(Self {
                registers: Mutex::new(vec![0u8; regs::MMIO_LEN as usize]),
                mem,
                irq_tx: Mutex::new(irq_tx),
                exec: Mutex::new(ExecState::default()),
            }),
            irq_rx,
        )
    }

    fn with_regs<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.registers.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn load(file: &[u8], off: u32) -> u32 {
        let off = off as usize;
        let mut word = [0u8; 4];
        word.copy_from_slice(&file[off..off + 4]);
        u32::from_le_bytes(word)
    }

    fn store(file: &mut [u8], off: u32, val: u32) {
        let off = off as usize;
        file[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    /// Whether the RISC processor and the VBI FIFO/RISC paths are all
    /// enabled.
    pub fn running(&self) -> bool {
        self.with_regs(|file| {
            let cntrl2 = Self::load(file, regs::DEV_CNTRL2);
            let ipb = Self::load(file, regs::VID_DMA_CNTRL);
            cntrl2 & regs::DEV_CNTRL2_RUN_RISC != 0
                && ipb & regs::VID_DMA_VBI_FIFO_EN != 0
                && ipb & regs::VID_DMA_VBI_RISC_EN != 0
        })
    }

    /// Sets the sticky loss-of-sync / FIFO overflow bit.
    pub fn inject_overflow(&self) {
        self.with_regs(|file| {
            let status = Self::load(file, regs::DEVICE_STATUS) | regs::DEVICE_STATUS_LOF;
            Self::store(file, regs::DEVICE_STATUS, status);
        });
    }

    pub fn gp_cnt(&self) -> u32 {
        self.with_regs(|file| Self::load(file, regs::VBI_GP_CNT))
    }

    fn raise_irq1(&self) {
        let deliver = self.with_regs(|file| {
            let stat = Self::load(file, regs::VID_INT_STAT) | regs::VidInt::VBI_RISCI1.bits();
            Self::store(file, regs::VID_INT_STAT, stat);
            let msk = Self::load(file, regs::VID_INT_MSK);
            let pci_msk = Self::load(file, regs::PCI_INT_MSK);
            msk & regs::VidInt::VBI_RISCI1.bits() != 0 && pci_msk & regs::PciInt::VID_INT.bits() != 0
        });
        if deliver {
            let _ = self
                .irq_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .send(());
        }
    }

    fn decode_program(&self) -> Option<Vec<Op>> {
        let risc_addr = self.with_regs(|file| Self::load(file, regs::SRAM_CMDS_VBI_BASE));
        let mut ops = Vec::new();
        let mut at = risc_addr;
        // A runaway stream without a JUMP is a programming error; cap it.
        for _ in 0..4_000_000 {
            let instr = self.mem.read_u32(at)?;
            match instr >> 28 {
                0x8 => {
                    ops.push(Op::Sync {
                        reset: instr & super::risc::RISC_CNT_RESET == super::risc::RISC_CNT_RESET,
                    });
                    at += 4;
                }
                0x1 => {
                    let target = self.mem.read_u32(at + 4)?;
                    ops.push(Op::Write {
                        target,
                        count: instr & 0xFFFF,
                        cnt_inc: instr & super::risc::RISC_CNT_INC != 0,
                        cnt_reset: instr & super::risc::RISC_CNT_RESET
                            == super::risc::RISC_CNT_RESET,
                        irq1: instr & super::risc::RISC_IRQ1 != 0,
                    });
                    at += 8;
                }
                0x7 => {
                    ops.push(Op::Jump);
                    debug!(ops = ops.len(), "decoded risc program");
                    return Some(ops);
                }
                _ => return None,
            }
        }
        None
    }

    /// Executes the RISC program until `n` page completions have
    /// occurred. Returns the number of pages actually produced (0 when
    /// the capture paths are not enabled or no program is installed).
    pub fn step_pages(&self, n: u32) -> u32 {
        if !self.running() || n == 0 {
            return 0;
        }

        let mut exec = self.exec.lock().unwrap_or_else(|e| e.into_inner());
        if exec.program.is_none() {
            exec.program = self.decode_program();
            exec.pc = 0;
        }
        let Some(program) = exec.program.take() else {
            return 0;
        };

        let mut pages_done = 0u32;
        let mut pc = exec.pc;
        let mut sample = exec.sample;
        while pages_done < n {
            match program[pc] {
                Op::Sync { reset } => {
                    if reset {
                        self.with_regs(|file| Self::store(file, regs::VBI_GP_CNT, 0));
                    }
                    pc += 1;
                }
                Op::Write {
                    target,
                    count,
                    cnt_inc,
                    cnt_reset,
                    irq1,
                } => {
                    if let Some(ptr) = self.mem.translate(target, count as usize) {
                        // Continuous counting pattern across bursts, pages
                        // and ring wraps; readers can verify gapless
                        // delivery against it.
                        for i in 0..count as usize {
                            // SAFETY: translate() checked the range.
                            unsafe { ptr.add(i).write(sample) };
                            sample = sample.wrapping_add(1);
                        }
                    }
                    if cnt_reset {
                        self.with_regs(|file| Self::store(file, regs::VBI_GP_CNT, 0));
                        pages_done += 1;
                    } else if cnt_inc {
                        self.with_regs(|file| {
                            let gp = Self::load(file, regs::VBI_GP_CNT) + 1;
                            Self::store(file, regs::VBI_GP_CNT, gp);
                        });
                        pages_done += 1;
                    }
                    if irq1 {
                        self.raise_irq1();
                    }
                    pc += 1;
                }
                // The JUMP target skips the SYNC: back to the first WRITE.
                Op::Jump => pc = 1,
            }
        }

        exec.pc = pc;
        exec.sample = sample;
        exec.program = Some(program);
        pages_done
    }
}

impl RegisterBus for SimChip {
    fn read32(&self, off: u32) -> u32 {
        self.with_regs(|file| match off {
            regs::VID_INT_MSTAT => {
                Self::load(file, regs::VID_INT_STAT) & Self::load(file, regs::VID_INT_MSK)
            }
            _ => Self::load(file, off),
        })
    }

    fn write32(&self, off: u32, val: u32) {
        self.with_regs(|file| match off {
            // Write-one-to-clear.
            regs::VID_INT_STAT => {
                let stat = Self::load(file, regs::VID_INT_STAT) & !val;
                Self::store(file, regs::VID_INT_STAT, stat);
            }
            _ => Self::store(file, off, val),
        });

        // Disabling the RISC paths invalidates the cached program; the
        // next enable re-reads it from bus memory.
        if off == regs::DEV_CNTRL2 && val & regs::DEV_CNTRL2_RUN_RISC == 0 {
            let mut exec = self.exec.lock().unwrap_or_else(|e| e.into_inner());
            exec.program = None;
            exec.pc = 0;
        }
    }

    fn write_block(&self, off: u32, data: &[u8]) {
        self.with_regs(|file| {
            file[off as usize..off as usize + data.len()].copy_from_slice(data);
        });
    }

    fn window_len(&self) -> u32 {
        regs::MMIO_LEN
    }

    fn base_addr(&self) -> usize {
        self.with_regs(|file| file.as_ptr() as usize)
    }
}

/// Free-running pacer: produces `pages_per_tick` pages every `tick` while
/// the chip's capture paths are enabled.
pub struct SimRunner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimRunner {
    pub fn spawn(chip: Arc<SimChip>, pages_per_tick: u32, tick: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("cx-sim".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    if chip.running() {
                        chip.step_pages(pages_per_tick);
                    }
                    thread::sleep(tick);
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for SimRunner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Options for a fully wired in-process device.
pub struct SimDeviceOptions {
    pub geometry: DmaGeometry,
    pub index: u32,
    /// Where the tuning store lives; None keeps it in memory.
    pub state_dir: Option<PathBuf>,
    pub pages_per_tick: u32,
    pub tick: Duration,
    /// Spawn the free-running pacer. Tests that step manually leave this
    /// off.
    pub free_running: bool,
}

impl Default for SimDeviceOptions {
    fn default() -> Self {
        Self {
            geometry: DmaGeometry {
                page_size: 4096,
                ring_bytes: 256 * 4096,
                irq_period_in_pages: 8,
            },
            index: 0,
            state_dir: None,
            pages_per_tick: 8,
            tick: Duration::from_millis(1),
            free_running: true,
        }
    }
}

/// A complete in-process device: chip model, engine, interrupt dispatch
/// and (optionally) the pacer. Dropping it stops the pacer; the dispatch
/// thread winds down once the chip is released.
pub struct SimDevice {
    pub device: Arc<CxDevice>,
    pub chip: Arc<SimChip>,
    _runner: Option<SimRunner>,
    _dispatch: JoinHandle<()>,
}

/// Builds and wires a simulated device.
pub fn build_sim_device(opts: SimDeviceOptions) -> Result<SimDevice> {
    let mem = SimBusMemory::new();
    let allocator = SimDmaAllocator::new(Arc::clone(&mem));
    let ring = DmaRing::alloc(&allocator, opts.geometry)?;
    let (chip, irq_rx) = SimChip::new(mem);

    let name = format!("cxadc{}", opts.index);
    let store = match &opts.state_dir {
        Some(dir) => TuningStore::open(dir, &name)?,
        None => TuningStore::in_memory(),
    };

    let info = DeviceInfo {
        index: opts.index,
        vendor_id: regs::VENDOR_ID,
        device_id: regs::DEVICE_ID,
        bus_number: 3,
        device_address: 5 << 16,
        path: format!("/dev/{name}"),
    };

    let device = CxDevice::new(Arc::clone(&chip) as Arc<dyn RegisterBus>, ring, store, info)?;
    device.engine().enable_interrupt_line();

    let dispatch = interrupt::spawn_dispatch(Arc::clone(device.engine()), irq_rx)?;

    let runner = if opts.free_running {
        Some(SimRunner::spawn(
            Arc::clone(&chip),
            opts.pages_per_tick,
            opts.tick,
        )?)
    } else {
        None
    };

    Ok(SimDevice {
        device,
        chip,
        _runner: runner,
        _dispatch: dispatch,
    })
}
