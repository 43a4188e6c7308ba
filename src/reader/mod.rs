//! The reader pipeline: a streamable view of the DMA ring.
//!
//! [`CxDevice`] couples an engine with the persistent tuning store and
//! the device identity, and hands out [`ReaderHandle`]s. A handle reads
//! the concatenated, wraparound-free byte stream of the ring relative to
//! its own cursor; the request carries no offset. The first read starts
//! capture and latches the page the hardware was on; closing the last
//! handle stops it.

pub mod control;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info};

use crate::device::dma::{DmaGeometry, DmaRing};
use crate::device::engine::{CxEngine, DeviceConfig, DeviceState};
use crate::device::mmio::RegisterBus;
use crate::device::{self, regs};
use crate::error::{CxError, Result};
use crate::store::TuningStore;

/// Bound on a blocking read's wait for the next DPC. Expiry ends the
/// read with a short count; the handle stays usable.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Identity supplied by the enumeration plumbing.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: u32,
    pub vendor_id: u16,
    pub device_id: u16,
    pub bus_number: u32,
    /// Slot in the high 16 bits, function in the low 16.
    pub device_address: u32,
    /// The device node consumers open.
    pub path: String,
}

/// Translates a handle cursor into the DMA page holding that byte.
///
/// A cursor may legally exceed the ring size; a consumer that falls more
/// than one ring behind the producer loses data, as nothing
/// write-protects the pages.
pub fn page_of(initial_page: u32, offset: u64, geometry: &DmaGeometry) -> u32 {
    let page = (offset % geometry.ring_bytes as u64) / geometry.page_size as u64;
    (page as u32 + initial_page) % geometry.page_count()
}

pub struct CxDevice {
    engine: Arc<CxEngine>,
    store: Mutex<TuningStore>,
    info: DeviceInfo,
}

impl CxDevice {
    /// Brings the device up: identity check, tuning load, engine init.
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        ring: DmaRing,
        store: TuningStore,
        info: DeviceInfo,
    ) -> Result<Arc<Self>> {
        device::check_device_id(info.vendor_id, info.device_id)?;

        let config = DeviceConfig {
            vmux: store.get("vmux").unwrap_or(device::VMUX_DEFAULT),
            level: store.get("level").unwrap_or(device::LEVEL_DEFAULT),
            tenbit: store
                .get("tenbit")
                .map_or(device::TENBIT_DEFAULT, |v| v != 0),
            sixdb: store.get("sixdb").map_or(device::SIXDB_DEFAULT, |v| v != 0),
            center_offset: store
                .get("center_offset")
                .unwrap_or(device::CENTER_OFFSET_DEFAULT),
        };

        info!(
            index = info.index,
            bus = info.bus_number,
            slot = info.device_address >> 16,
            function = info.device_address & 0xFFFF,
            "adding device"
        );

        let engine = Arc::new(CxEngine::new(bus, ring, config));
        engine.init();

        Ok(Arc::new(Self {
            engine,
            store: Mutex::new(store),
            info,
        }))
    }

    pub fn engine(&self) -> &Arc<CxEngine> {
        &self.engine
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Opens a reader handle with a fresh cursor.
    pub fn open(self: &Arc<Self>) -> ReaderHandle {
        ReaderHandle {
            dev: Arc::clone(self),
            cursor: 0,
            counted: false,
            non_blocking: false,
            mapped: None,
        }
    }

    // --- Observation ----------------------------------------------------

    pub fn config(&self) -> DeviceConfig {
        self.engine.config_snapshot()
    }

    pub fn state(&self) -> DeviceState {
        self.engine.state_snapshot()
    }

    pub fn is_capturing(&self) -> bool {
        self.engine.is_capturing()
    }

    pub fn ouflow_count(&self) -> u32 {
        self.engine.ouflow_count()
    }

    pub fn reset_ouflow_count(&self) -> u32 {
        self.engine.reset_ouflow_count()
    }

    // --- Tuning setters -------------------------------------------------
    //
    // Three-step transaction: hardware register, then the in-memory
    // config, then the store. A range violation fails before any step.

    pub fn set_vmux(&self, value: u32) -> Result<()> {
        if value > device::VMUX_MAX {
            error!(value, "invalid vmux");
            return Err(CxError::InvalidParameter("vmux"));
        }
        self.engine.set_vmux(value);
        self.persist("vmux", value)
    }

    pub fn set_level(&self, value: u32) -> Result<()> {
        if value > device::LEVEL_MAX {
            error!(value, "invalid level");
            return Err(CxError::InvalidParameter("level"));
        }
        self.engine.set_level(value);
        self.persist("level", value)
    }

    pub fn set_tenbit(&self, value: u32) -> Result<()> {
        if value > 1 {
            error!(value, "invalid tenbit");
            return Err(CxError::InvalidParameter("tenbit"));
        }
        self.engine.set_tenbit(value != 0);
        self.persist("tenbit", value)
    }

    pub fn set_sixdb(&self, value: u32) -> Result<()> {
        if value > 1 {
            error!(value, "invalid sixdb");
            return Err(CxError::InvalidParameter("sixdb"));
        }
        self.engine.set_sixdb(value != 0);
        self.persist("sixdb", value)
    }

    pub fn set_center_offset(&self, value: u32) -> Result<()> {
        if value > device::CENTER_OFFSET_MAX {
            error!(value, "invalid center_offset");
            return Err(CxError::InvalidParameter("center_offset"));
        }
        self.engine.set_center_offset(value);
        self.persist("center_offset", value)
    }

    fn persist(&self, key: &str, value: u32) -> Result<()> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set(key, value)
    }

    /// Reads a stored tuning key (diagnostics and tests).
    pub fn stored(&self, key: &str) -> Option<u32> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
    }

    // --- Raw register access --------------------------------------------

    fn check_register_addr(&self, addr: u32) -> Result<()> {
        if addr < regs::REGISTER_BASE
            || addr > regs::REGISTER_END
            || addr & 3 != 0
            || addr + 4 > self.engine.bus().window_len()
        {
            error!(addr = format_args!("{addr:#010x}"), "address out of range");
            return Err(CxError::RegisterOutOfRange(addr));
        }
        Ok(())
    }

    pub fn register_get(&self, addr: u32) -> Result<u32> {
        self.check_register_addr(addr)?;
        Ok(self.engine.bus().read32(addr))
    }

    pub fn register_set(&self, addr: u32, value: u32) -> Result<()> {
        self.check_register_addr(addr)?;
        info!(
            addr = format_args!("{addr:#010x}"),
            value = format_args!("{value:#010x}"),
            "writing register"
        );
        self.engine.bus().write32(addr, value);
        Ok(())
    }
}

impl Drop for CxDevice {
    fn drop(&mut self) {
        // Should already be stopped by the last handle's close.
        self.engine.warn_if_busy();
        self.engine.stop_capture();
        self.engine.disable();
        self.engine.reset_front_end();
    }
}

/// One open of the device. Exclusively owned by the opening client; the
/// cursor is the only read position there is.
pub struct ReaderHandle {
    dev: Arc<CxDevice>,
    cursor: u64,
    counted: bool,
    non_blocking: bool,
    mapped: Option<usize>,
}

impl ReaderHandle {
    pub fn device(&self) -> &Arc<CxDevice> {
        &self.dev
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Non-blocking handles make a single copy pass and return whatever
    /// was resident instead of waiting for the next DPC.
    pub fn set_non_blocking(&mut self, non_blocking: bool) {
        self.non_blocking = non_blocking;
    }

    /// Installs the user view of the raw MMIO window. Configuration
    /// only, never sample data.
    pub fn mmap(&mut self) -> usize {
        let addr = *self
            .mapped
            .get_or_insert_with(|| self.dev.engine.bus().base_addr());
        info!(addr = format_args!("{addr:#x}"), "mmap");
        addr
    }

    pub fn munmap(&mut self) {
        if let Some(addr) = self.mapped.take() {
            info!(addr = format_args!("{addr:#x}"), "munmap");
        }
    }

    /// Reads from the stream at the handle cursor.
    ///
    /// Blocks on the DPC event while the producer is behind, bounded by
    /// [`READ_TIMEOUT`]; a timeout or a capture stop ends the read early
    /// with a short count.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let engine = &self.dev.engine;
        let geometry = engine.geometry();

        // First reader in this capture session: start the hardware and
        // latch the page it reports once the first interrupt lands.
        if !engine.is_capturing() {
            engine.event().clear();
            engine.start_capture();
            engine.event().wait_timeout(READ_TIMEOUT);
            engine.latch_initial_page();
        }

        if !self.counted {
            engine.inc_reader_count();
            self.counted = true;
        }

        let page_size = geometry.page_size;
        let initial_page = engine.initial_page();

        let mut remaining = buf.len();
        let mut offset = self.cursor;
        let mut target = 0usize;
        let mut page_no = page_of(initial_page, offset, &geometry);

        while remaining > 0 && engine.is_capturing() {
            while remaining > 0 && page_no != engine.last_gp_cnt() {
                let page_off = (offset % page_size as u64) as usize;
                let chunk = remaining.min(page_size - page_off);

                engine.copy_page(page_no, page_off, &mut buf[target..target + chunk]);

                remaining -= chunk;
                target += chunk;
                offset += chunk as u64;
                page_no = page_of(initial_page, offset, &geometry);
            }

            // The overflow bit is sticky and silent; poll it between
            // copy passes.
            if engine.ouflow_state() {
                engine.inc_ouflow_count();
                engine.reset_ouflow_state();
            }

            if remaining > 0 {
                if self.non_blocking {
                    break;
                }
                // Caught up with the producer; wait for the next batch.
                engine.event().clear();
                if !engine.event().wait_timeout(READ_TIMEOUT) {
                    break;
                }
            }
        }

        self.cursor = offset;
        buf.len() - remaining
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.munmap();
        if self.counted && self.dev.engine.dec_reader_count() == 0 {
            self.dev.engine.stop_capture();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dma::DmaGeometry;

    fn geometry() -> DmaGeometry {
        DmaGeometry {
            page_size: 4096,
            ring_bytes: 64 * 4096,
            irq_period_in_pages: 4,
        }
    }

    #[test]
    fn page_translation_wraps_modulo_the_ring() {
        let g = geometry();
        assert_eq!(page_of(0, 0, &g), 0);
        assert_eq!(page_of(0, 4095, &g), 0);
        assert_eq!(page_of(0, 4096, &g), 1);
        // One full ring later, the same page again.
        assert_eq!(page_of(0, g.ring_bytes as u64, &g), 0);
        assert_eq!(page_of(0, g.ring_bytes as u64 + 4096, &g), 1);
    }

    #[test]
    fn page_translation_honors_the_initial_page() {
        let g = geometry();
        assert_eq!(page_of(10, 0, &g), 10);
        assert_eq!(page_of(62, 2 * 4096, &g), 0);
        // Cursors beyond one ring keep the same mapping.
        assert_eq!(
            page_of(10, 5 * g.ring_bytes as u64 + 3 * 4096, &g),
            13
        );
    }
}
