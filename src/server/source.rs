//! Sample sources the producer threads drain.
//!
//! The server does not care where sample bytes come from: a character
//! device node on a machine with real hardware, or an in-process
//! simulated device. [`SourceFactory`] hides the difference behind the
//! session's `cxadc<N>` names.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Mutex;
use std::time::Duration;

use tracing::info;

use crate::config::CaptureSettings;
use crate::device::dma::DmaGeometry;
use crate::device::sim::{build_sim_device, SimDevice, SimDeviceOptions};
use crate::error::Result;
use crate::reader::ReaderHandle;

/// A byte stream of raw samples. `Ok(0)` means nothing available right
/// now; errors are fatal for the producer.
pub trait SampleSource: Send {
    fn read_samples(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens the source backing session slot `cxadc<index>`.
pub trait SourceFactory: Send + Sync {
    fn open(&self, index: u32) -> Result<Box<dyn SampleSource>>;
}

// --- Device-node sources -----------------------------------------------

pub struct FileSource {
    file: File,
}

impl FileSource {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        info!(path, "opened capture source");
        Ok(Self { file })
    }
}

impl SampleSource for FileSource {
    fn read_samples(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.read(buf) {
            // Nothing resident yet; the producer loop sleeps and retries.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }
}

pub struct FileSourceFactory {
    prefix: String,
}

impl FileSourceFactory {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl SourceFactory for FileSourceFactory {
    fn open(&self, index: u32) -> Result<Box<dyn SampleSource>> {
        let path = format!("{}{}", self.prefix, index);
        Ok(Box::new(FileSource::open(&path)?))
    }
}

// --- In-process simulated devices --------------------------------------

/// A reader handle as a sample source.
pub struct DeviceSource {
    handle: ReaderHandle,
}

impl DeviceSource {
    pub fn new(handle: ReaderHandle) -> Self {
        Self { handle }
    }
}

impl SampleSource for DeviceSource {
    fn read_samples(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.handle.read(buf))
    }
}

/// Lazily builds one simulated device per index and hands out reader
/// handles on it. Devices persist across sessions, like hardware does.
pub struct SimSourceFactory {
    options: SimTemplate,
    devices: Mutex<HashMap<u32, SimDevice>>,
}

struct SimTemplate {
    geometry: DmaGeometry,
    pages_per_tick: u32,
    state_dir: Option<std::path::PathBuf>,
}

impl SimSourceFactory {
    pub fn from_settings(capture: &CaptureSettings) -> Self {
        let geometry = DmaGeometry {
            page_size: 4096,
            ring_bytes: capture.sim_ring_bytes,
            irq_period_in_pages: capture.sim_irq_period,
        };
        // Pace the model at roughly the configured throughput with a
        // 1 ms tick.
        let pages_per_tick =
            ((capture.sim_throughput_mb_s as u64 * (1 << 20)) / 1000 / 4096).max(1) as u32;
        Self {
            options: SimTemplate {
                geometry,
                pages_per_tick,
                state_dir: Some(capture.state_dir.clone()),
            },
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Small, fast geometry with in-memory tuning state (tests).
    pub fn ephemeral(geometry: DmaGeometry, pages_per_tick: u32) -> Self {
        Self {
            options: SimTemplate {
                geometry,
                pages_per_tick,
                state_dir: None,
            },
            devices: Mutex::new(HashMap::new()),
        }
    }
}

impl SourceFactory for SimSourceFactory {
    fn open(&self, index: u32) -> Result<Box<dyn SampleSource>> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        if !devices.contains_key(&index) {
            let sim = build_sim_device(SimDeviceOptions {
                geometry: self.options.geometry,
                index,
                state_dir: self.options.state_dir.clone(),
                pages_per_tick: self.options.pages_per_tick,
                tick: Duration::from_millis(1),
                free_running: true,
            })?;
            devices.insert(index, sim);
        }
        let sim = &devices[&index];
        Ok(Box::new(DeviceSource::new(sim.device.open())))
    }
}
