//! Server settings.
//!
//! Loaded from an optional TOML document merged with `CXCAPTURE_`
//! environment variables (double underscore separates sections, e.g.
//! `CXCAPTURE_CAPTURE__CHUNK_SIZE`). Every field has a default so the
//! server runs with no file present.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CxError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub audio: AudioSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Logging level: trace, debug, info, warn or error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Bytes requested from a source per producer iteration.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Ring size per cxadc source.
    #[serde(default = "default_cxadc_ring_bytes")]
    pub cxadc_ring_bytes: usize,

    /// Audio ring size in frames; the byte size scales with the
    /// negotiated sample size.
    #[serde(default = "default_audio_ring_frames")]
    pub audio_ring_frames: usize,

    /// Device node prefix; source N opens `<prefix><N>`.
    #[serde(default = "default_device_prefix")]
    pub device_prefix: String,

    /// `file` opens device nodes; `sim` runs in-process simulated
    /// devices (bring-up and tests).
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Where per-device tuning documents live.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Simulated-device geometry and pacing.
    #[serde(default = "default_sim_ring_bytes")]
    pub sim_ring_bytes: usize,
    #[serde(default = "default_sim_irq_period")]
    pub sim_irq_period: u32,
    #[serde(default = "default_sim_throughput_mb_s")]
    pub sim_throughput_mb_s: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            cxadc_ring_bytes: default_cxadc_ring_bytes(),
            audio_ring_frames: default_audio_ring_frames(),
            device_prefix: default_device_prefix(),
            backend: default_backend(),
            state_dir: default_state_dir(),
            sim_ring_bytes: default_sim_ring_bytes(),
            sim_irq_period: default_sim_irq_period(),
            sim_throughput_mb_s: default_sim_throughput_mb_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Capture device name; overridable per session with `lname=`.
    #[serde(default = "default_audio_device")]
    pub device: String,

    /// 0 lets the device pick.
    #[serde(default)]
    pub rate: u32,

    /// 0 lets the device pick.
    #[serde(default)]
    pub channels: u32,

    /// Empty lets the device pick.
    #[serde(default)]
    pub format: String,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            device: default_audio_device(),
            rate: 0,
            channels: 0,
            format: String::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_audio_device() -> String {
    "hw:CARD=CXADCADCClockGe".into()
}

fn default_chunk_size() -> usize {
    65536 * 32
}

fn default_cxadc_ring_bytes() -> usize {
    1 << 30
}

fn default_audio_ring_frames() -> usize {
    2 << 20
}

fn default_device_prefix() -> String {
    "/dev/cxadc".into()
}

fn default_backend() -> String {
    "file".into()
}

fn default_state_dir() -> PathBuf {
    "/var/lib/cxcapture".into()
}

fn default_sim_ring_bytes() -> usize {
    1 << 22
}

fn default_sim_irq_period() -> u32 {
    16
}

fn default_sim_throughput_mb_s() -> u32 {
    28
}

impl Settings {
    /// Loads `path` (default `cxcapture.toml`) merged with the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("cxcapture.toml"));
        let settings: Settings = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CXCAPTURE_").split("__"))
            .extract()
            .map_err(|e| CxError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.server.log_level.as_str()) {
            return Err(CxError::Config(format!(
                "invalid log_level '{}'",
                self.server.log_level
            )));
        }

        match self.capture.backend.as_str() {
            "file" | "sim" => {}
            other => {
                return Err(CxError::Config(format!("invalid capture backend '{other}'")));
            }
        }

        if self.capture.chunk_size == 0 {
            return Err(CxError::Config("chunk_size must be non-zero".into()));
        }
        if self.capture.cxadc_ring_bytes < self.capture.chunk_size {
            return Err(CxError::Config(
                "cxadc_ring_bytes must hold at least one chunk".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.capture.chunk_size, 65536 * 32);
        assert_eq!(settings.capture.cxadc_ring_bytes, 1 << 30);
        assert_eq!(settings.capture.backend, "file");
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cxcapture.toml");
        std::fs::write(
            &path,
            "[capture]\nchunk_size = 4096\ncxadc_ring_bytes = 65536\nbackend = \"sim\"\n",
        )
        .unwrap();

        let settings = Settings::load(Some(path.as_path())).unwrap();
        assert_eq!(settings.capture.chunk_size, 4096);
        assert_eq!(settings.capture.cxadc_ring_bytes, 65536);
        assert_eq!(settings.capture.backend, "sim");
        // Untouched sections keep their defaults.
        assert_eq!(settings.server.log_level, "info");
    }

    #[test]
    fn bad_backend_is_rejected() {
        let mut settings = Settings::default();
        settings.capture.backend = "cloud".into();
        assert!(settings.validate().is_err());
    }
}
