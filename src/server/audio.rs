//! The linear (audio) source interface.
//!
//! Capture needs exactly this much from an audio backend: negotiate a
//! device, report frame geometry, then deliver framed PCM bytes. The
//! ALSA backend talks to the clock-generator's capture interface; the
//! tone backend is an always-available deterministic stand-in for
//! bring-up and tests.

use std::time::{Duration, Instant};

use crate::error::{CxError, Result};

/// Session parameters from `/start`; zero/empty fields let the device
/// pick.
#[derive(Debug, Clone, Default)]
pub struct AudioRequest {
    pub rate: u32,
    pub channels: u32,
    pub format: String,
}

/// A negotiated, ready-to-start capture stream.
pub trait AudioInput: Send {
    fn start(&mut self) -> Result<()>;

    /// Frames ready for capture; may briefly sleep when none are.
    fn avail_frames(&mut self) -> Result<usize>;

    /// Fills `buf` (a whole number of frames) and returns the bytes
    /// delivered; 0 means try again.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn stop(&mut self);

    fn rate(&self) -> u32;
    fn channels(&self) -> u32;
    fn format_name(&self) -> String;

    /// Bytes per frame across all channels.
    fn sample_size(&self) -> usize;
}

/// Opens capture streams by device name.
pub trait AudioBackend: Send + Sync {
    fn open(&self, name: &str, request: &AudioRequest) -> Result<Box<dyn AudioInput>>;
}

// --- Deterministic tone source -----------------------------------------

/// Produces an S16_LE counting ramp at wall-clock rate.
pub struct ToneBackend;

impl AudioBackend for ToneBackend {
    fn open(&self, _name: &str, request: &AudioRequest) -> Result<Box<dyn AudioInput>> {
        if !request.format.is_empty() && request.format != "S16_LE" {
            return Err(CxError::Audio(format!(
                "tone source only produces S16_LE, not {}",
                request.format
            )));
        }
        let rate = if request.rate == 0 { 48000 } else { request.rate };
        let channels = if request.channels == 0 { 2 } else { request.channels };
        Ok(Box::new(ToneInput {
            rate,
            channels,
            phase: 0,
            clock: Instant::now(),
        }))
    }
}

struct ToneInput {
    rate: u32,
    channels: u32,
    phase: i16,
    clock: Instant,
}

impl AudioInput for ToneInput {
    fn start(&mut self) -> Result<()> {
        self.clock = Instant::now();
        Ok(())
    }

    fn avail_frames(&mut self) -> Result<usize> {
        let elapsed = self.clock.elapsed();
        let frames = (elapsed.as_micros() as u64 * self.rate as u64 / 1_000_000) as usize;
        if frames == 0 {
            std::thread::sleep(Duration::from_micros(200));
            return Ok(0);
        }
        // Cap a stalled consumer's backlog at a quarter second.
        Ok(frames.min(self.rate as usize / 4))
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let frame_bytes = self.sample_size();
        let frames = buf.len() / frame_bytes;
        let mut at = 0;
        for _ in 0..frames {
            let sample = self.phase.to_le_bytes();
            for _ in 0..self.channels {
                buf[at..at + 2].copy_from_slice(&sample);
                at += 2;
            }
            self.phase = self.phase.wrapping_add(1);
        }
        self.clock += Duration::from_nanos(frames as u64 * 1_000_000_000 / self.rate as u64);
        Ok(frames * frame_bytes)
    }

    fn stop(&mut self) {}

    fn rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> u32 {
        self.channels
    }

    fn format_name(&self) -> String {
        "S16_LE".into()
    }

    fn sample_size(&self) -> usize {
        2 * self.channels as usize
    }
}

// --- ALSA capture ------------------------------------------------------

#[cfg(feature = "audio-alsa")]
pub use self::alsa_backend::AlsaBackend;

#[cfg(feature = "audio-alsa")]
mod alsa_backend {
    use super::{AudioBackend, AudioInput, AudioRequest};
    use crate::error::{CxError, Result};
    use alsa::pcm::{Access, Format, HwParams, PCM};
    use alsa::{Direction, ValueOr};
    use std::ffi::CString;

    fn format_by_name(name: &str) -> Option<Format> {
        Some(match name {
            "U8" => Format::U8,
            "S16_LE" => Format::S16LE,
            "S24_3LE" => Format::S243LE,
            "S24_LE" => Format::S24LE,
            "S32_LE" => Format::S32LE,
            "FLOAT_LE" => Format::FloatLE,
            _ => return None,
        })
    }

    fn format_name(format: Format) -> String {
        match format {
            Format::U8 => "U8".into(),
            Format::S16LE => "S16_LE".into(),
            Format::S243LE => "S24_3LE".into(),
            Format::S24LE => "S24_LE".into(),
            Format::S32LE => "S32_LE".into(),
            Format::FloatLE => "FLOAT_LE".into(),
            other => format!("{other:?}"),
        }
    }

    fn audio_err<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> CxError + '_ {
        move |e| CxError::Audio(format!("{what}: {e}"))
    }

    pub struct AlsaBackend;

    impl AudioBackend for AlsaBackend {
        fn open(&self, name: &str, request: &AudioRequest) -> Result<Box<dyn AudioInput>> {
            let cname =
                CString::new(name).map_err(|_| CxError::Audio("bad device name".into()))?;
            let pcm = PCM::open(&cname, Direction::Capture, true)
                .map_err(audio_err("cannot open capture device"))?;

            let (rate, channels, format) = {
                let hwp = HwParams::any(&pcm).map_err(audio_err("hw params"))?;
                hwp.set_access(Access::RWInterleaved)
                    .map_err(audio_err("cannot set access type"))?;

                let rate = if request.rate != 0 {
                    request.rate
                } else {
                    hwp.get_rate_max().map_err(audio_err("cannot get rate"))?
                };
                hwp.set_rate(rate, ValueOr::Nearest)
                    .map_err(audio_err("cannot set sample rate"))?;

                if request.channels != 0 {
                    hwp.set_channels(request.channels)
                        .map_err(audio_err("cannot set channel count"))?;
                }

                if !request.format.is_empty() {
                    let format = format_by_name(&request.format).ok_or_else(|| {
                        CxError::Audio(format!("unknown sample format {}", request.format))
                    })?;
                    hwp.set_format(format)
                        .map_err(audio_err("cannot set sample format"))?;
                }

                pcm.hw_params(&hwp).map_err(audio_err("cannot apply hw parameters"))?;

                (
                    hwp.get_rate().map_err(audio_err("rate"))?,
                    hwp.get_channels().map_err(audio_err("channels"))?,
                    hwp.get_format().map_err(audio_err("format"))?,
                )
            };

            pcm.prepare().map_err(audio_err("cannot prepare interface"))?;

            let frame_bytes = pcm
                .frames_to_bytes(1)
                .try_into()
                .map_err(|_| CxError::Audio("bad frame size".into()))?;

            Ok(Box::new(AlsaInput {
                pcm,
                rate,
                channels,
                format,
                frame_bytes,
            }))
        }
    }

    struct AlsaInput {
        pcm: PCM,
        rate: u32,
        channels: u32,
        format: Format,
        frame_bytes: usize,
    }

    // SAFETY: the PCM handle is only used from the owning writer thread;
    // Send is what the trait needs.
    unsafe impl Send for AlsaInput {}

    impl AudioInput for AlsaInput {
        fn start(&mut self) -> Result<()> {
            self.pcm.start().map_err(audio_err("cannot start stream"))?;
            Ok(())
        }

        fn avail_frames(&mut self) -> Result<usize> {
            match self.pcm.avail() {
                Ok(frames) => Ok(frames as usize),
                Err(e) => Err(CxError::Audio(format!("avail: {e}"))),
            }
        }

        fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
            let io = self.pcm.io_bytes();
            match io.readi(buf) {
                Ok(frames) => Ok(frames * self.frame_bytes),
                Err(e) if e.errno() == libc::EAGAIN => {
                    std::thread::sleep(std::time::Duration::from_micros(1));
                    Ok(0)
                }
                Err(e) => Err(CxError::Audio(format!("readi: {e}"))),
            }
        }

        fn stop(&mut self) {
            let _ = self.pcm.drop();
        }

        fn rate(&self) -> u32 {
            self.rate
        }

        fn channels(&self) -> u32 {
            self.channels
        }

        fn format_name(&self) -> String {
            format_name(self.format)
        }

        fn sample_size(&self) -> usize {
            self.frame_bytes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_negotiates_defaults() {
        let mut input = ToneBackend.open("any", &AudioRequest::default()).unwrap();
        assert_eq!(input.rate(), 48000);
        assert_eq!(input.channels(), 2);
        assert_eq!(input.sample_size(), 4);
        assert_eq!(input.format_name(), "S16_LE");
        input.start().unwrap();
    }

    #[test]
    fn tone_rejects_foreign_formats() {
        let request = AudioRequest {
            format: "S32_LE".into(),
            ..Default::default()
        };
        assert!(ToneBackend.open("any", &request).is_err());
    }

    #[test]
    fn tone_frames_are_a_ramp() {
        let request = AudioRequest {
            rate: 1000,
            channels: 1,
            ..Default::default()
        };
        let mut input = ToneBackend.open("any", &request).unwrap();
        input.start().unwrap();

        let mut buf = vec![0u8; 8];
        assert_eq!(input.fill(&mut buf).unwrap(), 8);
        let samples: Vec<i16> = buf
            .chunks(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![0, 1, 2, 3]);
    }

    #[test]
    fn tone_paces_against_the_clock() {
        let request = AudioRequest {
            rate: 1000,
            channels: 1,
            ..Default::default()
        };
        let mut input = ToneBackend.open("any", &request).unwrap();
        input.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let avail = input.avail_frames().unwrap();
        assert!(avail >= 10, "expected ~20 frames, got {avail}");
    }
}
