//! The capture server.
//!
//! An HTTP/1.0 fan-out in front of the capture sources: `/start` builds
//! a session (one producer thread and one magic ring per source),
//! `/cxadc?N` and `/linear` stream a ring to a socket, `/stop` tears the
//! session down, `/stats` reports ring accounting. Capture state is a
//! single atomic with compare-and-set guarded transitions; everything
//! else follows from which thread won that exchange.

pub mod audio;
pub mod endpoints;
pub mod http;
pub mod source;

use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::config::Settings;
use crate::error::{CxError, Result};
use crate::ring::{RingReader, RingStats};
use audio::AudioBackend;
use source::SourceFactory;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CaptureState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Failed = 4,
}

impl CaptureState {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureState::Idle => "Idle",
            CaptureState::Starting => "Starting",
            CaptureState::Running => "Running",
            CaptureState::Stopping => "Stopping",
            CaptureState::Failed => "Failed",
        }
    }

    fn from_u32(value: u32) -> Self {
        match value {
            1 => CaptureState::Starting,
            2 => CaptureState::Running,
            3 => CaptureState::Stopping,
            4 => CaptureState::Failed,
            _ => CaptureState::Idle,
        }
    }
}

/// One `cxadc<N>` session slot.
pub struct CxSource {
    pub name: String,
    pub stats: RingStats,
    /// Sole-reader slot; the streaming endpoint claims it with a CAS.
    pub reader_slot: AtomicBool,
    pub reader: Mutex<Option<RingReader>>,
    pub writer: Mutex<Option<JoinHandle<()>>>,
}

/// The audio session slot.
pub struct LinearSource {
    pub stats: RingStats,
    pub reader_slot: AtomicBool,
    pub reader: Mutex<Option<RingReader>>,
    pub writer: Mutex<Option<JoinHandle<()>>>,
    /// The writer thread finishes its own bootstrap; it publishes
    /// Running, Failed or Stopping here so `/start` never hangs on it.
    pub writer_state: AtomicU32,
    pub rate: u32,
    pub channels: u32,
    pub format_name: String,
    pub sample_size: usize,
}

impl LinearSource {
    pub fn writer_state(&self) -> CaptureState {
        CaptureState::from_u32(self.writer_state.load(Ordering::SeqCst))
    }

    pub fn set_writer_state(&self, state: CaptureState) {
        self.writer_state.store(state as u32, Ordering::SeqCst);
    }
}

/// Everything the connection threads share.
pub struct ServerState {
    pub settings: Settings,
    pub factory: Box<dyn SourceFactory>,
    pub audio: Box<dyn AudioBackend>,
    cap_state: AtomicU32,
    pub overflow_counter: AtomicU64,
    pub cxadc: Mutex<Vec<Arc<CxSource>>>,
    pub linear: Mutex<Option<Arc<LinearSource>>>,
}

impl ServerState {
    pub fn capture_state(&self) -> CaptureState {
        CaptureState::from_u32(self.cap_state.load(Ordering::SeqCst))
    }

    pub fn set_capture_state(&self, to: CaptureState) {
        self.cap_state.store(to as u32, Ordering::SeqCst);
    }

    /// Compare-and-set transition guard. Only the caller that observes
    /// `from` wins; losers get the state that was actually current.
    pub fn try_transition(
        &self,
        from: CaptureState,
        to: CaptureState,
    ) -> std::result::Result<(), CaptureState> {
        self.cap_state
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(CaptureState::from_u32)
    }
}

/// Poison-tolerant lock: a panicked writer must not wedge `/stop`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A client connection; both TCP and Unix sockets qualify.
pub trait Connection: Read + Write {}
impl<T: Read + Write> Connection for T {}

/// Listening endpoint from the CLI argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(u16),
    Unix(PathBuf),
}

impl Endpoint {
    /// `<port>` or `unix:<path>`; the path must fit a socket address
    /// (less than 108 bytes).
    pub fn parse(arg: &str) -> Result<Self> {
        if let Some(path) = arg.strip_prefix("unix:") {
            if path.is_empty() || path.len() >= 108 {
                return Err(CxError::InvalidParameter("unix socket path"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        match arg.parse::<u32>() {
            Ok(port) if (1..=65535).contains(&port) => Ok(Endpoint::Tcp(port as u16)),
            _ => Err(CxError::InvalidParameter("port")),
        }
    }
}

pub struct CaptureServer {
    state: Arc<ServerState>,
}

impl CaptureServer {
    /// Builds the server from settings: source factory per the capture
    /// backend, audio backend per the enabled features.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let factory: Box<dyn SourceFactory> = match settings.capture.backend.as_str() {
            "sim" => Box::new(source::SimSourceFactory::from_settings(&settings.capture)),
            _ => Box::new(source::FileSourceFactory::new(
                settings.capture.device_prefix.clone(),
            )),
        };
        Ok(Self::with_parts(settings, factory, default_audio_backend()))
    }

    /// Explicit wiring (tests and embedders).
    pub fn with_parts(
        settings: Settings,
        factory: Box<dyn SourceFactory>,
        audio: Box<dyn AudioBackend>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                settings,
                factory,
                audio,
                cap_state: AtomicU32::new(CaptureState::Idle as u32),
                overflow_counter: AtomicU64::new(0),
                cxadc: Mutex::new(Vec::new()),
                linear: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Binds and serves forever.
    pub fn serve(&self, endpoint: &Endpoint) -> Result<()> {
        match endpoint {
            Endpoint::Tcp(port) => {
                let listener = TcpListener::bind(("0.0.0.0", *port))?;
                info!(port, "server listening");
                self.serve_tcp_listener(listener)?;
            }
            Endpoint::Unix(path) => {
                // A stale socket file blocks the bind.
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                info!(path = %path.display(), "server listening");
                self.serve_unix_listener(listener)?;
            }
        }
        Ok(())
    }

    /// Thread-per-connection accept loop over an already-bound TCP
    /// listener.
    pub fn serve_tcp_listener(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => self.spawn_connection(stream)?,
                Err(e) => error!("accept failed: {e}"),
            }
        }
    }

    pub fn serve_unix_listener(&self, listener: UnixListener) -> io::Result<()> {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => self.spawn_connection(stream)?,
                Err(e) => error!("accept failed: {e}"),
            }
        }
    }

    fn spawn_connection<S: Connection + Send + 'static>(&self, stream: S) -> io::Result<()> {
        let state = Arc::clone(&self.state);
        thread::Builder::new().name("http".into()).spawn(move || {
            let mut stream = stream;
            http::serve_connection(&state, &mut stream);
        })?;
        Ok(())
    }
}

fn default_audio_backend() -> Box<dyn AudioBackend> {
    #[cfg(feature = "audio-alsa")]
    {
        Box::new(audio::AlsaBackend)
    }
    #[cfg(not(feature = "audio-alsa"))]
    {
        Box::new(audio::ToneBackend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(Endpoint::parse("8080").unwrap(), Endpoint::Tcp(8080));
        assert_eq!(Endpoint::parse("1").unwrap(), Endpoint::Tcp(1));
        assert_eq!(Endpoint::parse("65535").unwrap(), Endpoint::Tcp(65535));
        assert!(Endpoint::parse("0").is_err());
        assert!(Endpoint::parse("65536").is_err());
        assert!(Endpoint::parse("http").is_err());

        assert_eq!(
            Endpoint::parse("unix:/tmp/capture.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/capture.sock"))
        );
        assert!(Endpoint::parse("unix:").is_err());
        let long = format!("unix:{}", "x".repeat(200));
        assert!(Endpoint::parse(&long).is_err());
    }

    #[test]
    fn transitions_are_exclusive() {
        let server = CaptureServer::with_parts(
            Settings::default(),
            Box::new(source::FileSourceFactory::new("/dev/null-cxadc")),
            Box::new(audio::ToneBackend),
        );
        let state = server.state();

        assert_eq!(state.capture_state(), CaptureState::Idle);
        state
            .try_transition(CaptureState::Idle, CaptureState::Starting)
            .unwrap();
        // The loser learns the current state.
        assert_eq!(
            state.try_transition(CaptureState::Idle, CaptureState::Starting),
            Err(CaptureState::Starting)
        );
        state.set_capture_state(CaptureState::Running);
        state
            .try_transition(CaptureState::Running, CaptureState::Stopping)
            .unwrap();
        assert_eq!(state.capture_state(), CaptureState::Stopping);
    }
}
