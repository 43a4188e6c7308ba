//! The served endpoints and the session machinery behind them.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{error, info, warn};

use super::audio::{AudioInput, AudioRequest};
use super::http::urldecode;
use super::source::SampleSource;
use super::{lock, CaptureState, Connection, CxSource, LinearSource, ServerState, SERVER_VERSION};
use crate::ring::{MagicRingBuffer, RingReader, RingWriter};

pub type Handler = fn(&Arc<ServerState>, &mut dyn Connection, &[String]) -> io::Result<()>;

pub struct ServedFile {
    pub path: &'static str,
    pub headers: &'static str,
    pub handler: Handler,
}

pub const SERVED_FILES: &[ServedFile] = &[
    ServedFile {
        path: "/",
        headers: "Content-Type: text/html; charset=utf-8\r\n",
        handler: file_root,
    },
    ServedFile {
        path: "/version",
        headers: "Content-Type: text/plain; charset=utf-8\r\n",
        handler: file_version,
    },
    ServedFile {
        path: "/cxadc",
        headers: "Content-Disposition: attachment\r\n",
        handler: file_cxadc,
    },
    ServedFile {
        path: "/linear",
        headers: "Content-Disposition: attachment\r\n",
        handler: file_linear,
    },
    ServedFile {
        path: "/start",
        headers: "Content-Type: text/json; charset=utf-8\r\n",
        handler: file_start,
    },
    ServedFile {
        path: "/stop",
        headers: "Content-Type: text/json; charset=utf-8\r\n",
        handler: file_stop,
    },
    ServedFile {
        path: "/stats",
        headers: "Content-Type: text/json; charset=utf-8\r\n",
        handler: file_stats,
    },
];

fn write_json(out: &mut dyn Connection, value: &serde_json::Value) -> io::Result<()> {
    write!(out, "{value}")
}

fn file_root(_state: &Arc<ServerState>, out: &mut dyn Connection, _args: &[String]) -> io::Result<()> {
    write!(out, "Hello World!\n")
}

fn file_version(
    _state: &Arc<ServerState>,
    out: &mut dyn Connection,
    _args: &[String],
) -> io::Result<()> {
    writeln!(out, "{SERVER_VERSION}")
}

// --- Session bootstrap --------------------------------------------------

struct StartArgs {
    cxadc_ids: Vec<u32>,
    linear_enabled: bool,
    linear_name: String,
    request: AudioRequest,
}

fn parse_start_args(state: &ServerState, args: &[String]) -> StartArgs {
    let mut parsed = StartArgs {
        cxadc_ids: Vec::new(),
        linear_enabled: false,
        linear_name: state.settings.audio.device.clone(),
        request: AudioRequest {
            rate: state.settings.audio.rate,
            channels: state.settings.audio.channels,
            format: state.settings.audio.format.clone(),
        },
    };

    for arg in args {
        if let Some(rest) = arg.strip_prefix("cxadc") {
            if let Ok(n) = rest.parse::<u32>() {
                if n < 256 && parsed.cxadc_ids.len() < 256 {
                    parsed.cxadc_ids.push(n);
                }
                continue;
            }
        }
        if arg == "linear" {
            parsed.linear_enabled = true;
            continue;
        }
        if let Some(v) = arg.strip_prefix("lname=") {
            parsed.linear_name = urldecode(v);
            continue;
        }
        if let Some(v) = arg.strip_prefix("lformat=") {
            parsed.request.format = urldecode(v);
            continue;
        }
        if let Some(v) = arg.strip_prefix("lrate=") {
            if let Ok(rate) = v.parse::<u32>() {
                if (22050..=384000).contains(&rate) {
                    parsed.request.rate = rate;
                }
            }
            continue;
        }
        if let Some(v) = arg.strip_prefix("lchannels=") {
            if let Ok(channels) = v.parse::<u32>() {
                if (1..=16).contains(&channels) {
                    parsed.request.channels = channels;
                }
            }
            continue;
        }
    }

    parsed
}

fn ring_of(bytes: usize) -> crate::error::Result<MagicRingBuffer> {
    let granule = MagicRingBuffer::allocation_granularity();
    MagicRingBuffer::with_size(bytes.next_multiple_of(granule))
}

/// Builds the session directly into the server state so the error leg
/// can reap whatever exists. Returns `(cxadc_ns, linear_ns)` bootstrap
/// timings.
fn bootstrap_session(state: &Arc<ServerState>, args: &StartArgs) -> Result<(i64, i64), String> {
    let settings = &state.settings.capture;

    // Rings first; they are the expensive part and the most likely to
    // fail.
    let mut writers: Vec<RingWriter> = Vec::new();
    for &id in &args.cxadc_ids {
        let ring = ring_of(settings.cxadc_ring_bytes)
            .map_err(|e| format!("failed to allocate ringbuffer: {e}"))?;
        let stats = ring.stats();
        let (writer, reader) = ring.split();
        writers.push(writer);
        lock(&state.cxadc).push(Arc::new(CxSource {
            name: format!("cxadc{id}"),
            stats,
            reader_slot: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(None),
        }));
    }

    let t1 = Instant::now();

    let mut linear_parts: Option<(RingWriter, Box<dyn AudioInput>)> = None;
    if args.linear_enabled {
        let input = state
            .audio
            .open(&args.linear_name, &args.request)
            .map_err(|e| format!("failed to get audio device info: {e}"))?;
        let ring = ring_of(settings.audio_ring_frames * input.sample_size())
            .map_err(|e| format!("failed to allocate ringbuffer: {e}"))?;
        let stats = ring.stats();
        let (writer, reader) = ring.split();
        *lock(&state.linear) = Some(Arc::new(LinearSource {
            stats,
            reader_slot: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(None),
            writer_state: AtomicU32::new(CaptureState::Starting as u32),
            rate: input.rate(),
            channels: input.channels(),
            format_name: input.format_name(),
            sample_size: input.sample_size(),
        }));
        linear_parts = Some((writer, input));
    }

    let t2 = Instant::now();

    // Open the character devices.
    let mut sample_sources: Vec<Box<dyn SampleSource>> = Vec::new();
    for &id in &args.cxadc_ids {
        sample_sources.push(
            state
                .factory
                .open(id)
                .map_err(|e| format!("cannot open cxadc: {e}"))?,
        );
    }

    let t3 = Instant::now();

    // Producers; they idle until the state machine leaves Starting.
    let sources: Vec<Arc<CxSource>> = lock(&state.cxadc).clone();
    for ((source, writer), sample_source) in
        sources.iter().zip(writers).zip(sample_sources)
    {
        let handle = spawn_cxadc_writer(
            Arc::clone(state),
            Arc::clone(source),
            writer,
            sample_source,
            settings.chunk_size,
        )
        .map_err(|e| format!("can't create cxadc writer thread: {e}"))?;
        *lock(&source.writer) = Some(handle);
    }

    if let Some((writer, input)) = linear_parts {
        let linear = lock(&state.linear)
            .clone()
            .ok_or_else(|| "linear source vanished during bootstrap".to_string())?;
        let handle = spawn_linear_writer(Arc::clone(state), Arc::clone(&linear), writer, input)
            .map_err(|e| format!("can't create linear writer thread: {e}"))?;
        *lock(&linear.writer) = Some(handle);
    }

    Ok(((t3 - t2).as_nanos() as i64, (t2 - t1).as_nanos() as i64))
}

fn file_start(state: &Arc<ServerState>, out: &mut dyn Connection, args: &[String]) -> io::Result<()> {
    if let Err(current) = state.try_transition(CaptureState::Idle, CaptureState::Starting) {
        return write_json(out, &json!({ "state": current.as_str() }));
    }

    let parsed = parse_start_args(state, args);
    state.overflow_counter.store(0, Ordering::SeqCst);

    match bootstrap_session(state, &parsed) {
        Ok((cxadc_ns, linear_ns)) => {
            state.set_capture_state(CaptureState::Running);

            // The audio writer finishes its bootstrap on its own thread;
            // wait for its verdict so the caller never sees a phantom
            // Running session.
            let linear = lock(&state.linear).clone();
            if let Some(linear) = &linear {
                while linear.writer_state() == CaptureState::Starting {
                    thread::sleep(Duration::from_millis(1));
                }
                if linear.writer_state() == CaptureState::Failed {
                    return fail_start(
                        state,
                        out,
                        "audio capture failed, check server log".into(),
                    );
                }
            }

            let (rate, channels, format) = match &linear {
                Some(linear) => (linear.rate, linear.channels, linear.format_name.clone()),
                None => (0, 0, String::new()),
            };

            write_json(
                out,
                &json!({
                    "state": CaptureState::Running.as_str(),
                    "cxadc_ns": cxadc_ns,
                    "linear_ns": linear_ns,
                    "linear_rate": rate,
                    "linear_channels": channels,
                    "linear_format": format,
                }),
            )
        }
        Err(reason) => fail_start(state, out, reason),
    }
}

/// Error leg of `/start`: fail the session, reap whatever got built,
/// answer with the reason and return to Idle.
fn fail_start(
    state: &Arc<ServerState>,
    out: &mut dyn Connection,
    reason: String,
) -> io::Result<()> {
    error!(%reason, "capture start failed");
    state.set_capture_state(CaptureState::Failed);

    if let Some(linear) = lock(&state.linear).take() {
        if let Some(handle) = lock(&linear.writer).take() {
            let _ = handle.join();
        }
    }
    for source in lock(&state.cxadc).drain(..) {
        if let Some(handle) = lock(&source.writer).take() {
            let _ = handle.join();
        }
    }

    let result = write_json(
        out,
        &json!({
            "state": CaptureState::Failed.as_str(),
            "fail_reason": reason,
        }),
    );
    state.set_capture_state(CaptureState::Idle);
    result
}

// --- Producer threads ---------------------------------------------------

fn spawn_cxadc_writer(
    state: Arc<ServerState>,
    source: Arc<CxSource>,
    mut writer: RingWriter,
    mut samples: Box<dyn SampleSource>,
    chunk_size: usize,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{}-writer", source.name))
        .spawn(move || {
            while state.capture_state() == CaptureState::Starting {
                thread::sleep(Duration::from_millis(1));
            }
            if state.capture_state() == CaptureState::Failed {
                return;
            }

            loop {
                match state.capture_state() {
                    CaptureState::Running => {}
                    _ => break,
                }

                let Some(buf) = writer.write_ptr(chunk_size) else {
                    state.overflow_counter.fetch_add(1, Ordering::SeqCst);
                    warn!(source = %source.name, "ring buffer full, dropping samples");
                    thread::sleep(Duration::from_millis(1));
                    continue;
                };

                match samples.read_samples(buf) {
                    Ok(0) => thread::sleep(Duration::from_micros(1)),
                    Ok(n) => {
                        let _ = writer.write_finished(n);
                    }
                    Err(e) => {
                        error!(source = %source.name, "read failed: {e}");
                        break;
                    }
                }
            }
        })
}

fn spawn_linear_writer(
    state: Arc<ServerState>,
    source: Arc<LinearSource>,
    mut writer: RingWriter,
    mut input: Box<dyn AudioInput>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("linear-writer".into())
        .spawn(move || {
            while state.capture_state() == CaptureState::Starting {
                thread::sleep(Duration::from_millis(1));
            }
            if state.capture_state() == CaptureState::Failed {
                source.set_writer_state(CaptureState::Failed);
                return;
            }

            let result = linear_pump(&state, &source, &mut writer, input.as_mut());
            if let Err(reason) = &result {
                error!(%reason, "linear capture ended");
            }

            // Publish the exit verdict: a failure while the session is
            // still Running is the writer's own; anything else is an
            // ordinary stop.
            if state.capture_state() == CaptureState::Running && result.is_err() {
                source.set_writer_state(CaptureState::Failed);
            } else {
                source.set_writer_state(CaptureState::Stopping);
            }

            input.stop();
        })
}

fn linear_pump(
    state: &Arc<ServerState>,
    source: &LinearSource,
    writer: &mut RingWriter,
    input: &mut dyn AudioInput,
) -> Result<(), String> {
    input.start().map_err(|e| e.to_string())?;

    // Throw away the first buffer; it is not always full.
    let first = input.avail_frames().map_err(|e| e.to_string())?;
    if first > 0 {
        let mut scratch = vec![0u8; first * input.sample_size()];
        input.fill(&mut scratch).map_err(|e| e.to_string())?;
    }

    source.set_writer_state(CaptureState::Running);

    loop {
        match state.capture_state() {
            CaptureState::Running => {}
            _ => break,
        }

        let frames = input.avail_frames().map_err(|e| e.to_string())?;
        if frames == 0 {
            continue;
        }

        let bytes = frames * input.sample_size();
        let Some(buf) = writer.write_ptr(bytes) else {
            state.overflow_counter.fetch_add(1, Ordering::SeqCst);
            warn!("linear ring buffer full, dropping samples");
            thread::sleep(Duration::from_millis(1));
            continue;
        };

        let n = input.fill(buf).map_err(|e| e.to_string())?;
        let _ = writer.write_finished(n);
    }

    Ok(())
}

// --- Teardown -----------------------------------------------------------

fn file_stop(state: &Arc<ServerState>, out: &mut dyn Connection, _args: &[String]) -> io::Result<()> {
    if let Err(current) = state.try_transition(CaptureState::Running, CaptureState::Stopping) {
        return write_json(out, &json!({ "state": current.as_str() }));
    }

    // Writers first; each loop observes Stopping on its next iteration.
    let sources: Vec<Arc<CxSource>> = lock(&state.cxadc).clone();
    for source in &sources {
        if let Some(handle) = lock(&source.writer).take() {
            let _ = handle.join();
        }
    }

    let linear = lock(&state.linear).clone();
    if let Some(linear) = &linear {
        if let Some(handle) = lock(&linear.writer).take() {
            let _ = handle.join();
        }
        while linear.reader_slot.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
        }
    }

    // Readers drain the rings and clear their slots; only then can the
    // ring memory go away.
    for source in &sources {
        while source.reader_slot.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
        }
    }

    lock(&state.cxadc).clear();
    *lock(&state.linear) = None;

    state.set_capture_state(CaptureState::Idle);
    info!("capture stopped");

    write_json(
        out,
        &json!({
            "state": CaptureState::Idle.as_str(),
            "overflows": state.overflow_counter.load(Ordering::SeqCst),
        }),
    )
}

// --- Streaming ----------------------------------------------------------

/// Streams a ring to the connection as its sole reader.
///
/// The reader slot is a compare-and-set flag; a second consumer loses
/// the exchange and returns with an empty body. Losing the `/stop` race
/// right after claiming the slot just means a short stream.
fn pump_ring(
    state: &Arc<ServerState>,
    out: &mut dyn Connection,
    slot: &AtomicBool,
    reader_cell: &Mutex<Option<RingReader>>,
) -> io::Result<()> {
    if slot
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    // Wait out a concurrent bootstrap.
    loop {
        match state.capture_state() {
            CaptureState::Starting => thread::sleep(Duration::from_micros(1)),
            CaptureState::Running | CaptureState::Stopping => break,
            _ => {
                slot.store(false, Ordering::SeqCst);
                return Ok(());
            }
        }
    }

    let Some(mut reader) = lock(reader_cell).take() else {
        slot.store(false, Ordering::SeqCst);
        return Ok(());
    };

    loop {
        let cap_state = state.capture_state();
        if cap_state != CaptureState::Running && cap_state != CaptureState::Stopping {
            break;
        }

        let available = reader.available();
        if cap_state == CaptureState::Stopping && available == 0 {
            break;
        }

        let Some(data) = reader.read_ptr(available) else {
            thread::sleep(Duration::from_micros(1));
            continue;
        };
        if data.is_empty() {
            thread::sleep(Duration::from_micros(1));
            continue;
        }

        match out.write(data) {
            Err(e) => {
                error!("write failed: {e}");
                break;
            }
            Ok(0) => thread::sleep(Duration::from_micros(1)),
            Ok(n) => {
                let _ = reader.read_finished(n);
            }
        }
    }

    *lock(reader_cell) = Some(reader);
    slot.store(false, Ordering::SeqCst);
    Ok(())
}

fn file_cxadc(state: &Arc<ServerState>, out: &mut dyn Connection, args: &[String]) -> io::Result<()> {
    if args.len() != 1 {
        return Ok(());
    }
    let Ok(id) = args[0].parse::<usize>() else {
        return Ok(());
    };
    if id >= 256 {
        return Ok(());
    }
    let Some(source) = lock(&state.cxadc).get(id).cloned() else {
        return Ok(());
    };
    pump_ring(state, out, &source.reader_slot, &source.reader)
}

fn file_linear(
    state: &Arc<ServerState>,
    out: &mut dyn Connection,
    _args: &[String],
) -> io::Result<()> {
    let Some(linear) = lock(&state.linear).clone() else {
        return Ok(());
    };
    pump_ring(state, out, &linear.reader_slot, &linear.reader)
}

// --- Stats --------------------------------------------------------------

fn ring_stats_json(stats: &crate::ring::RingStats) -> serde_json::Value {
    json!({
        "read": stats.total_read(),
        "written": stats.total_write(),
        "difference": stats.difference(),
        "difference_pct": stats.difference_pct(),
    })
}

fn file_stats(state: &Arc<ServerState>, out: &mut dyn Connection, _args: &[String]) -> io::Result<()> {
    let cap_state = state.capture_state();
    if cap_state != CaptureState::Running {
        return write_json(out, &json!({ "state": cap_state.as_str() }));
    }

    let mut object = serde_json::Map::new();
    object.insert("state".into(), cap_state.as_str().into());
    object.insert(
        "overflows".into(),
        state.overflow_counter.load(Ordering::SeqCst).into(),
    );

    if let Some(linear) = lock(&state.linear).clone() {
        object.insert("linear".into(), ring_stats_json(&linear.stats));
    }

    let cxadc: Vec<serde_json::Value> = lock(&state.cxadc)
        .iter()
        .map(|source| ring_stats_json(&source.stats))
        .collect();
    object.insert("cxadc".into(), cxadc.into());

    write_json(out, &serde_json::Value::Object(object))
}
