//! HTTP surface scenarios with simulated capture sources.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cxcapture::config::Settings;
use cxcapture::device::dma::DmaGeometry;
use cxcapture::server::audio::ToneBackend;
use cxcapture::server::source::SimSourceFactory;
use cxcapture::server::{CaptureServer, CaptureState, ServerState};

fn test_settings(ring_bytes: usize) -> Settings {
    let mut settings = Settings::default();
    settings.capture.chunk_size = 4096;
    settings.capture.cxadc_ring_bytes = ring_bytes;
    settings.capture.audio_ring_frames = 16384;
    settings
}

fn start_server(
    settings: Settings,
    device_ring_pages: usize,
    pages_per_tick: u32,
) -> (Arc<ServerState>, SocketAddr) {
    let geometry = DmaGeometry {
        page_size: 4096,
        ring_bytes: device_ring_pages * 4096,
        irq_period_in_pages: 8,
    };
    let server = CaptureServer::with_parts(
        settings,
        Box::new(SimSourceFactory::ephemeral(geometry, pages_per_tick)),
        Box::new(ToneBackend),
    );
    let state = server.state();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let _ = server.serve_tcp_listener(listener);
    });
    (state, addr)
}

fn raw_request(addr: SocketAddr, request: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();

    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| at + 4)
        .unwrap_or(response.len());
    let head = String::from_utf8_lossy(&response[..split]).into_owned();
    let body = response[split..].to_vec();
    (head, body)
}

fn get(addr: SocketAddr, path: &str) -> (String, Vec<u8>) {
    raw_request(addr, &format!("GET {path} HTTP/1.0\r\n\r\n"))
}

fn get_json(addr: SocketAddr, path: &str) -> serde_json::Value {
    let (head, body) = get(addr, path);
    assert!(head.starts_with("HTTP/1.0 200 OK"), "unexpected head: {head}");
    serde_json::from_slice(&body).unwrap()
}

#[test]
fn fixed_endpoints_and_errors() {
    let (_state, addr) = start_server(test_settings(65536), 64, 2);

    let (head, body) = get(addr, "/");
    assert!(head.starts_with("HTTP/1.0 200 OK"));
    assert_eq!(body, b"Hello World!\n");

    let (head, body) = get(addr, "/version");
    assert!(head.starts_with("HTTP/1.0 200 OK"));
    assert_eq!(
        String::from_utf8_lossy(&body).trim(),
        env!("CARGO_PKG_VERSION")
    );

    // Unknown path, case-sensitive match.
    let (head, _) = get(addr, "/Version");
    assert!(head.starts_with("HTTP/1.0 404"));
    let (head, _) = get(addr, "/nope");
    assert!(head.starts_with("HTTP/1.0 404"));

    // Only GET is spoken.
    let (head, _) = raw_request(addr, "POST /start HTTP/1.0\r\n\r\n");
    assert!(head.starts_with("HTTP/1.0 405"));

    // Garbage request line.
    let (head, _) = raw_request(addr, "nonsense\r\n\r\n");
    assert!(head.starts_with("HTTP/1.0 400"));
}

#[test]
fn start_stream_stats_stop_cycle() {
    let (state, addr) = start_server(test_settings(1 << 20), 512, 1);

    let started = get_json(addr, "/start?cxadc0");
    assert_eq!(started["state"], "Running");
    assert!(started["cxadc_ns"].as_i64().unwrap() >= 0);
    assert_eq!(state.capture_state(), CaptureState::Running);

    // Stream some bytes and verify the device's counting pattern comes
    // through gapless.
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"GET /cxadc?0 HTTP/1.0\r\n\r\n").unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    while data.len() < 32768 {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "stream must not end before /stop");
        data.extend_from_slice(&buf[..n]);
    }
    let body_start = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| at + 4)
        .unwrap();
    let samples = &data[body_start..];
    let mut expected = samples[0];
    for (i, &b) in samples.iter().enumerate() {
        assert_eq!(b, expected, "gap at streamed byte {i}");
        expected = expected.wrapping_add(1);
    }
    drop(stream);

    // Give the pump a moment to notice the hangup and clear its slot.
    thread::sleep(Duration::from_millis(50));

    let stats = get_json(addr, "/stats");
    assert_eq!(stats["state"], "Running");
    assert_eq!(stats["cxadc"].as_array().unwrap().len(), 1);
    let source = &stats["cxadc"][0];
    assert!(source["written"].as_u64().unwrap() > 0);
    assert!(source["read"].as_u64().unwrap() > 0);

    let stopped = get_json(addr, "/stop");
    assert_eq!(stopped["state"], "Idle");
    assert!(stopped["overflows"].as_u64().is_some());
    assert_eq!(state.capture_state(), CaptureState::Idle);

    // Idle stats collapse to the state alone.
    let stats = get_json(addr, "/stats");
    assert_eq!(stats, serde_json::json!({ "state": "Idle" }));
}

#[test]
fn second_reader_is_rejected_while_first_streams() {
    let (_state, addr) = start_server(test_settings(65536), 512, 2);
    assert_eq!(get_json(addr, "/start?cxadc0")["state"], "Running");

    let mut first = TcpStream::connect(addr).unwrap();
    first.write_all(b"GET /cxadc?0 HTTP/1.0\r\n\r\n").unwrap();
    // Make sure the first pump holds the slot before the second tries.
    let mut sink = [0u8; 1024];
    let n = first.read(&mut sink).unwrap();
    assert!(n > 0);

    let begun = Instant::now();
    let (head, body) = get(addr, "/cxadc?0");
    assert!(head.starts_with("HTTP/1.0 200 OK"));
    assert!(body.is_empty(), "loser of the reader CAS gets no stream");
    assert!(begun.elapsed() < Duration::from_secs(2));

    drop(first);
    let _ = get_json(addr, "/stop");
}

#[test]
fn concurrent_starts_bootstrap_once() {
    let (_state, addr) = start_server(test_settings(65536), 64, 2);

    let racers: Vec<_> = (0..2)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream
                    .write_all(b"GET /start?cxadc0 HTTP/1.0\r\n\r\n")
                    .unwrap();
                let mut response = Vec::new();
                stream.read_to_end(&mut response).unwrap();
                let at = response
                    .windows(4)
                    .position(|w| w == b"\r\n\r\n")
                    .unwrap()
                    + 4;
                serde_json::from_slice::<serde_json::Value>(&response[at..]).unwrap()
            })
        })
        .collect();

    let responses: Vec<serde_json::Value> =
        racers.into_iter().map(|r| r.join().unwrap()).collect();

    // Exactly one caller ran the bootstrap (its reply carries the
    // timing fields); the loser just observed a state.
    let winners = responses
        .iter()
        .filter(|r| r.get("cxadc_ns").is_some())
        .count();
    assert_eq!(winners, 1);
    for response in &responses {
        let state = response["state"].as_str().unwrap();
        assert!(["Running", "Starting"].contains(&state), "state {state}");
    }

    let _ = get_json(addr, "/stop");
}

#[test]
fn blocked_consumer_overflows_and_fills_the_ring() {
    // Tiny server-side ring; nobody streams it.
    let (_state, addr) = start_server(test_settings(8192), 512, 2);
    assert_eq!(get_json(addr, "/start?cxadc0")["state"], "Running");

    // 8 KiB at the sim's pace fills in well under a second.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stats = get_json(addr, "/stats");
        let overflows = stats["overflows"].as_u64().unwrap();
        let pct = stats["cxadc"][0]["difference_pct"].as_u64().unwrap();
        if overflows > 0 && pct == 100 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "ring never filled: {stats}"
        );
        thread::sleep(Duration::from_millis(20));
    }

    let stopped = get_json(addr, "/stop");
    assert!(stopped["overflows"].as_u64().unwrap() > 0);
}

#[test]
fn linear_session_reports_audio_parameters_and_streams() {
    let (_state, addr) = start_server(test_settings(1 << 20), 512, 1);

    let started = get_json(addr, "/start?cxadc0&linear&lrate=48000&lchannels=2");
    assert_eq!(started["state"], "Running");
    assert_eq!(started["linear_rate"], 48000);
    assert_eq!(started["linear_channels"], 2);
    assert_eq!(started["linear_format"], "S16_LE");

    // The tone source produces an i16 ramp, both channels equal.
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"GET /linear HTTP/1.0\r\n\r\n").unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    while data.len() < 4096 {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0);
        data.extend_from_slice(&buf[..n]);
    }
    let body_start = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| at + 4)
        .unwrap();
    // Align to whole frames (4 bytes each).
    let samples = &data[body_start..];
    let frames: Vec<(i16, i16)> = samples
        .chunks_exact(4)
        .map(|f| {
            (
                i16::from_le_bytes([f[0], f[1]]),
                i16::from_le_bytes([f[2], f[3]]),
            )
        })
        .collect();
    assert!(frames.len() > 16);
    for (i, (left, right)) in frames.iter().enumerate() {
        assert_eq!(left, right, "channel mismatch at frame {i}");
        if i > 0 {
            assert_eq!(
                *left,
                frames[i - 1].0.wrapping_add(1),
                "ramp gap at frame {i}"
            );
        }
    }
    drop(stream);

    thread::sleep(Duration::from_millis(50));
    let stats = get_json(addr, "/stats");
    assert!(stats["linear"]["written"].as_u64().unwrap() > 0);

    let _ = get_json(addr, "/stop");
}

#[test]
fn stats_race_free_shape_after_failures() {
    // A start that names no sources still runs (an empty session), and
    // a second stop is a state echo.
    let (_state, addr) = start_server(test_settings(65536), 64, 2);

    let started = get_json(addr, "/start");
    assert_eq!(started["state"], "Running");

    let stats = get_json(addr, "/stats");
    assert_eq!(stats["cxadc"].as_array().unwrap().len(), 0);

    assert_eq!(get_json(addr, "/stop")["state"], "Idle");
    assert_eq!(get_json(addr, "/stop")["state"], "Idle");
}

#[test]
fn unix_socket_serves_the_same_surface() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.sock");

    let server = CaptureServer::with_parts(
        test_settings(65536),
        Box::new(SimSourceFactory::ephemeral(
            DmaGeometry {
                page_size: 4096,
                ring_bytes: 64 * 4096,
                irq_period_in_pages: 8,
            },
            2,
        )),
        Box::new(ToneBackend),
    );
    let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
    thread::spawn(move || {
        let _ = server.serve_unix_listener(listener);
    });

    let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
    stream.write_all(b"GET /version HTTP/1.0\r\n\r\n").unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.0 200 OK"));
    assert!(text.contains(env!("CARGO_PKG_VERSION")));
}
