//! Minimal HTTP/1.0 request handling.
//!
//! One request per connection: read the header block, parse the request
//! line, route by exact path, hand the socket to the endpoint handler.
//! Bodies are written straight to the connection (the streaming
//! endpoints never know their length up front).

use std::io::{Read, Write};
use std::sync::Arc;

use tracing::debug;

use super::endpoints::SERVED_FILES;
use super::{Connection, ServerState};

/// Decodes `%XX` escapes and `+` as space.
pub fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = |b: u8| (b as char).to_digit(16);
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi * 16 + lo) as u8);
                        i += 3;
                    }
                    _ => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn respond_status(conn: &mut dyn Connection, status: &str) {
    let _ = write!(conn, "HTTP/1.0 {status}\r\n\r\n");
}

/// Serves exactly one request, then lets the caller close the
/// connection.
pub fn serve_connection(state: &Arc<ServerState>, conn: &mut dyn Connection) {
    let mut buf = [0u8; 4096];
    let mut len = 0usize;

    // Accumulate until the end of the header block; a request that does
    // not fit is dropped without a response.
    loop {
        match conn.read(&mut buf[len..]) {
            Ok(0) | Err(_) => {
                if len == 0 || !buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
                    return;
                }
                break;
            }
            Ok(n) => len += n,
        }
        if buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if len == buf.len() {
            return;
        }
    }

    let head = String::from_utf8_lossy(&buf[..len]);
    let mut request_line = head.split("\r\n").next().unwrap_or("").split_whitespace();
    let (Some(method), Some(uri), Some(version)) =
        (request_line.next(), request_line.next(), request_line.next())
    else {
        respond_status(conn, "400 Bad Request");
        return;
    };
    if !version.starts_with("HTTP/") {
        respond_status(conn, "400 Bad Request");
        return;
    }

    if method != "GET" {
        respond_status(conn, "405 Method Not Allowed");
        return;
    }

    // `?a=b&c=d` argument form; the path match is exact and
    // case-sensitive.
    let (path, args) = match uri.split_once('?') {
        Some((path, query)) => (
            path,
            query.split('&').map(str::to_owned).collect::<Vec<_>>(),
        ),
        None => (uri, Vec::new()),
    };

    for file in SERVED_FILES {
        if file.path != path {
            continue;
        }
        let _ = write!(conn, "HTTP/1.0 200 OK\r\n{}\r\n", file.headers);
        if let Err(e) = (file.handler)(state, conn, &args) {
            debug!(path, "handler ended: {e}");
        }
        let _ = conn.flush();
        return;
    }

    respond_status(conn, "404 Not Found");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urldecode_escapes() {
        assert_eq!(urldecode("hw%3ACARD%3DCXADC"), "hw:CARD=CXADC");
        assert_eq!(urldecode("a+b"), "a b");
        assert_eq!(urldecode("plain"), "plain");
        // Malformed escapes pass through.
        assert_eq!(urldecode("50%"), "50%");
        assert_eq!(urldecode("%zz"), "%zz");
    }
}
