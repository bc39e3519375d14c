//! Per-connection state machine (C7, §4.7):
//! ACCEPTED -> READING -> DISPATCHING -> RESPONDING -> CLOSING.
//!
//! Grounded on the read/decode/respond/write loop shape of
//! `HFQR-xitca-web/http/src/h1/proto/dispatcher.rs`, and on
//! `kill-ux-01-server/src/timeouts.rs` for sweeping an idle-connection map
//! keyed by `mio::Token`.

use std::{
    fs::File,
    io::{self, Read, Write},
    os::unix::io::AsRawFd,
    path::Path,
    time::{Duration, Instant},
};

use mio::net::TcpStream;
use tracing::warn;

use crate::{
    auth::{self, OAuthConfig},
    buffer::{BufferPool, GrowableBuffer, DEFAULT_BUF_SIZE, MAX_REQUEST_BYTES},
    config::{AuthKind, ConfigSnapshot, Route, RouteKind},
    http::{
        response::{branded_error, parse_status_and_size},
        Method, ParseError, ParseStatus, Parser,
    },
    proxy, route, static_handler,
};

/// Chunk size per `sendfile(2)`/mmap call for a large static file body.
const SENDFILE_CHUNK: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Accepted,
    Reading,
    Dispatching,
    Responding,
    Closing,
}

/// One accepted client connection plus everything its state machine needs
/// that does not live in the reactor's handler table (§4.7).
pub struct Connection {
    pub socket: TcpStream,
    pub client_ip: String,
    state: State,
    read_buf: GrowableBuffer,
    parser: Parser,
    write_buf: Vec<u8>,
    written: usize,
    file_body: Option<FileBody>,
    last_activity: Instant,
    keepalive_timeout: Duration,
    pending_log: Option<AccessLogRecord>,
    request_label: Option<(String, String, &'static str, String)>,
    bytes_received: usize,
}

pub enum StepResult {
    /// The connection is not finished; keep polling it.
    Continue,
    /// The response has been fully written (or the connection is otherwise
    /// done); the caller should unregister and drop it.
    Done,
}

/// One completed request's access-log fields (§6, §8 "exactly one
/// access-log line per completed request"). Populated the moment a
/// response is chosen -- by a successful dispatch or by any rejection
/// path -- and drained by the worker loop once the bytes are written.
#[derive(Debug, Clone)]
pub struct AccessLogRecord {
    pub method: String,
    pub path: String,
    pub version: &'static str,
    pub user_agent: String,
    pub status: u16,
    pub size: usize,
    pub bytes_received: usize,
}

impl Connection {
    pub fn new(socket: TcpStream, client_ip: String, keepalive_timeout: Duration) -> Self {
        Self {
            socket,
            client_ip,
            state: State::Accepted,
            read_buf: GrowableBuffer::new(MAX_REQUEST_BYTES),
            parser: Parser::new(MAX_REQUEST_BYTES),
            write_buf: Vec::new(),
            written: 0,
            file_body: None,
            last_activity: Instant::now(),
            keepalive_timeout,
            pending_log: None,
            request_label: None,
            bytes_received: 0,
        }
    }

    /// Take the access-log record for the most recently completed
    /// request, if one is waiting to be emitted.
    pub fn take_log(&mut self) -> Option<AccessLogRecord> {
        self.pending_log.take()
    }

    pub fn is_idle_timed_out(&self, now: Instant) -> bool {
        matches!(self.state, State::Accepted | State::Reading) && now.duration_since(self.last_activity) > self.keepalive_timeout
    }

    /// Drive the READING -> DISPATCHING -> RESPONDING transition once the
    /// reactor reports the socket readable. `ctx` bundles the shared,
    /// read-only collaborators a worker owns once per process.
    pub fn on_readable(&mut self, ctx: &DispatchContext) -> io::Result<StepResult> {
        self.last_activity = Instant::now();
        if self.state == State::Accepted {
            self.state = State::Reading;
        }

        let mut chunk = ctx.pool.lock().acquire();
        chunk.resize(DEFAULT_BUF_SIZE, 0);
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => return Ok(StepResult::Done),
                Ok(n) => {
                    self.bytes_received += n;
                    if self.read_buf.extend(&chunk[..n]).is_err() {
                        self.reject(413, "request exceeds the maximum accepted size");
                        ctx.pool.lock().release(chunk);
                        return Ok(StepResult::Continue);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Ok(StepResult::Done),
            }
        }
        ctx.pool.lock().release(chunk);

        match self.parser.parse(self.read_buf.as_slice()) {
            Ok(ParseStatus::NeedMore) => Ok(StepResult::Continue),
            Ok(ParseStatus::Complete { request, consumed }) => {
                self.read_buf.consume(consumed);
                self.state = State::Dispatching;
                self.dispatch(ctx, request);
                self.state = State::Responding;
                Ok(StepResult::Continue)
            }
            Err(e) => {
                self.reject_parse_error(e);
                Ok(StepResult::Continue)
            }
        }
    }

    fn dispatch(&mut self, ctx: &DispatchContext, request: crate::http::request::ParsedRequest) {
        self.request_label = Some((
            request.method.as_str().to_string(),
            request.path.clone(),
            request.version.as_str(),
            request.header("user-agent").unwrap_or("-").to_string(),
        ));

        if !matches!(request.method, Method::Get | Method::Post | Method::Put | Method::Delete | Method::Head | Method::Options) {
            self.reject(405, "method not supported");
            return;
        }

        let Some(route) = route::lookup(&ctx.config.routes, &request.path) else {
            self.reject(404, "no route matches this path");
            return;
        };

        if route.auth == AuthKind::OAuth {
            let oauth_cfg = OAuthConfig { app_secret: ctx.config.oauth_app_secret.clone(), allowed_urls: ctx.config.oauth_allowed_urls.clone() };
            let now = crate::shared::now_unix() as i64;
            if let Err(e) = auth::authenticate(&request, &oauth_cfg, now) {
                warn!(ip = %self.client_ip, path = %request.path, ?e, "oauth authentication failed");
                self.reject(403, "authentication failed");
                return;
            }
        }

        match route.kind {
            RouteKind::Static => self.dispatch_static(ctx, route, &request),
            RouteKind::Proxy => {
                let response = proxy::relay(route, &request, &self.client_ip).unwrap_or_else(|e| e.into_response());
                // HEAD carries every header a GET would, but no body (§4.8
                // headers still report the would-be Content-Length; only
                // the body is cut).
                self.write_buf = if request.method == Method::Head { strip_body(response) } else { response };
                self.record_log();
            }
        }
    }

    /// Static-route dispatch (§4.8): GET/HEAD only. On success, headers go
    /// into `write_buf` and the body either follows immediately (cached or
    /// listing bytes) or is handed off as `file_body` for the RESPONDING
    /// write path to stream via zero-copy `sendfile`/mmap.
    fn dispatch_static(&mut self, ctx: &DispatchContext, route: &Route, request: &crate::http::request::ParsedRequest) {
        if !matches!(request.method, Method::Get | Method::Head) {
            self.write_buf = branded_error(405, "static routes only accept GET and HEAD");
            self.record_log();
            return;
        }

        let resolved = static_handler::resolve(route, &request.path)
            .and_then(|full_path| static_handler::serve(ctx.cache, &full_path, &route.charset, Path::new(&route.local_path)));
        match resolved {
            Ok(resp) => {
                self.write_buf = resp.head;
                if request.method == Method::Get {
                    match resp.body {
                        static_handler::Body::Bytes(bytes) => self.write_buf.extend_from_slice(&bytes),
                        static_handler::Body::File(file) => {
                            self.file_body = Some(FileBody { file, offset: 0, remaining: resp.body_len });
                        }
                    }
                }
            }
            Err(e) => {
                let full = e.into_response();
                self.write_buf = if request.method == Method::Head { strip_body(full) } else { full };
            }
        }
        self.record_log();
    }

    fn reject(&mut self, status: u16, reason: &str) {
        self.write_buf = branded_error(status, reason);
        self.state = State::Responding;
        self.record_log();
    }

    /// Build the access-log record for whatever is currently in
    /// `write_buf`. Called from every path that assigns a response, so
    /// each completed request produces exactly one record (§8).
    fn record_log(&mut self) {
        let (status, size) = parse_status_and_size(&self.write_buf);
        let (method, path, version, user_agent) =
            self.request_label.take().unwrap_or_else(|| ("-".to_string(), "-".to_string(), "-", "-".to_string()));
        self.pending_log = Some(AccessLogRecord { method, path, version, user_agent, status, size, bytes_received: self.bytes_received });
        self.bytes_received = 0;
    }

    fn reject_parse_error(&mut self, e: ParseError) {
        let status = match e {
            ParseError::UriTooLong => 414,
            ParseError::BodyTooLarge => 413,
            ParseError::InvalidMethod => 405,
            ParseError::ChunkedNotSupported
            | ParseError::SmugglingAttempt
            | ParseError::DuplicateHeader
            | ParseError::InvalidUri
            | ParseError::InvalidHeaderName
            | ParseError::InvalidHeaderValue
            | ParseError::TooManyHeaders
            | ParseError::HeaderTooLarge
            | ParseError::InvalidVersion
            | ParseError::MalformedRequestLine => 400,
        };
        self.reject(status, "the request could not be parsed");
    }

    /// Flush as much of `write_buf` (headers, plus any non-file body) as the
    /// socket will currently accept, then stream `file_body`, if any, via
    /// the zero-copy write path (§4.8, §5).
    pub fn on_writable(&mut self) -> io::Result<StepResult> {
        if self.write_buf.is_empty() && self.file_body.is_none() {
            return Ok(StepResult::Continue);
        }
        while self.written < self.write_buf.len() {
            match self.socket.write(&self.write_buf[self.written..]) {
                Ok(0) => return Ok(StepResult::Done),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(StepResult::Continue),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Ok(StepResult::Done),
            }
        }

        if let Some(body) = self.file_body.as_mut() {
            match send_file_body(&mut self.socket, body) {
                Ok(true) => {}
                Ok(false) => return Ok(StepResult::Continue),
                Err(_) => return Ok(StepResult::Done),
            }
        }

        self.file_body = None;
        self.state = State::Closing;
        Ok(StepResult::Done)
    }

    pub fn has_pending_write(&self) -> bool {
        self.written < self.write_buf.len() || self.file_body.is_some()
    }
}

/// A static file body too large to cache, handed off by `static_handler`
/// for zero-copy delivery on the connection's write path (§4.8, §5).
struct FileBody {
    file: File,
    offset: u64,
    remaining: u64,
}

/// Stream `body` to `socket`: `sendfile(2)` first, falling back to a
/// memory-mapped write, falling back to a buffered read/write loop, per
/// §4.8 ("try OS `sendfile`; fall back to memory-mapped write; fall back to
/// buffered read/write"). Returns `Ok(true)` once `body.remaining` reaches
/// zero, `Ok(false)` on `EAGAIN` (caller re-arms writable and retries), and
/// `Err` on any other failure (the connection is aborted, §4.7).
fn send_file_body(socket: &mut TcpStream, body: &mut FileBody) -> io::Result<bool> {
    let out_fd = socket.as_raw_fd();
    let in_fd = body.file.as_raw_fd();
    loop {
        if body.remaining == 0 {
            return Ok(true);
        }
        let chunk = body.remaining.min(SENDFILE_CHUNK) as usize;
        let mut offset = body.offset as libc::off_t;
        let ret = unsafe { libc::sendfile(out_fd, in_fd, &mut offset, chunk) };
        if ret >= 0 {
            let sent = ret as u64;
            if sent == 0 {
                // Source file shrank concurrently; nothing more to send.
                return Ok(true);
            }
            body.offset += sent;
            body.remaining -= sent;
            continue;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(false),
            io::ErrorKind::Interrupted => continue,
            _ => match err.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::ENOSYS) => return send_file_body_mmap_or_buffered(socket, body),
                _ => return Err(err),
            },
        }
    }
}

/// `sendfile(2)` is refused on some filesystems/kernels (`EINVAL`) or
/// entirely absent (`ENOSYS`); fall back to a memory-mapped write, and if
/// `mmap` itself fails, to a plain buffered read/write loop.
fn send_file_body_mmap_or_buffered(socket: &mut TcpStream, body: &mut FileBody) -> io::Result<bool> {
    match send_file_body_mmap(socket, body) {
        Ok(done) => Ok(done),
        Err(_) => send_file_body_buffered(socket, body),
    }
}

fn send_file_body_mmap(socket: &mut TcpStream, body: &mut FileBody) -> io::Result<bool> {
    if body.remaining == 0 {
        return Ok(true);
    }
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as u64;
    let page_offset = body.offset % page_size;
    let map_offset = body.offset - page_offset;
    let map_len = (body.remaining + page_offset) as usize;

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            map_len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            body.file.as_raw_fd(),
            map_offset as libc::off_t,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    let slice = unsafe { std::slice::from_raw_parts((addr as *const u8).add(page_offset as usize), body.remaining as usize) };
    let result = write_body_slice(socket, slice, body);
    unsafe { libc::munmap(addr, map_len) };
    result
}

fn send_file_body_buffered(socket: &mut TcpStream, body: &mut FileBody) -> io::Result<bool> {
    use std::io::{Seek, SeekFrom};
    let mut chunk = vec![0u8; SENDFILE_CHUNK.min(body.remaining.max(1)) as usize];
    loop {
        if body.remaining == 0 {
            return Ok(true);
        }
        let want = (body.remaining.min(chunk.len() as u64)) as usize;
        body.file.seek(SeekFrom::Start(body.offset))?;
        let n = body.file.read(&mut chunk[..want])?;
        if n == 0 {
            return Ok(true);
        }
        match write_body_slice(socket, &chunk[..n], body) {
            Ok(true) => continue,
            other => return other,
        }
    }
}

/// Write as much of `slice` as the socket currently accepts, advancing
/// `body.offset`/`body.remaining` by exactly what was written so a later
/// retry (after `EAGAIN`) resumes at the right byte.
fn write_body_slice(socket: &mut TcpStream, slice: &[u8], body: &mut FileBody) -> io::Result<bool> {
    let mut written = 0usize;
    loop {
        if written == slice.len() {
            return Ok(true);
        }
        match socket.write(&slice[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "client closed the connection")),
            Ok(n) => {
                written += n;
                body.offset += n as u64;
                body.remaining -= n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Cut the body off an assembled response, leaving the header block (and
/// its `Content-Length`) intact, for HEAD requests (§4.8).
fn strip_body(response: Vec<u8>) -> Vec<u8> {
    match response.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => response[..pos + 4].to_vec(),
        None => response,
    }
}

/// Read-only collaborators a connection needs to dispatch a request. Built
/// once per accept from the worker's owned state; cheap to construct since
/// everything behind it is a reference or an `Arc`.
pub struct DispatchContext<'a> {
    pub config: &'a ConfigSnapshot,
    pub cache: &'a crate::cache::FileCache,
    pub pool: &'a parking_lot::Mutex<BufferPool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_only_applies_before_dispatch() {
        // State-transition guard: once a connection reaches RESPONDING it must
        // not be swept by the idle-reader timer even if writing stalls.
        let state = State::Responding;
        assert!(!matches!(state, State::Accepted | State::Reading));
    }

    #[test]
    fn reject_parse_error_maps_smuggling_to_400() {
        assert_eq!(status_for(ParseError::SmugglingAttempt), 400);
        assert_eq!(status_for(ParseError::UriTooLong), 414);
        assert_eq!(status_for(ParseError::BodyTooLarge), 413);
    }

    fn status_for(e: ParseError) -> u16 {
        match e {
            ParseError::UriTooLong => 414,
            ParseError::BodyTooLarge => 413,
            ParseError::InvalidMethod => 405,
            _ => 400,
        }
    }

    #[test]
    fn strip_body_keeps_headers_and_content_length() {
        let full = branded_error(404, "missing");
        let head_only = strip_body(full.clone());
        assert!(head_only.len() < full.len());
        let text = String::from_utf8_lossy(&head_only);
        assert!(text.contains("Content-Length:"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    fn accepted_pair() -> (std::net::TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server))
    }

    fn drive_to_response(mut conn: Connection, client: &mut std::net::TcpStream, request: &[u8], ctx: &DispatchContext) -> Vec<u8> {
        client.write_all(request).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        loop {
            match conn.on_readable(ctx).unwrap() {
                StepResult::Continue => {
                    if conn.has_pending_write() {
                        break;
                    }
                }
                StepResult::Done => break,
            }
        }
        while conn.has_pending_write() {
            if matches!(conn.on_writable().unwrap(), StepResult::Done) {
                break;
            }
        }
        drop(conn); // closes the server-side socket so the client sees EOF
        let mut response = Vec::new();
        client.read_to_end(&mut response).ok();
        response
    }

    #[test]
    fn head_request_gets_headers_but_no_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello world").unwrap();
        let route = crate::config::Route {
            kind: RouteKind::Static,
            path_prefix: "/".to_string(),
            target_host: String::new(),
            target_port: 0,
            local_path: dir.path().to_string_lossy().into_owned(),
            auth: AuthKind::None,
            charset: "utf-8".to_string(),
        };
        let mut cfg = ConfigSnapshot::default();
        cfg.routes = vec![route];
        let cache = crate::cache::FileCache::new(1024, 4096);
        let pool = parking_lot::Mutex::new(BufferPool::new(DEFAULT_BUF_SIZE));
        let ctx = DispatchContext { config: &cfg, cache: &cache, pool: &pool };

        let (mut client, server) = accepted_pair();
        let mut conn = Connection::new(server, "127.0.0.1".to_string(), Duration::from_secs(5));

        let response = drive_to_response(conn, &mut client, b"HEAD /a.txt HTTP/1.1\r\nHost: x\r\n\r\n", &ctx);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("Content-Length: 11"));
        assert!(text.ends_with("\r\n\r\n"), "HEAD response must carry no body: {text}");
    }

    #[test]
    fn post_to_a_static_route_is_rejected_with_405() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let route = crate::config::Route {
            kind: RouteKind::Static,
            path_prefix: "/".to_string(),
            target_host: String::new(),
            target_port: 0,
            local_path: dir.path().to_string_lossy().into_owned(),
            auth: AuthKind::None,
            charset: "utf-8".to_string(),
        };
        let mut cfg = ConfigSnapshot::default();
        cfg.routes = vec![route];
        let cache = crate::cache::FileCache::new(1024, 4096);
        let pool = parking_lot::Mutex::new(BufferPool::new(DEFAULT_BUF_SIZE));
        let ctx = DispatchContext { config: &cfg, cache: &cache, pool: &pool };

        let (mut client, server) = accepted_pair();
        let mut conn = Connection::new(server, "127.0.0.1".to_string(), Duration::from_secs(5));

        let response = drive_to_response(conn, &mut client, b"POST /a.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n", &ctx);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 405"), "expected 405, got: {text}");
    }

    #[test]
    fn completed_request_records_bytes_actually_read_off_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let route = crate::config::Route {
            kind: RouteKind::Static,
            path_prefix: "/".to_string(),
            target_host: String::new(),
            target_port: 0,
            local_path: dir.path().to_string_lossy().into_owned(),
            auth: AuthKind::None,
            charset: "utf-8".to_string(),
        };
        let mut cfg = ConfigSnapshot::default();
        cfg.routes = vec![route];
        let cache = crate::cache::FileCache::new(1024, 4096);
        let pool = parking_lot::Mutex::new(BufferPool::new(DEFAULT_BUF_SIZE));
        let ctx = DispatchContext { config: &cfg, cache: &cache, pool: &pool };

        let (mut client, server) = accepted_pair();
        let mut conn = Connection::new(server, "127.0.0.1".to_string(), Duration::from_secs(5));
        let request = b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n";
        client.write_all(request).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        loop {
            match conn.on_readable(&ctx).unwrap() {
                StepResult::Continue if conn.has_pending_write() => break,
                StepResult::Continue => continue,
                StepResult::Done => break,
            }
        }
        let record = conn.take_log().expect("request should have produced an access-log record");
        assert_eq!(record.bytes_received, request.len());
    }
}
