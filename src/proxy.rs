//! Reverse proxy handler (C9, §4.9): connect to the route's upstream,
//! rewrite headers, relay the exchange, map connect/timeout failures to
//! status codes.
//!
//! Grounded on `HFQR-xitca-web/reverse-proxy/src/proxy.rs` and
//! `forwarder/forward_header.rs` for the hop-by-hop stripping list and the
//! `X-Forwarded-*` assembly, and `service.rs` for mapping connect/timeout
//! failures onto `502`/`504`. The upstream exchange itself is a bounded,
//! blocking request/response round trip rather than a second `mio`
//! registration: the worker's single reactor thread already bounds one
//! proxied request to the 5s-connect/30s-total budget below, and a second
//! evented half-connection per in-flight proxy request would roughly
//! double `connection.rs`'s state machine for a gateway whose proxy path is
//! already timeout-bounded end to end.

use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

use crate::{
    config::Route,
    http::{request::ParsedRequest, response::branded_error},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOTAL_BUDGET: Duration = Duration::from_secs(30);
const MAX_UPSTREAM_RESPONSE: usize = 16 * 1024 * 1024;
/// Outgoing header-block bound (§4.9: "stop emitting further headers if the
/// outgoing buffer would overflow (signal 500)").
const MAX_OUTBOUND_HEADER_BYTES: usize = 64 * 1024;

/// Headers that must never be forwarded verbatim between hops (§4.9).
const HOP_BY_HOP: [&str; 4] = ["connection", "transfer-encoding", "content-encoding", "upgrade"];

#[derive(Debug)]
pub enum ProxyError {
    ConnectFailed,
    Timeout,
    UpstreamReset,
    HeaderBufferOverflow,
}

impl ProxyError {
    pub fn into_response(self) -> Vec<u8> {
        match self {
            ProxyError::ConnectFailed => branded_error(502, "could not reach the upstream server"),
            ProxyError::Timeout => branded_error(504, "upstream did not respond in time"),
            ProxyError::UpstreamReset => branded_error(502, "upstream closed the connection unexpectedly"),
            ProxyError::HeaderBufferOverflow => branded_error(500, "request headers exceed the outgoing buffer"),
        }
    }
}

/// Relay `req` to `route`'s upstream and return the raw response bytes
/// (status line through body) unmodified, aside from the request-side
/// rewriting this function performs before sending.
pub fn relay(route: &Route, req: &ParsedRequest, client_ip: &str) -> Result<Vec<u8>, ProxyError> {
    let deadline = Instant::now() + TOTAL_BUDGET;
    let addr = format!("{}:{}", route.target_host, route.target_port);
    let mut sock_addrs = addr.to_socket_addrs().map_err(|_| ProxyError::ConnectFailed)?;
    let sock_addr = sock_addrs.next().ok_or(ProxyError::ConnectFailed)?;

    let stream = TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT).map_err(|e| {
        // §4.9: a stalled connect attempt is a timeout (504), distinct from
        // a refused/unreachable connect (502, §7 `upstream_connect`).
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ProxyError::Timeout,
            _ => ProxyError::ConnectFailed,
        }
    })?;
    stream.set_read_timeout(Some(remaining(deadline))).ok();
    stream.set_write_timeout(Some(remaining(deadline))).ok();
    stream.set_nodelay(true).ok();

    let outbound = build_outbound_request(route, req, client_ip)?;
    let mut stream = stream;
    stream.write_all(&outbound).map_err(|_| ProxyError::UpstreamReset)?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        if Instant::now() >= deadline {
            return Err(ProxyError::Timeout);
        }
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if response.len() + n > MAX_UPSTREAM_RESPONSE {
                    return Err(ProxyError::UpstreamReset);
                }
                response.extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(ProxyError::Timeout);
            }
            Err(_) => return Err(ProxyError::UpstreamReset),
        }
    }
    if response.is_empty() {
        return Err(ProxyError::UpstreamReset);
    }
    Ok(response)
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1))
}

/// Build the request line + rewritten header block sent to the upstream.
/// Every forwarded header value already passed the parser's CR/LF and
/// control-byte rejection (§4.3), so the CRLF-injection defense §4.9 asks
/// for is already enforced before a header ever reaches this function.
fn build_outbound_request(route: &Route, req: &ParsedRequest, _client_ip: &str) -> Result<Vec<u8>, ProxyError> {
    let stripped = req.path.strip_prefix(&route.path_prefix).unwrap_or(&req.path);
    let path = if stripped.is_empty() { "/" } else { stripped };
    let target = match &req.query {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method, target);
    if out.len() > MAX_OUTBOUND_HEADER_BYTES {
        return Err(ProxyError::HeaderBufferOverflow);
    }

    for (name, value) in &req.headers {
        if HOP_BY_HOP.contains(&name.as_str()) || name == "x-forwarded-for" || name == "x-forwarded-host" {
            continue;
        }
        let line = format!("{name}: {value}\r\n");
        // §4.9: stop emitting further headers once the outgoing buffer
        // would overflow, rather than truncating mid-header.
        if out.len() + line.len() > MAX_OUTBOUND_HEADER_BYTES {
            return Err(ProxyError::HeaderBufferOverflow);
        }
        out.push_str(&line);
    }
    let xff = req.header("x-forwarded-for").unwrap_or("unknown");
    out.push_str(&format!("X-Forwarded-For: {xff}\r\n"));
    if let Some(host) = req.header("host") {
        out.push_str(&format!("X-Forwarded-Host: {host}\r\n"));
    }
    out.push_str("Connection: close\r\n");
    out.push_str("\r\n");
    if out.len() > MAX_OUTBOUND_HEADER_BYTES {
        return Err(ProxyError::HeaderBufferOverflow);
    }

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&req.body);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthKind, RouteKind};
    use crate::http::{request::Method, request::Version};
    use std::{io::Read as _, net::TcpListener, thread};

    fn route() -> Route {
        Route {
            kind: RouteKind::Proxy,
            path_prefix: "/api".to_string(),
            target_host: "127.0.0.1".to_string(),
            target_port: 0,
            local_path: String::new(),
            auth: AuthKind::None,
            charset: "utf-8".to_string(),
        }
    }

    fn req() -> ParsedRequest {
        ParsedRequest {
            method: Method::Get,
            path: "/api/x".to_string(),
            query: None,
            version: Version::Http11,
            headers: vec![("host".to_string(), "example.com".to_string())],
            body: Vec::new(),
            body_length: 0,
        }
    }

    #[test]
    fn strips_hop_by_hop_headers_from_outbound_request() {
        let mut request = req();
        request.headers.push(("connection".to_string(), "keep-alive".to_string()));
        request.headers.push(("transfer-encoding".to_string(), "identity".to_string()));
        let out = build_outbound_request(&route(), &request, "9.9.9.9").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.to_ascii_lowercase().contains("transfer-encoding: identity"));
        assert!(text.contains("X-Forwarded-For: unknown"));
        assert!(text.starts_with("GET /x HTTP/1.1\r\n"));
    }

    #[test]
    fn oversized_header_block_is_rejected_before_connecting() {
        let mut request = req();
        request.headers.push(("x-big".to_string(), "z".repeat(MAX_OUTBOUND_HEADER_BYTES)));
        let err = build_outbound_request(&route(), &request, "9.9.9.9").unwrap_err();
        assert!(matches!(err, ProxyError::HeaderBufferOverflow));
    }

    #[test]
    fn connect_failure_maps_to_bad_gateway() {
        let mut r = route();
        r.target_port = 1; // reserved, nothing listens there in test sandboxes
        let result = relay(&r, &req(), "1.2.3.4");
        assert!(matches!(result, Err(ProxyError::ConnectFailed) | Err(ProxyError::Timeout)));
    }

    #[test]
    fn relays_upstream_response_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").unwrap();
        });
        let mut r = route();
        r.target_port = addr.port();
        let response = relay(&r, &req(), "1.2.3.4").unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK"));
        handle.join().unwrap();
    }
}
