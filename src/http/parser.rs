//! Incremental HTTP/1.x request parser (C3, §4.3).
//!
//! Grounded on the `Context`-holds-parse-state shape of
//! `HFQR-xitca-web/http/src/h1/proto/{context,decode}.rs`, generalized from
//! `httparse`-backed tokenizing to a hand-rolled byte state machine so the
//! duplicate-header, chunked-rejection and control-byte hardening rules in
//! §4.3 can be enforced exactly as specified.

use super::request::{Method, ParsedRequest, Version};

const MAX_URI_LEN: usize = 2048;
const MAX_HEADER_COUNT: usize = 100;
const MAX_HEADER_NAME_LEN: usize = 256;
const MAX_HEADER_VALUE_LEN: usize = 8 * 1024;

/// States named directly after §4.3's state list. `Body` and `Complete` are
/// folded into the driver loop below since they need no further
/// byte-by-byte scanning once `Content-Length` is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Headers,
    Body,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidMethod,
    UriTooLong,
    InvalidUri,
    InvalidVersion,
    HeaderTooLarge,
    TooManyHeaders,
    InvalidHeaderName,
    InvalidHeaderValue,
    DuplicateHeader,
    SmugglingAttempt,
    ChunkedNotSupported,
    BodyTooLarge,
    MalformedRequestLine,
}

pub enum ParseStatus {
    NeedMore,
    Complete { request: ParsedRequest, consumed: usize },
}

/// Headers that may legally appear at most once (§4.3).
const SINGLETON_HEADERS: [&str; 5] = ["content-length", "transfer-encoding", "host", "authorization", "cookie"];

pub struct Parser {
    state: State,
    pos: usize,
    method: Option<Method>,
    path: String,
    query: Option<String>,
    version: Option<Version>,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
    has_transfer_encoding: bool,
    body_start: usize,
    max_request_bytes: usize,
}

impl Parser {
    pub fn new(max_request_bytes: usize) -> Self {
        Self {
            state: State::Start,
            pos: 0,
            method: None,
            path: String::new(),
            query: None,
            version: None,
            headers: Vec::new(),
            content_length: None,
            has_transfer_encoding: false,
            body_start: 0,
            max_request_bytes,
        }
    }

    /// Feed the full accumulated read buffer. The parser resumes from the
    /// last position it parsed up to; callers do not need to slice.
    pub fn parse(&mut self, buf: &[u8]) -> Result<ParseStatus, ParseError> {
        loop {
            match self.state {
                State::Start => {
                    let Some(line_end) = find_crlf(buf, self.pos) else {
                        if buf.len() - self.pos > MAX_URI_LEN + 32 {
                            return Err(ParseError::UriTooLong);
                        }
                        return Ok(ParseStatus::NeedMore);
                    };
                    self.parse_request_line(&buf[self.pos..line_end])?;
                    self.pos = line_end + 2;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some(line_end) = find_crlf(buf, self.pos) else {
                        if buf.len() - self.pos > MAX_HEADER_VALUE_LEN + MAX_HEADER_NAME_LEN {
                            return Err(ParseError::HeaderTooLarge);
                        }
                        return Ok(ParseStatus::NeedMore);
                    };
                    let line = &buf[self.pos..line_end];
                    self.pos = line_end + 2;
                    if line.is_empty() {
                        self.finish_headers()?;
                        self.body_start = self.pos;
                        self.state = if self.content_length.unwrap_or(0) > 0 { State::Body } else { State::Complete };
                    } else {
                        self.parse_header_line(line)?;
                    }
                }
                State::Body => {
                    let need = self.content_length.unwrap_or(0);
                    if buf.len() - self.body_start < need {
                        if self.body_start + need > self.max_request_bytes {
                            return Err(ParseError::BodyTooLarge);
                        }
                        return Ok(ParseStatus::NeedMore);
                    }
                    self.state = State::Complete;
                }
                State::Complete => {
                    let need = self.content_length.unwrap_or(0);
                    let body = buf[self.body_start..self.body_start + need].to_vec();
                    let request = ParsedRequest {
                        method: self.method.take().unwrap(),
                        path: std::mem::take(&mut self.path),
                        query: self.query.take(),
                        version: self.version.take().unwrap(),
                        headers: std::mem::take(&mut self.headers),
                        body_length: body.len(),
                        body,
                    };
                    let consumed = self.body_start + need;
                    return Ok(ParseStatus::Complete { request, consumed });
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
        let method = parts.next().ok_or(ParseError::MalformedRequestLine)?;
        let uri = parts.next().ok_or(ParseError::MalformedRequestLine)?;
        let version = parts.next().ok_or(ParseError::MalformedRequestLine)?;
        if parts.next().is_some() {
            return Err(ParseError::MalformedRequestLine);
        }

        self.method = Some(Method::from_bytes(method).ok_or(ParseError::InvalidMethod)?);

        if uri.len() > MAX_URI_LEN {
            return Err(ParseError::UriTooLong);
        }
        if uri.iter().any(|&b| b < 0x20 || b == 0x7f) {
            return Err(ParseError::InvalidUri);
        }
        let uri_str = std::str::from_utf8(uri).map_err(|_| ParseError::InvalidUri)?;
        let (raw_path, query) = match uri_str.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (uri_str, None),
        };
        self.path = normalize_path(raw_path)?;
        self.query = query;

        self.version = Some(match version {
            b"HTTP/1.1" => Version::Http11,
            b"HTTP/1.0" => Version::Http10,
            _ => return Err(ParseError::InvalidVersion),
        });
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        if self.headers.len() >= MAX_HEADER_COUNT {
            return Err(ParseError::TooManyHeaders);
        }
        let colon = line.iter().position(|&b| b == b':').ok_or(ParseError::InvalidHeaderName)?;
        let (name_bytes, rest) = line.split_at(colon);
        let value_bytes = trim_ows(&rest[1..]);

        if name_bytes.is_empty() || name_bytes.len() > MAX_HEADER_NAME_LEN {
            return Err(ParseError::InvalidHeaderName);
        }
        if !name_bytes
            .iter()
            .all(|&b| b.is_ascii_graphic() && b != b':')
        {
            return Err(ParseError::InvalidHeaderName);
        }
        if value_bytes.len() > MAX_HEADER_VALUE_LEN {
            return Err(ParseError::InvalidHeaderValue);
        }
        if value_bytes.iter().any(|&b| b == b'\r' || b == b'\n' || (b < 0x20 && b != b'\t')) {
            return Err(ParseError::InvalidHeaderValue);
        }

        let name = String::from_utf8_lossy(name_bytes).to_ascii_lowercase();
        let value = String::from_utf8_lossy(value_bytes).to_string();

        if SINGLETON_HEADERS.contains(&name.as_str()) && self.headers.iter().any(|(n, _)| n == &name) {
            return Err(ParseError::DuplicateHeader);
        }

        if name == "transfer-encoding" {
            self.has_transfer_encoding = true;
            if !value.eq_ignore_ascii_case("identity") {
                return Err(ParseError::ChunkedNotSupported);
            }
        }
        if name == "content-length" {
            let len: i64 = value.parse().map_err(|_| ParseError::InvalidHeaderValue)?;
            if len < 0 || (len as u64) > (10 * 1024 * 1024) {
                return Err(ParseError::BodyTooLarge);
            }
            self.content_length = Some(len as usize);
        }

        self.headers.push((name, value));
        Ok(())
    }

    fn finish_headers(&mut self) -> Result<(), ParseError> {
        if self.content_length.is_some() && self.has_transfer_encoding {
            return Err(ParseError::SmugglingAttempt);
        }
        Ok(())
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].windows(2).position(|w| w == b"\r\n").map(|p| from + p)
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = bytes.len();
    while start < end && (bytes[start] == b' ' || bytes[start] == b'\t') {
        start += 1;
    }
    while end > start && (bytes[end - 1] == b' ' || bytes[end - 1] == b'\t') {
        end -= 1;
    }
    &bytes[start..end]
}

/// Normalize a request-target path per §4.3: reject `..` path segments,
/// percent-encoded `.`/`/`/`\`, absolute-path drive prefixes, embedded
/// CR/LF; collapse repeated `/`; strip a leading `./`; ensure a leading
/// `/`. A `..` that isn't its own segment (e.g. `archive..2024.tar`) is a
/// legitimate filename, not a traversal attempt, so only segments are
/// checked here.
fn normalize_path(raw: &str) -> Result<String, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::InvalidUri);
    }
    let lower = raw.to_ascii_lowercase();
    if lower.contains("%2e") || lower.contains("%2f") || lower.contains("%5c") {
        return Err(ParseError::InvalidUri);
    }
    if raw.split('/').any(|segment| segment == "..") || raw.contains('\\') || raw.contains('\r') || raw.contains('\n') {
        return Err(ParseError::InvalidUri);
    }
    if raw.len() >= 2 && raw.as_bytes()[1] == b':' {
        return Err(ParseError::InvalidUri);
    }

    let mut path = raw.strip_prefix("./").unwrap_or(raw).to_string();
    if !path.starts_with('/') {
        path = format!("/{path}");
    }

    let mut collapsed = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        collapsed.push(c);
    }
    if collapsed.len() > 1 && collapsed.ends_with('/') {
        // keep trailing slash; directory requests rely on it (§4.8)
    }
    Ok(collapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Result<ParsedRequest, ParseError> {
        let mut p = Parser::new(10 * 1024 * 1024);
        match p.parse(input)? {
            ParseStatus::Complete { request, .. } => Ok(request),
            ParseStatus::NeedMore => panic!("expected complete parse"),
        }
    }

    #[test]
    fn simple_get() {
        let req = parse_all(b"GET /hello.txt HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/hello.txt");
        assert_eq!(req.version, Version::Http11);
    }

    #[test]
    fn rejects_traversal() {
        let mut p = Parser::new(1024);
        let err = p.parse(b"GET /../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::InvalidUri);
    }

    #[test]
    fn rejects_traversal_segment_in_the_middle_of_the_path() {
        let mut p = Parser::new(1024);
        let err = p.parse(b"GET /a/../b HTTP/1.1\r\nHost: x\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::InvalidUri);
    }

    #[test]
    fn allows_a_filename_that_merely_contains_two_dots() {
        let mut p = Parser::new(1024);
        let req = p.parse(b"GET /archive..2024.tar HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.path, "/archive..2024.tar");
    }

    #[test]
    fn rejects_smuggling_pair() {
        let mut p = Parser::new(1024);
        let err = p
            .parse(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\nhello")
            .unwrap_err();
        assert_eq!(err, ParseError::ChunkedNotSupported);
    }

    #[test]
    fn rejects_duplicate_host() {
        let mut p = Parser::new(1024);
        let err = p
            .parse(b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, ParseError::DuplicateHeader);
    }

    #[test]
    fn rejects_unknown_method() {
        let mut p = Parser::new(1024);
        let err = p.parse(b"PATCH / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::InvalidMethod);
    }

    #[test]
    fn need_more_on_partial_request_line() {
        let mut p = Parser::new(1024);
        match p.parse(b"GET /hello.txt HTTP/1.1\r\n").unwrap() {
            ParseStatus::NeedMore => {}
            _ => panic!("expected need more"),
        }
    }

    #[test]
    fn body_round_trip() {
        let req = parse_all(b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello").unwrap();
        assert_eq!(req.body, b"hello");
        assert_eq!(req.body_length, 5);
    }

    #[test]
    fn collapses_repeated_slashes() {
        let req = parse_all(b"GET //a//b HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(req.path, "/a/b");
    }
}
