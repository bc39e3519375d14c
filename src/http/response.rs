//! Response assembly: status lines, mandatory headers (§6), and branded
//! error pages that never echo request data back to the client (§7).

use std::time::SystemTime;

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Request Entity Too Large",
        414 => "URI Too Long",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// The security headers §6 requires on every error response.
const SECURITY_HEADERS: &str = "Cache-Control: no-cache, no-store, must-revalidate\r\n\
X-Frame-Options: DENY\r\n\
X-Content-Type-Options: nosniff\r\n\
X-XSS-Protection: 1; mode=block\r\n\
Referrer-Policy: strict-origin-when-cross-origin\r\n\
Content-Security-Policy: default-src 'self'; style-src 'self' 'unsafe-inline'\r\n";

pub fn server_name() -> &'static str {
    "x-server"
}

pub fn http_date() -> String {
    httpdate::fmt_http_date(SystemTime::now())
}

/// Render a generic branded error page + full response for `status`, with a
/// short operator-meaningful `reason` that is never request-derived.
pub fn branded_error(status: u16, reason: &str) -> Vec<u8> {
    let body = format!(
        "<!DOCTYPE html>\n<html><head><title>{status} {phrase}</title></head>\n\
<body><h1>{status} {phrase}</h1><p>{reason}</p></body></html>\n",
        phrase = reason_phrase(status),
        reason = reason,
    );
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {status} {phrase}\r\n\
Server: {server}\r\n\
Date: {date}\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Content-Length: {len}\r\n\
Connection: close\r\n\
{security}\r\n",
            phrase = reason_phrase(status),
            server = server_name(),
            date = http_date(),
            len = body.len(),
            security = SECURITY_HEADERS,
        )
        .as_bytes(),
    );
    out.extend_from_slice(body.as_bytes());
    out
}

/// Assemble a success response header block; caller appends the body.
pub fn success_headers(status: u16, content_type: &str, content_length: usize, extra: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {phrase}\r\n\
Server: {server}\r\n\
Date: {date}\r\n\
Content-Type: {content_type}\r\n\
Content-Length: {content_length}\r\n\
Connection: close\r\n\
{extra}\r\n",
        phrase = reason_phrase(status),
        server = server_name(),
        date = http_date(),
    )
    .into_bytes()
}

/// Pull the status code and response size back out of a response buffer
/// this module (or the proxy handler, relaying an upstream's own response
/// line) assembled, for the one call site (the connection's access-log
/// emission) that needs both without threading them through every
/// handler's return type. Only the header block -- found via the first
/// `\r\n\r\n` -- is decoded as text, so arbitrary binary bodies can never
/// be misread as header lines. When no `Content-Length` header is present
/// (an upstream relying on connection-close framing, §4.9), the size
/// falls back to the actual body bytes relayed.
pub fn parse_status_and_size(response: &[u8]) -> (u16, usize) {
    let header_end = response.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4).unwrap_or(response.len());
    let header_text = String::from_utf8_lossy(&response[..header_end]);
    let status = header_text
        .get(9..12)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    let size = header_text
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: ").or_else(|| l.strip_prefix("content-length: ")))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(response.len() - header_end);
    (status, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_page_never_echoes_reason_as_markup() {
        let page = branded_error(404, "route not found");
        let text = String::from_utf8(page).unwrap();
        assert!(text.contains("404 Not Found"));
        assert!(text.contains("Connection: close"));
        assert!(text.contains("X-Frame-Options: DENY"));
    }

    #[test]
    fn parses_status_and_size_back_out() {
        let page = branded_error(404, "missing");
        let (status, size) = parse_status_and_size(&page);
        assert_eq!(status, 404);
        let body_len = page.len() - page.windows(4).position(|w| w == b"\r\n\r\n").unwrap() - 4;
        assert_eq!(size, body_len);
    }

    #[test]
    fn content_length_header_matches_body() {
        let page = branded_error(500, "internal");
        let text = String::from_utf8(page).unwrap();
        let body_len: usize = text
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(body.len(), body_len);
    }
}
