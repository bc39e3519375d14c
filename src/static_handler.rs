//! Static file delivery (C8, §4.8): path resolution under a route root,
//! directory listing, cached/disk reads.
//!
//! Grounded on `HFQR-xitca-web/http-file/src/runtime.rs` and `chunk.rs`
//! (chunked, syscall-driven file body writes) and `date.rs`
//! (`Last-Modified`/`If-Modified-Since` date handling); MIME lookup via
//! `mime_guess`, already a dependency of that crate.

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use crate::{cache::FileCache, config::Route, http::response::branded_error};

#[derive(Debug)]
pub enum StaticError {
    NotFound,
    Forbidden,
    Io(io::Error),
}

/// A response body not yet on the wire. `Bytes` covers cached hits and
/// directory listings, already materialized in this process; `File` is
/// handed to the connection's write path for files too large to cache, so
/// it can attempt `sendfile`/mmap zero-copy delivery (§4.8, §5) instead of
/// reading the whole thing into memory here.
pub enum Body {
    Bytes(Arc<[u8]>),
    File(fs::File),
}

pub struct StaticResponse {
    pub head: Vec<u8>,
    pub body: Body,
    pub body_len: u64,
}

impl From<io::Error> for StaticError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => StaticError::NotFound,
            io::ErrorKind::PermissionDenied => StaticError::Forbidden,
            _ => StaticError::Io(e),
        }
    }
}

/// Resolve `path` (already normalized by the parser, §4.3) against
/// `route.local_path`, rejecting anything that canonicalizes outside the
/// route root even if the parser's own traversal checks were bypassed.
pub fn resolve(route: &Route, path: &str) -> Result<PathBuf, StaticError> {
    let suffix = path.strip_prefix(&route.path_prefix).unwrap_or(path).trim_start_matches('/');
    let root = Path::new(&route.local_path);
    let candidate = if suffix.is_empty() { root.to_path_buf() } else { root.join(suffix) };

    let root_canon = root.canonicalize().map_err(|_| StaticError::NotFound)?;
    let candidate_canon = candidate.canonicalize().unwrap_or(candidate);
    if !candidate_canon.starts_with(&root_canon) {
        return Err(StaticError::Forbidden);
    }
    Ok(candidate_canon)
}

/// Serve `full_path`, consulting `cache` first. Directories produce a
/// listing page, or `<dir>/index.html` when one exists (§4.8). Files that
/// fit under the cache's `max_file_size` are read once, cached, and served
/// from memory on every later hit; files over that bound bypass the cache
/// entirely and are handed to the caller as a raw `fs::File` so the
/// connection's write path can attempt the zero-copy send §4.8/§5 require.
pub fn serve(cache: &FileCache, full_path: &Path, charset: &str, route_root: &Path) -> Result<StaticResponse, StaticError> {
    let metadata = fs::metadata(full_path)?;

    if metadata.is_dir() {
        let index = full_path.join("index.html");
        if index.is_file() {
            return serve(cache, &index, charset, route_root);
        }
        let at_root = route_root.canonicalize().map(|root| root == full_path).unwrap_or(false);
        return Ok(directory_listing(full_path, charset, !at_root));
    }

    let key = full_path.to_string_lossy().into_owned();
    let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    if let Some((bytes, cached_mtime)) = cache.get(&key) {
        if cached_mtime == mtime {
            return Ok(bytes_response(bytes, full_path, mtime, charset));
        }
        cache.invalidate(&key);
    }

    let file = fs::File::open(full_path)?;
    let len = metadata.len();

    if len > cache.max_file_size() {
        let head = build_headers(full_path, mtime, charset, len as usize);
        return Ok(StaticResponse { head, body_len: len, body: Body::File(file) });
    }

    let mut file = file;
    let mut contents = Vec::with_capacity(len as usize);
    file.read_to_end(&mut contents)?;
    let bytes: Arc<[u8]> = Arc::from(contents.into_boxed_slice());
    let _ = cache.put(&key, bytes.to_vec(), mtime);
    Ok(bytes_response(bytes, full_path, mtime, charset))
}

fn build_headers(path: &Path, mtime: SystemTime, charset: &str, body_len: usize) -> Vec<u8> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    // §4.8: text types carry `charset=<route.charset>`; binary types do not.
    let content_type = if mime.type_() == mime_guess::mime::TEXT {
        format!("{mime}; charset={charset}")
    } else {
        mime.to_string()
    };
    let last_modified = httpdate::fmt_http_date(mtime);
    let extra = format!("Last-Modified: {last_modified}\r\nAccept-Ranges: bytes\r\n");
    crate::http::response::success_headers(200, &content_type, body_len, &extra)
}

fn bytes_response(bytes: Arc<[u8]>, path: &Path, mtime: SystemTime, charset: &str) -> StaticResponse {
    let head = build_headers(path, mtime, charset, bytes.len());
    StaticResponse { body_len: bytes.len() as u64, head, body: Body::Bytes(bytes) }
}

fn directory_listing(dir: &Path, charset: &str, include_parent_link: bool) -> StaticResponse {
    let mut entries: Vec<String> = fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    if is_dir {
                        format!("{name}/")
                    } else {
                        name
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    entries.sort();

    let mut body = String::from("<!DOCTYPE html>\n<html><head><title>Index</title></head>\n<body><ul>\n");
    // §4.8: "including parent link when not at root".
    if include_parent_link {
        body.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for name in &entries {
        body.push_str(&format!("<li><a href=\"{name}\">{name}</a></li>\n"));
    }
    body.push_str("</ul></body></html>\n");

    let content_type = format!("text/html; charset={charset}");
    let head = crate::http::response::success_headers(200, &content_type, body.len(), "");
    let bytes: Arc<[u8]> = Arc::from(body.into_bytes().into_boxed_slice());
    StaticResponse { body_len: bytes.len() as u64, head, body: Body::Bytes(bytes) }
}

impl StaticError {
    pub fn into_response(self) -> Vec<u8> {
        match self {
            StaticError::NotFound => branded_error(404, "the requested resource does not exist"),
            StaticError::Forbidden => branded_error(403, "access to this path is not permitted"),
            StaticError::Io(_) => branded_error(500, "could not read the requested file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthKind, RouteKind};
    use tempfile::tempdir;

    fn route(root: &Path) -> Route {
        Route {
            kind: RouteKind::Static,
            path_prefix: "/".to_string(),
            target_host: String::new(),
            target_port: 0,
            local_path: root.to_string_lossy().into_owned(),
            auth: AuthKind::None,
            charset: "utf-8".to_string(),
        }
    }

    /// Collapse a `StaticResponse` into one buffer for assertions, reading
    /// a file-backed body fully (tests only -- the real write path streams
    /// it via `sendfile`/mmap instead, see `connection.rs`).
    fn full_bytes(resp: StaticResponse) -> Vec<u8> {
        let mut out = resp.head;
        match resp.body {
            Body::Bytes(bytes) => out.extend_from_slice(&bytes),
            Body::File(mut file) => {
                file.read_to_end(&mut out).unwrap();
            }
        }
        out
    }

    #[test]
    fn resolves_file_under_root() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let r = route(dir.path());
        let resolved = resolve(&r, "/a.txt").unwrap();
        assert!(resolved.ends_with("a.txt"));
    }

    #[test]
    fn rejects_escape_via_symlink_like_traversal() {
        let dir = tempdir().unwrap();
        let r = route(dir.path());
        let err = resolve(&r, "/../../../etc/passwd");
        assert!(err.is_err());
    }

    #[test]
    fn serves_cached_bytes_on_second_read() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let cache = FileCache::new(1024, 4096);
        let r = route(dir.path());
        let full = resolve(&r, "/a.txt").unwrap();
        let first = full_bytes(serve(&cache, &full, "utf-8", dir.path()).unwrap());
        assert_eq!(cache.misses(), 1);
        let second = full_bytes(serve(&cache, &full, "utf-8", dir.path()).unwrap());
        assert_eq!(cache.hits(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn files_over_the_cache_bound_bypass_the_cache_and_stream_from_a_raw_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("big.bin"), vec![7u8; 64]).unwrap();
        let cache = FileCache::new(32, 4096); // max_file_size smaller than the file
        let r = route(dir.path());
        let full = resolve(&r, "/big.bin").unwrap();
        let resp = serve(&cache, &full, "utf-8", dir.path()).unwrap();
        assert_eq!(resp.body_len, 64);
        assert!(matches!(resp.body, Body::File(_)));
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.total_bytes(), 0, "oversized file must not be cached");
        let bytes = full_bytes(resp);
        assert!(bytes.ends_with(&[7u8; 64]));
    }

    #[test]
    fn directory_listing_includes_entries() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let page = full_bytes(directory_listing(dir.path(), "utf-8", false));
        let text = String::from_utf8(page).unwrap();
        assert!(text.contains("a.txt"));
        assert!(!text.contains("../"));
    }

    #[test]
    fn directory_listing_includes_parent_link_when_not_at_route_root() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let page = full_bytes(directory_listing(&dir.path().join("sub"), "utf-8", true));
        let text = String::from_utf8(page).unwrap();
        assert!(text.contains("href=\"../\""));
    }

    #[test]
    fn directory_with_index_html_serves_it_instead_of_a_listing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<html>home</html>").unwrap();
        fs::write(dir.path().join("other.txt"), b"x").unwrap();
        let cache = FileCache::new(1024, 4096);
        let response = full_bytes(serve(&cache, dir.path(), "utf-8", dir.path()).unwrap());
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("home"));
        assert!(!text.contains("other.txt"));
    }

    #[test]
    fn binary_content_type_carries_no_charset() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), [0u8, 1, 2, 3]).unwrap();
        let cache = FileCache::new(1024, 4096);
        let response = full_bytes(serve(&cache, &dir.path().join("a.bin"), "utf-8", dir.path()).unwrap());
        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("Content-Type: application/octet-stream\r\n"));
        assert!(!text.contains("charset"));
    }

    #[test]
    fn text_content_type_carries_the_route_charset() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let cache = FileCache::new(1024, 4096);
        let response = full_bytes(serve(&cache, &dir.path().join("a.txt"), "utf-8", dir.path()).unwrap());
        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
    }
}
