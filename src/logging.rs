//! Logging ambient stack (SPEC_FULL §A.1): a `tracing` subscriber for
//! operator-facing diagnostics plus a separate access-log sink whose line
//! format is fixed by spec.md §6 and therefore does not go through
//! `tracing` at all.
//!
//! Grounded on the workspace-wide `tracing`/`tracing-subscriber` dependency
//! already carried by the teacher's `server` and `web` crates; the daily
//! rotation and bounded-lag contract (idle flush <= 5s, periodic flush
//! <= 30s, §9) are implemented directly since no crate in the retrieved
//! pack wraps that exact two-file, mode-0640 contract.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing_subscriber::EnvFilter;

/// Install the operator-log subscriber. Called once per process (Master
/// before fork for its own diagnostics, and again by each worker after
/// fork, since workers do not inherit the Master's in-process logger
/// state, §9).
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

fn daily_suffix(now: SystemTime) -> String {
    let secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let days = secs / 86_400;
    // Proleptic Gregorian civil-from-days, avoiding a chrono dependency for
    // a single filename suffix.
    let z = days as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as i64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{y:04}-{m:02}-{d:02}")
}

/// A single-writer, optionally daily-rotating append sink, shared by the
/// access log and (when `log_path` is set) the operator log's file writer.
/// "Single-writer" here means one `Logger` instance lives per worker
/// process; the process-wide ordering guarantee comes from each worker
/// owning its own file handle rather than sharing one across processes.
pub struct Logger {
    dir: PathBuf,
    stem: &'static str,
    daily: bool,
    file: Option<File>,
    current_suffix: String,
    last_flush: SystemTime,
}

impl Logger {
    pub fn open(dir: &Path, stem: &'static str, daily: bool) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let suffix = if daily { daily_suffix(SystemTime::now()) } else { String::new() };
        let mut logger = Self { dir: dir.to_path_buf(), stem, daily, file: None, current_suffix: suffix, last_flush: SystemTime::now() };
        logger.reopen()?;
        Ok(logger)
    }

    fn path_for(&self) -> PathBuf {
        if self.daily {
            self.dir.join(format!("{}.{}.log", self.stem, self.current_suffix))
        } else {
            self.dir.join(format!("{}.log", self.stem))
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).mode(0o640).open(self.path_for())?;
        self.file = Some(file);
        Ok(())
    }

    /// Append one already-terminated line, rotating the backing file first
    /// if the calendar day has changed since the last write.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        if self.daily {
            let suffix = daily_suffix(SystemTime::now());
            if suffix != self.current_suffix {
                self.current_suffix = suffix;
                self.reopen()?;
            }
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Flush according to the bounded-lag contract: idle flush <= 5s,
    /// periodic flush <= 30s (§9). Called on the worker's reactor tick, not
    /// from a dedicated thread.
    pub fn tick_flush(&mut self, force: bool) {
        let elapsed = SystemTime::now().duration_since(self.last_flush).unwrap_or(Duration::ZERO);
        if force || elapsed >= Duration::from_secs(5) {
            if let Some(file) = self.file.as_mut() {
                let _ = file.flush();
            }
            self.last_flush = SystemTime::now();
        }
    }
}

/// Assemble one access-log line in the exact format §6 specifies:
/// `ip - - [ts] "METHOD PATH HTTP/1.1" status size "-" "user-agent"` with
/// microsecond-precision timestamp.
pub fn access_log_line(ip: &str, method: &str, path: &str, version: &str, status: u16, size: usize, user_agent: &str) -> String {
    let now = SystemTime::now();
    let dur = now.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let ts = httpdate::fmt_http_date(now);
    let micros = dur.subsec_micros();
    format!(
        "{ip} - - [{ts} .{micros:06}] \"{method} {path} {version}\" {status} {size} \"-\" \"{user_agent}\""
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_log_line_matches_fixed_format() {
        let line = access_log_line("127.0.0.1", "GET", "/hello.txt", "HTTP/1.1", 200, 3, "curl/8.0");
        assert!(line.starts_with("127.0.0.1 - - ["));
        assert!(line.contains("\"GET /hello.txt HTTP/1.1\" 200 3 \"-\" \"curl/8.0\""));
    }

    #[test]
    fn daily_suffix_is_well_formed() {
        let suffix = daily_suffix(SystemTime::now());
        assert_eq!(suffix.len(), 10);
        assert_eq!(suffix.as_bytes()[4], b'-');
        assert_eq!(suffix.as_bytes()[7], b'-');
    }

    #[test]
    fn writes_and_rotates_under_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::open(dir.path(), "access", false).unwrap();
        logger.write_line("hello").unwrap();
        logger.tick_flush(true);
        let path = dir.path().join("access.log");
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents, "hello\n");
    }
}
