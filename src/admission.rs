//! Per-IP admission control (C4, §4.4): a concurrent-connection table and a
//! token-bucket rate table, each serialized per bucket.
//!
//! Generalized from the keyed-state shape of
//! `HFQR-xitca-web/http-rate/src/state/keyed/hashmap.rs` (a hash map of
//! per-key limiter state behind a lock) to the spec's explicit
//! window-counter-plus-burst-token formulation, since §4.4 fixes the exact
//! reset/decay rule rather than leaving it to a GCRA derivation.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

const CONN_IDLE_EVICT: Duration = Duration::from_secs(60);
const RATE_IDLE_EVICT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    ConnectionLimitExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateError {
    RateLimited,
}

struct ConnRecord {
    active_connections: u32,
    last_activity: Instant,
}

/// Concurrent-connection table (§4.4 first bullet).
pub struct ConnectionTable {
    max_per_ip: u32,
    rows: Mutex<FxHashMap<String, ConnRecord>>,
}

impl ConnectionTable {
    pub fn new(max_per_ip: u32) -> Self {
        Self { max_per_ip, rows: Mutex::new(FxHashMap::default()) }
    }

    pub fn acquire(&self, ip: &str) -> Result<(), AdmissionError> {
        let mut rows = self.rows.lock();
        let now = Instant::now();
        let row = rows.entry(ip.to_string()).or_insert(ConnRecord { active_connections: 0, last_activity: now });
        if row.active_connections >= self.max_per_ip {
            return Err(AdmissionError::ConnectionLimitExceeded);
        }
        row.active_connections += 1;
        row.last_activity = now;
        Ok(())
    }

    pub fn release(&self, ip: &str) {
        let mut rows = self.rows.lock();
        if let Some(row) = rows.get_mut(ip) {
            row.active_connections = row.active_connections.saturating_sub(1);
            row.last_activity = Instant::now();
        }
    }

    /// Background sweep (§4.4): remove rows with zero active and idle >= 60s.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.rows.lock().retain(|_, row| row.active_connections > 0 || now.duration_since(row.last_activity) < CONN_IDLE_EVICT);
    }

    pub fn active_count(&self, ip: &str) -> u32 {
        self.rows.lock().get(ip).map(|r| r.active_connections).unwrap_or(0)
    }
}

struct RateRecord {
    request_count_in_window: u32,
    window_start: Instant,
    burst_count: u32,
    last_activity: Instant,
}

/// Token-bucket rate table (§4.4 second bullet).
pub struct RateTable {
    max_per_sec: u32,
    max_burst: u32,
    rows: Mutex<FxHashMap<String, RateRecord>>,
}

impl RateTable {
    pub fn new(max_per_sec: u32, max_burst: u32) -> Self {
        Self { max_per_sec, max_burst, rows: Mutex::new(FxHashMap::default()) }
    }

    /// Admit or reject one request from `ip` at `now`.
    pub fn check(&self, ip: &str, now: Instant) -> Result<(), RateError> {
        let mut rows = self.rows.lock();
        let row = rows.entry(ip.to_string()).or_insert(RateRecord {
            request_count_in_window: 0,
            window_start: now,
            burst_count: 0,
            last_activity: now,
        });

        if now.duration_since(row.window_start) >= Duration::from_secs(1) {
            let idle_secs = now.duration_since(row.last_activity).as_secs() as u32;
            row.burst_count = row.burst_count.saturating_sub(idle_secs);
            row.request_count_in_window = 0;
            row.window_start = now;
        }

        row.last_activity = now;

        if row.request_count_in_window < self.max_per_sec {
            row.request_count_in_window += 1;
            return Ok(());
        }
        if row.burst_count < self.max_burst {
            row.burst_count += 1;
            return Ok(());
        }
        Err(RateError::RateLimited)
    }

    /// Background sweep (§4.4): evict rows idle >= 300s.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.rows.lock().retain(|_, row| now.duration_since(row.last_activity) < RATE_IDLE_EVICT);
    }
}
