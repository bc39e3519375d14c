//! Worker entry point: owns one edge-triggered reactor (C6), the admission
//! tables, file cache, and config snapshot for one forked child process,
//! and wires the accept loop plus every connection's state machine (C7)
//! into that reactor.
//!
//! Grounded on `kill-ux-01-server`'s direct `mio` usage for the
//! register/reregister/deregister accept-and-serve shape, generalized to
//! this crate's own `Reactor`/`Registrar` abstraction (`src/reactor.rs`).

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use mio::{net::TcpListener, Interest, Token};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::{
    admission::{ConnectionTable, RateTable},
    buffer::BufferPool,
    cache::FileCache,
    config::ConfigSnapshot,
    connection::{AccessLogRecord, Connection, DispatchContext, StepResult},
    logging::{access_log_line, Logger},
    reactor::{Handler, HandlerRef, Reactor, ReactorAction, Registrar},
    shared::{SharedConfig, SharedStats},
};

const LISTENER_TOKEN: Token = Token(0);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Set by this worker's own SIGTERM/SIGINT handler; polled once per reactor
/// batch (§5 "On Master graceful stop, worker TERM triggers the same
/// [cancellation]"). Each worker process has its own copy of this static, so
/// it never observes the Master's or a sibling worker's signals.
static WORKER_RUNNING: AtomicBool = AtomicBool::new(true);
/// Set by this worker's own SIGHUP handler; polled on the same cadence to
/// pick up a reload the Master already published to shared memory.
static RELOAD_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_worker_term(_: libc::c_int) {
    WORKER_RUNNING.store(false, Ordering::SeqCst);
}

extern "C" fn on_worker_reload(_: libc::c_int) {
    RELOAD_PENDING.store(true, Ordering::SeqCst);
}

/// Install this worker's own signal disposition, replacing whatever it
/// inherited from Master across `fork` (§4.11, §5).
fn install_signal_handlers() {
    let term = SigAction::new(SigHandler::Handler(on_worker_term), SaFlags::empty(), SigSet::empty());
    let reload = SigAction::new(SigHandler::Handler(on_worker_reload), SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGTERM, &term);
        let _ = sigaction(Signal::SIGINT, &term);
        let _ = sigaction(Signal::SIGHUP, &reload);
    }
}

/// Collaborators shared by every connection handler in one worker process
/// (§5 "per worker: ... atomic counters updated from the reactor").
pub struct WorkerShared {
    pub config: RwLock<Arc<ConfigSnapshot>>,
    pub cache: FileCache,
    pub conn_table: ConnectionTable,
    pub rate_table: RateTable,
    pub access_log: Mutex<Logger>,
    pub stats: Arc<SharedStats>,
    pub worker_index: usize,
    pub pool: Mutex<BufferPool>,
    total_requests: AtomicU64,
    total_bytes_sent: AtomicU64,
    total_bytes_received: AtomicU64,
}

impl WorkerShared {
    fn record_completion(&self, client_ip: &str, record: &AccessLogRecord) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_sent.fetch_add(record.size as u64, Ordering::Relaxed);
        self.total_bytes_received.fetch_add(record.bytes_received as u64, Ordering::Relaxed);
        let line = access_log_line(client_ip, &record.method, &record.path, record.version, record.status, record.size, &record.user_agent);
        self.access_log.lock().write_line(&line).ok();
    }

    /// Push this worker's counters into the shared-stats region under its
    /// own slot (§4.10: "each worker updates its own slot").
    fn publish_stats(&self, active_connections: u32) {
        let pid = std::process::id() as i32;
        let idx = self.worker_index;
        self.stats.write_with(|s| {
            if idx >= s.workers.len() {
                return;
            }
            s.worker_count = s.worker_count.max(idx as u32 + 1);
            let slot = &mut s.workers[idx];
            slot.pid = pid;
            slot.total_requests = self.total_requests.load(Ordering::Relaxed);
            slot.total_bytes_sent = self.total_bytes_sent.load(Ordering::Relaxed);
            slot.total_bytes_received = self.total_bytes_received.load(Ordering::Relaxed);
            slot.active_connections = active_connections;
            slot.last_update_ts = crate::shared::now_unix();
            s.recompute_totals();
        });
    }
}

type ConnMap = Arc<Mutex<FxHashMap<usize, HandlerRef>>>;

fn client_ip(addr: SocketAddr) -> String {
    addr.ip().to_string()
}

/// Per-connection reactor handler (C7 wiring): owns the `Connection`
/// state machine and the bits it needs to reregister itself for writable
/// interest or tear itself down, from inside a readiness callback.
struct ConnectionHandler {
    conn: Connection,
    shared: Arc<WorkerShared>,
    token: Token,
    registrar: Registrar,
    connections: ConnMap,
    writable_registered: bool,
}

impl ConnectionHandler {
    fn ensure_writable(&mut self) {
        if !self.writable_registered && self.conn.has_pending_write() {
            if self.registrar.reregister(&mut self.conn.socket, self.token, Interest::READABLE | Interest::WRITABLE).is_ok() {
                self.writable_registered = true;
            }
        }
    }

    fn flush_log(&mut self) {
        if let Some(record) = self.conn.take_log() {
            self.shared.record_completion(&self.conn.client_ip, &record);
        }
    }

    fn finish(&mut self, token: Token) -> ReactorAction {
        self.flush_log();
        self.shared.conn_table.release(&self.conn.client_ip);
        let _ = self.registrar.deregister(&mut self.conn.socket, token);
        self.connections.lock().remove(&token.0);
        ReactorAction::Unregister
    }
}

impl Handler for ConnectionHandler {
    fn on_readable(&mut self, token: Token) -> ReactorAction {
        let config = self.shared.config.read().clone();
        let result = {
            let ctx = DispatchContext { config: config.as_ref(), cache: &self.shared.cache, pool: &self.shared.pool };
            self.conn.on_readable(&ctx)
        };
        self.flush_log();
        match result {
            Ok(StepResult::Continue) => {
                self.ensure_writable();
                ReactorAction::Continue
            }
            Ok(StepResult::Done) | Err(_) => self.finish(token),
        }
    }

    fn on_writable(&mut self, token: Token) -> ReactorAction {
        match self.conn.on_writable() {
            Ok(StepResult::Continue) => ReactorAction::Continue,
            Ok(StepResult::Done) | Err(_) => self.finish(token),
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.conn.is_idle_timed_out(now)
    }

    fn close_idle(&mut self, token: Token) -> ReactorAction {
        self.finish(token)
    }
}

/// Accept-loop handler, registered once at `LISTENER_TOKEN`.
struct ListenerHandler {
    listener: TcpListener,
    registrar: Registrar,
    shared: Arc<WorkerShared>,
    connections: ConnMap,
    keepalive_timeout: Duration,
}

impl Handler for ListenerHandler {
    fn on_readable(&mut self, _token: Token) -> ReactorAction {
        loop {
            let (mut stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return ReactorAction::Continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return ReactorAction::Continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let ip = client_ip(addr);
            // §4.4: a connection-limit rejection is a closed socket with no
            // response; a rate-limit rejection gets a 429 before closing.
            if self.shared.conn_table.acquire(&ip).is_err() {
                continue;
            }
            if self.shared.rate_table.check(&ip, Instant::now()).is_err() {
                self.shared.conn_table.release(&ip);
                use std::io::Write;
                let _ = stream.write_all(&crate::http::response::branded_error(429, "rate limit exceeded"));
                continue;
            }

            let token = self.registrar.next_token();
            if let Err(e) = self.registrar.register_raw(&mut stream, token, Interest::READABLE) {
                warn!(error = %e, "failed to register accepted connection");
                self.shared.conn_table.release(&ip);
                continue;
            }

            let conn = Connection::new(stream, ip, self.keepalive_timeout);
            let handler = ConnectionHandler {
                conn,
                shared: self.shared.clone(),
                token,
                registrar: self.registrar.clone(),
                connections: self.connections.clone(),
                writable_registered: false,
            };
            let handler_ref: HandlerRef = Arc::new(Mutex::new(handler));
            self.registrar.insert_handler(token, handler_ref.clone());
            self.connections.lock().insert(token.0, handler_ref);
        }
    }
}

/// Drives one worker process's reactor until `stop_handle` is flipped
/// (worker shutdown, §5 "Cancellation"). `listener` is the Master's
/// pre-bound, inherited listen socket (§5 "the listen socket is created
/// by Master and inherited by workers").
pub fn run(
    worker_index: usize,
    mut listener: TcpListener,
    config: Arc<ConfigSnapshot>,
    shared_config: Arc<SharedConfig>,
    stats: Arc<SharedStats>,
    log_dir: PathBuf,
) -> std::io::Result<()> {
    install_signal_handlers();

    let mut reactor = Reactor::new(config.event_loop_max_events, config.event_loop_batch_size, Some(Duration::from_millis(config.event_loop_timeout_ms.max(0) as u64)))?;
    let registrar = reactor.registrar()?;
    let running = reactor.stop_handle();

    let access_log = Logger::open(&log_dir, "access", config.log_daily)?;
    let shared = Arc::new(WorkerShared {
        config: RwLock::new(config.clone()),
        cache: FileCache::new(config.max_file_size, config.cache_budget_bytes),
        conn_table: ConnectionTable::new(config.max_connections_per_ip),
        rate_table: RateTable::new(config.max_requests_per_second, config.max_requests_burst),
        access_log: Mutex::new(access_log),
        stats,
        worker_index,
        pool: Mutex::new(BufferPool::new(crate::buffer::DEFAULT_BUF_SIZE)),
        total_requests: AtomicU64::new(0),
        total_bytes_sent: AtomicU64::new(0),
        total_bytes_received: AtomicU64::new(0),
    });

    let connections: ConnMap = Arc::new(Mutex::new(FxHashMap::default()));
    let keepalive_timeout = Duration::from_secs(config.keepalive_timeout_secs);

    registrar.register_raw(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    let listener_handler: HandlerRef = Arc::new(Mutex::new(ListenerHandler {
        listener,
        registrar: registrar.clone(),
        shared: shared.clone(),
        connections: connections.clone(),
        keepalive_timeout,
    }));
    registrar.insert_handler(LISTENER_TOKEN, listener_handler);

    let cleanup_interval = Duration::from_secs(config.cache_cleanup_interval_secs.max(1));
    let mut last_admission_sweep = Instant::now();
    let mut last_cache_sweep = Instant::now();
    let mut last_stats_publish = Instant::now();

    reactor.run(|| {
        if !WORKER_RUNNING.load(Ordering::SeqCst) {
            running.store(false, Ordering::SeqCst);
        }
        if RELOAD_PENDING.swap(false, Ordering::SeqCst) {
            let fresh = Arc::new(shared_config.read().to_snapshot());
            *shared.config.write() = fresh;
        }

        let now = Instant::now();
        if now.duration_since(last_admission_sweep) >= SWEEP_INTERVAL {
            shared.conn_table.sweep();
            shared.rate_table.sweep();
            sweep_idle_connections(&connections, now);
            last_admission_sweep = now;
        }
        if now.duration_since(last_cache_sweep) >= cleanup_interval {
            shared.cache.cleanup_idle();
            last_cache_sweep = now;
        }
        shared.access_log.lock().tick_flush(false);
        if now.duration_since(last_stats_publish) >= SWEEP_INTERVAL {
            shared.publish_stats(connections.lock().len() as u32);
            last_stats_publish = now;
        }
    })
}

/// Idle-timeout sweep (§4.7 "Timeout policy"): since every response forces
/// `Connection: close`, only connections still in ACCEPTED/READING can be
/// idle-timed-out; a connection mid-RESPONDING keeps running until its
/// write drains or errors, so `is_idle` returns `false` for those and this
/// sweep leaves them alone.
fn sweep_idle_connections(connections: &ConnMap, now: Instant) {
    let snapshot: Vec<(usize, HandlerRef)> = connections.lock().iter().map(|(k, v)| (*k, v.clone())).collect();
    for (token_raw, handler_ref) in snapshot {
        let idle = handler_ref.lock().is_idle(now);
        if idle {
            handler_ref.lock().close_idle(Token(token_raw));
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn placeholder_until_integration_tests_cover_worker_wiring() {
        // Covered end-to-end by tests/worker_tests.rs; unit tests here would
        // need a live mio reactor and accepted sockets, better exercised as
        // an integration test against a real TcpListener.
    }
}
