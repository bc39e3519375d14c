//! Master supervisor (C11, §4.11): pre-start interlock, worker spawning,
//! health monitoring with a bounded respawn cap, signal-driven reload, and
//! graceful/forced shutdown.
//!
//! Grounded on `sozu`'s `start_workers`/`fork_main_into_worker`
//! (`examples/other_examples/b5514a90_kianmeng-sozu__bin-src-worker.rs.rs`)
//! for the fork-and-mark-child-with-an-env-var shape, and on
//! `HFQR-xitca-web/server/src/worker/{shutdown,counter}.rs` for the
//! graceful-shutdown polling cadence, generalized from an async task
//! counter to a table of live child pids.

use std::{
    fs::{File, OpenOptions},
    io::Write as _,
    net::TcpListener as StdTcpListener,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use nix::{
    fcntl::{flock, FlockArg},
    sys::{
        signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};
use tracing::{error, info, warn};

use crate::{
    config::{self, ConfigSnapshot},
    error::{GatewayError, Result},
    shared::{SharedConfig, SharedConfigData, SharedRegion, SharedStats, SharedStatsData},
    worker,
};

const RESPAWN_WINDOW: Duration = Duration::from_secs(60);
const RESPAWN_CAP: u32 = 5;
const GRACE_FAST_POLL: Duration = Duration::from_millis(100);
const GRACE_FAST_POLL_UNTIL: Duration = Duration::from_secs(2);
const GRACE_SLOW_POLL: Duration = Duration::from_millis(500);
const GRACE_TOTAL: Duration = Duration::from_secs(10);
const FORCE_REAP_BUDGET: Duration = Duration::from_secs(2);

static RELOAD_FLAG: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
static FORCE_FLAG: AtomicBool = AtomicBool::new(false);
static CHLD_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn on_hup(_: libc::c_int) {
    RELOAD_FLAG.store(true, Ordering::SeqCst);
}
extern "C" fn on_term(_: libc::c_int) {
    SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
}
extern "C" fn on_quit(_: libc::c_int) {
    FORCE_FLAG.store(true, Ordering::SeqCst);
}
extern "C" fn on_chld(_: libc::c_int) {
    CHLD_FLAG.store(true, Ordering::SeqCst);
}

/// Handlers set a flag only and return immediately (§4.11: "Handlers set
/// `sig_atomic_t` flags only").
fn install_signal_handlers() {
    let hup = SigAction::new(SigHandler::Handler(on_hup), SaFlags::empty(), SigSet::empty());
    let term = SigAction::new(SigHandler::Handler(on_term), SaFlags::empty(), SigSet::empty());
    let quit = SigAction::new(SigHandler::Handler(on_quit), SaFlags::empty(), SigSet::empty());
    let chld = SigAction::new(SigHandler::Handler(on_chld), SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGHUP, &hup);
        let _ = sigaction(Signal::SIGTERM, &term);
        let _ = sigaction(Signal::SIGINT, &term);
        let _ = sigaction(Signal::SIGQUIT, &quit);
        let _ = sigaction(Signal::SIGCHLD, &chld);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Stopping,
}

/// Master-side bookkeeping for one worker slot (§3 "Worker descriptor").
/// Unlike the spec's singly linked list, slots live in a plain `Vec`
/// indexed by worker index -- the Master never needs to find a slot by
/// anything other than that index or its current pid.
struct Slot {
    pid: Option<Pid>,
    start_ts: Instant,
    respawn_count: u32,
}

/// Holds the PID file open for the Master's lifetime; the advisory lock is
/// released (and the file may be removed) only when this is dropped.
struct PidLock {
    file: File,
    path: PathBuf,
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn pid_file_path(port: u16) -> PathBuf {
    PathBuf::from("logs").join(format!("x-server.{port}.pid"))
}

/// Acquire the exclusive advisory lock backing the pre-start interlock
/// (§4.11, §6 "Persisted state"). Held for the Master's entire lifetime.
fn acquire_pid_lock(port: u16) -> Result<PidLock> {
    let path = pid_file_path(port);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new().create(true).write(true).truncate(false).open(&path)?;
    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|_| GatewayError::AlreadyRunning(port))?;
    Ok(PidLock { file, path })
}

fn write_pid_file(lock: &mut PidLock, pid: u32) -> Result<()> {
    use std::io::{Seek, SeekFrom};
    lock.file.set_len(0)?;
    lock.file.seek(SeekFrom::Start(0))?;
    writeln!(lock.file, "{pid}")?;
    lock.file.flush()?;
    Ok(())
}

/// Double-fork plus `setsid` so the Master detaches from its controlling
/// terminal and cannot reacquire one (§6 "-f ... default: daemonize").
/// Only the final grandchild returns; the original process and the
/// intermediate session leader both `_exit(0)` immediately.
fn daemonize() -> Result<()> {
    match unsafe { fork() }.map_err(|e| GatewayError::Config(format!("fork failed: {e}")))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    nix::unistd::setsid().map_err(|e| GatewayError::Config(format!("setsid failed: {e}")))?;
    match unsafe { fork() }.map_err(|e| GatewayError::Config(format!("fork failed: {e}")))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    let _ = std::env::set_current_dir("/");
    Ok(())
}

/// Bind the single listen socket before fork so every worker inherits the
/// same listening descriptor (§5 "the listen socket is created by Master
/// and inherited by workers").
fn bind_listener(port: u16) -> Result<StdTcpListener> {
    let listener = StdTcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn log_dir(config: &ConfigSnapshot) -> PathBuf {
    config.log_path.as_ref().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("logs"))
}

/// Fork one worker. The child never returns to Master code: it installs
/// `WORKER_PROCESS_ID`, runs the worker event loop, and calls
/// `std::process::exit` directly (§4.11 "must `_exit` ... if it would reach
/// Master code").
fn spawn_worker(
    index: usize,
    listener: &StdTcpListener,
    config: &Arc<ConfigSnapshot>,
    shared_config: &Arc<SharedConfig>,
    stats: &Arc<SharedStats>,
    log_dir: &Path,
) -> Result<Pid> {
    let listener = listener.try_clone()?;
    let config = config.clone();
    let shared_config = shared_config.clone();
    let stats = stats.clone();
    let log_dir = log_dir.to_path_buf();

    match unsafe { fork() }.map_err(|e| GatewayError::Config(format!("fork failed: {e}")))? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            std::env::set_var("WORKER_PROCESS_ID", index.to_string());
            crate::logging::init_tracing(&config.log_level);
            let mio_listener = mio::net::TcpListener::from_std(listener);
            let code = match worker::run(index, mio_listener, config, shared_config, stats, log_dir) {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, worker = index, "worker exited with an error");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

fn spawn_all(
    count: usize,
    listener: &StdTcpListener,
    config: &Arc<ConfigSnapshot>,
    shared_config: &Arc<SharedConfig>,
    stats: &Arc<SharedStats>,
    log_dir: &Path,
) -> Result<Vec<Slot>> {
    let mut slots = Vec::with_capacity(count);
    for index in 0..count {
        let pid = spawn_worker(index, listener, config, shared_config, stats, log_dir)?;
        slots.push(Slot { pid: Some(pid), start_ts: Instant::now(), respawn_count: 0 });
    }
    info!(workers = count, "spawned worker pool");
    Ok(slots)
}

/// Non-blocking reap loop for SIGCHLD (§4.11 "Monitor"): reap every exited
/// child, then respawn its slot subject to the 5-within-60s cap.
fn reap_and_respawn(
    slots: &mut [Slot],
    state: RunState,
    listener: &StdTcpListener,
    config: &Arc<ConfigSnapshot>,
    shared_config: &Arc<SharedConfig>,
    stats: &Arc<SharedStats>,
    log_dir: &Path,
) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                let Some(index) = slots.iter().position(|s| s.pid == Some(pid)) else { continue };
                warn!(worker = index, pid = pid.as_raw(), "worker exited");
                slots[index].pid = None;

                if state != RunState::Running {
                    continue;
                }

                let elapsed = slots[index].start_ts.elapsed();
                if elapsed < RESPAWN_WINDOW {
                    slots[index].respawn_count += 1;
                } else {
                    slots[index].respawn_count = 1;
                }

                if slots[index].respawn_count >= RESPAWN_CAP {
                    error!(worker = index, "exceeded respawn cap, not restarting this slot");
                    continue;
                }

                match spawn_worker(index, listener, config, shared_config, stats, log_dir) {
                    Ok(pid) => {
                        slots[index].pid = Some(pid);
                        slots[index].start_ts = Instant::now();
                        info!(worker = index, pid = pid.as_raw(), "respawned worker");
                    }
                    Err(e) => error!(worker = index, error = %e, "failed to respawn worker"),
                }
            }
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            _ => continue,
        }
    }
}

fn live_pids(slots: &[Slot]) -> Vec<Pid> {
    slots.iter().filter_map(|s| s.pid).collect()
}

fn signal_all(pids: &[Pid], signal: Signal) {
    for pid in pids {
        let _ = kill(*pid, signal);
    }
}

/// Graceful stop (§4.11): TERM every worker, then poll at 100 ms for the
/// first 2 s and 500 ms after that, escalating to force-stop if any worker
/// is still alive at 10 s.
fn graceful_shutdown(slots: &mut [Slot]) {
    signal_all(&live_pids(slots), Signal::SIGTERM);
    let start = Instant::now();
    let mut last_log = start;
    loop {
        reap_exited(slots);
        if live_pids(slots).is_empty() {
            info!("all workers exited gracefully");
            return;
        }
        let elapsed = start.elapsed();
        if elapsed >= GRACE_TOTAL {
            warn!("graceful shutdown timed out, escalating to force stop");
            force_shutdown(slots);
            return;
        }
        if last_log.elapsed() >= Duration::from_secs(2) {
            info!(remaining = live_pids(slots).len(), elapsed_ms = elapsed.as_millis() as u64, "graceful shutdown in progress");
            last_log = Instant::now();
        }
        std::thread::sleep(if elapsed < GRACE_FAST_POLL_UNTIL { GRACE_FAST_POLL } else { GRACE_SLOW_POLL });
    }
}

/// Force stop (§4.11): KILL every live worker, wait up to 2 s reaping.
fn force_shutdown(slots: &mut [Slot]) {
    signal_all(&live_pids(slots), Signal::SIGKILL);
    let start = Instant::now();
    while start.elapsed() < FORCE_REAP_BUDGET {
        reap_exited(slots);
        if live_pids(slots).is_empty() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn reap_exited(slots: &mut [Slot]) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                if let Some(slot) = slots.iter_mut().find(|s| s.pid == Some(pid)) {
                    slot.pid = None;
                }
            }
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            _ => continue,
        }
    }
}

/// Reload (§4.11 HUP): reparse the config file; on failure stay RUNNING and
/// keep the old snapshot. On success, publish a new versioned snapshot to
/// shared memory and send HUP to every worker so each re-reads it at its
/// own next safe point.
fn reload(config_path: &Path, port_override: Option<u16>, current: &Arc<ConfigSnapshot>, shared_config: &SharedConfig, slots: &[Slot]) -> Arc<ConfigSnapshot> {
    match config::load(config_path) {
        Ok(mut new_cfg) => {
            if let Some(p) = port_override {
                new_cfg.listen_port = p;
            }
            new_cfg.version = current.version + 1;
            shared_config.write_with(|d| *d = SharedConfigData::from_snapshot(&new_cfg));
            signal_all(&live_pids(slots), Signal::SIGHUP);
            info!(version = new_cfg.version, "configuration reloaded");
            Arc::new(new_cfg)
        }
        Err(e) => {
            error!(error = %e, "reload failed, keeping the running configuration");
            current.clone()
        }
    }
}

/// Entry point called by `main` when `WORKER_PROCESS_ID` is unset: run as
/// Master for the lifetime of the process.
pub fn run(config_path: PathBuf, port_override: Option<u16>, foreground: bool) -> Result<()> {
    let mut config = config::load(&config_path).map_err(|e| GatewayError::Config(e.to_string()))?;
    if let Some(p) = port_override {
        config.listen_port = p;
    }

    crate::logging::init_tracing(&config.log_level);

    let listener = bind_listener(config.listen_port)?;

    if !foreground {
        daemonize()?;
    }

    let mut pid_lock = acquire_pid_lock(config.listen_port)?;
    write_pid_file(&mut pid_lock, std::process::id())?;

    install_signal_handlers();

    let shared_config: Arc<SharedConfig> = Arc::new(SharedRegion::create()?);
    shared_config.write_with(|d| *d = SharedConfigData::from_snapshot(&config));

    let shared_stats: Arc<SharedStats> = Arc::new(SharedRegion::create()?);
    shared_stats.write_with(|s: &mut SharedStatsData| s.start_time = crate::shared::now_unix());

    let worker_count = config.worker_processes;
    let log_dir = log_dir(&config);
    let mut config = Arc::new(config);

    let mut slots = spawn_all(worker_count, &listener, &config, &shared_config, &shared_stats, &log_dir)?;

    let mut state = RunState::Running;
    info!(port = config.listen_port, workers = worker_count, "master ready");

    loop {
        if SHUTDOWN_FLAG.swap(false, Ordering::SeqCst) && state != RunState::Stopping {
            state = RunState::Stopping;
            info!("graceful shutdown requested");
            graceful_shutdown(&mut slots);
            break;
        }
        if FORCE_FLAG.swap(false, Ordering::SeqCst) {
            state = RunState::Stopping;
            info!("forced shutdown requested");
            force_shutdown(&mut slots);
            break;
        }
        if RELOAD_FLAG.swap(false, Ordering::SeqCst) {
            config = reload(&config_path, port_override, &config, &shared_config, &slots);
        }
        if CHLD_FLAG.swap(false, Ordering::SeqCst) {
            reap_and_respawn(&mut slots, state, &listener, &config, &shared_config, &shared_stats, &log_dir);
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    drop(pid_lock);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_path_is_scoped_by_port() {
        assert_eq!(pid_file_path(8080), PathBuf::from("logs/x-server.8080.pid"));
        assert_ne!(pid_file_path(8080), pid_file_path(9090));
    }

    #[test]
    fn log_dir_falls_back_to_logs() {
        let mut cfg = ConfigSnapshot::default();
        cfg.log_path = None;
        assert_eq!(log_dir(&cfg), PathBuf::from("logs"));
        cfg.log_path = Some("/var/log/x-server".to_string());
        assert_eq!(log_dir(&cfg), PathBuf::from("/var/log/x-server"));
    }
}
