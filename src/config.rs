//! Configuration snapshot and the minimal textual-directive loader.
//!
//! `spec.md` treats the configuration parser as an external collaborator
//! and only fixes its directive surface and the `load`/`validate` contract
//! (see SPEC_FULL.md §A.3). The grammar below is deliberately thin:
//! `key value...` lines, `#` comments, and `route <kind> <prefix> <target>
//! [auth] [charset]` lines.

use std::{fmt, fs, path::Path, time::SystemTime};

pub const MAX_ROUTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Static,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    None,
    OAuth,
}

/// Immutable route descriptor. Never mutated after the snapshot that owns
/// it is published (§3).
#[derive(Debug, Clone)]
pub struct Route {
    pub kind: RouteKind,
    pub path_prefix: String,
    pub target_host: String,
    pub target_port: u16,
    pub local_path: String,
    pub auth: AuthKind,
    pub charset: String,
}

impl Route {
    fn parse(parts: &[&str]) -> Result<Self, String> {
        if parts.len() < 3 {
            return Err(format!("route directive needs at least kind, prefix, target: {parts:?}"));
        }
        let kind = match parts[0] {
            "static" => RouteKind::Static,
            "proxy" => RouteKind::Proxy,
            other => return Err(format!("unknown route kind '{other}'")),
        };
        let path_prefix = parts[1].to_string();
        let target = parts[2];
        let (target_host, target_port, local_path) = match kind {
            RouteKind::Proxy => {
                let (host, port) = target
                    .rsplit_once(':')
                    .ok_or_else(|| format!("proxy target '{target}' must be host:port"))?;
                let port: u16 = port.parse().map_err(|_| format!("invalid proxy port '{port}'"))?;
                (host.to_string(), port, String::new())
            }
            RouteKind::Static => (String::new(), 0, target.to_string()),
        };
        let auth = match parts.get(3).copied() {
            Some("oauth") => AuthKind::OAuth,
            Some("none") | None => AuthKind::None,
            Some(other) => return Err(format!("unknown auth mode '{other}'")),
        };
        let charset = parts.get(4).copied().unwrap_or("utf-8").to_string();
        Ok(Route {
            kind,
            path_prefix,
            target_host,
            target_port,
            local_path,
            auth,
            charset,
        })
    }
}

/// Versioned, atomically-replaceable configuration record (§3).
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub update_time: SystemTime,
    pub worker_processes: usize,
    pub listen_port: u16,
    pub keepalive_timeout_secs: u64,
    pub client_max_body_size: usize,
    pub header_buf_size: usize,
    pub event_loop_max_events: usize,
    pub event_loop_timeout_ms: i32,
    pub event_loop_batch_size: usize,
    pub max_connections_per_ip: u32,
    pub max_requests_per_second: u32,
    pub max_requests_burst: u32,
    pub max_file_size: u64,
    pub cache_budget_bytes: u64,
    pub cache_cleanup_interval_secs: u64,
    pub log_path: Option<String>,
    pub log_daily: bool,
    pub log_level: String,
    pub oauth_app_secret: String,
    pub oauth_allowed_urls: Vec<String>,
    pub routes: Vec<Route>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            version: 1,
            update_time: SystemTime::now(),
            worker_processes: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).clamp(1, 64),
            listen_port: 8080,
            keepalive_timeout_secs: 5,
            client_max_body_size: 10 * 1024 * 1024,
            header_buf_size: 8 * 1024,
            event_loop_max_events: 1024,
            event_loop_timeout_ms: 1000,
            event_loop_batch_size: 256,
            max_connections_per_ip: 128,
            max_requests_per_second: 50,
            max_requests_burst: 20,
            max_file_size: 50 * 1024 * 1024,
            cache_budget_bytes: 100 * 1024 * 1024,
            cache_cleanup_interval_secs: 60,
            log_path: None,
            log_daily: false,
            log_level: "info".to_string(),
            oauth_app_secret: String::new(),
            oauth_allowed_urls: Vec::new(),
            routes: vec![Route {
                kind: RouteKind::Static,
                path_prefix: "/".to_string(),
                target_host: String::new(),
                target_port: 0,
                local_path: "./public".to_string(),
                auth: AuthKind::None,
                charset: "utf-8".to_string(),
            }],
        }
    }
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ConfigError {}

/// Parse the directive file named by `path` into a `ConfigSnapshot`.
pub fn load(path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError(format!("reading {}: {e}", path.display())))?;
    let mut cfg = ConfigSnapshot::default();
    cfg.routes.clear();

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let (directive, rest) = parts.split_first().unwrap();
        apply_directive(&mut cfg, directive, rest)
            .map_err(|e| ConfigError(format!("{}:{}: {}", path.display(), lineno + 1, e)))?;
    }

    if cfg.routes.is_empty() {
        cfg.routes.push(Route {
            kind: RouteKind::Static,
            path_prefix: "/".to_string(),
            target_host: String::new(),
            target_port: 0,
            local_path: "./public".to_string(),
            auth: AuthKind::None,
            charset: "utf-8".to_string(),
        });
    }
    cfg.update_time = SystemTime::now();
    validate(&cfg).map_err(|errs| ConfigError(errs.join("; ")))?;
    Ok(cfg)
}

fn apply_directive(cfg: &mut ConfigSnapshot, directive: &str, rest: &[&str]) -> Result<(), String> {
    match directive {
        "worker_processes" => {
            let v = rest.first().copied().unwrap_or("auto");
            cfg.worker_processes = if v == "auto" {
                std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
            } else {
                v.parse().map_err(|_| format!("invalid worker_processes '{v}'"))?
            }
            .clamp(1, 64);
        }
        "listen_port" => cfg.listen_port = rest.first().ok_or("missing port")?.parse().map_err(|_| "invalid port")?,
        "keepalive_timeout" => cfg.keepalive_timeout_secs = parse_first(rest)?,
        "client_max_body_size" => cfg.client_max_body_size = parse_first(rest)?,
        "max_connections_per_ip" => cfg.max_connections_per_ip = parse_first(rest)?,
        "max_requests_per_second" => cfg.max_requests_per_second = parse_first(rest)?,
        "max_requests_burst" => cfg.max_requests_burst = parse_first(rest)?,
        "max_file_size" => cfg.max_file_size = parse_first(rest)?,
        "cache_budget_bytes" => cfg.cache_budget_bytes = parse_first(rest)?,
        "cache_cleanup_interval" => cfg.cache_cleanup_interval_secs = parse_first(rest)?,
        "event_loop_max_events" => cfg.event_loop_max_events = parse_first(rest)?,
        "event_loop_timeout" => cfg.event_loop_timeout_ms = parse_first(rest)?,
        "event_loop_batch_size" => cfg.event_loop_batch_size = parse_first(rest)?,
        "log_path" => cfg.log_path = rest.first().map(|s| s.to_string()),
        "log_daily" => cfg.log_daily = rest.first().copied() == Some("on"),
        "log_level" => cfg.log_level = rest.first().copied().unwrap_or("info").to_string(),
        "oauth_secret" => cfg.oauth_app_secret = rest.first().ok_or("missing oauth_secret value")?.to_string(),
        "oauth_allowed_url" => cfg.oauth_allowed_urls.push(rest.first().ok_or("missing oauth_allowed_url value")?.to_string()),
        "route" => {
            if cfg.routes.len() >= MAX_ROUTES {
                return Err("too many routes (spec caps the route array size)".to_string());
            }
            cfg.routes.push(Route::parse(rest)?);
        }
        // worker_connections, worker_rlimit_nofile, tcp_nodelay|tcp_nopush, buffer sizes,
        // proxy_{connect,send,read} timeouts, use_thread_pool, thread_pool_*: accepted and
        // ignored here, their contracts live with the external config collaborator per §6.
        _ => {}
    }
    Ok(())
}

fn parse_first<T: std::str::FromStr>(rest: &[&str]) -> Result<T, String> {
    rest.first()
        .ok_or_else(|| "missing value".to_string())?
        .parse()
        .map_err(|_| "invalid numeric value".to_string())
}

/// Validate invariants the spec requires of a snapshot before it is published.
pub fn validate(cfg: &ConfigSnapshot) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    if cfg.routes.is_empty() {
        errors.push("at least one route is required".to_string());
    }
    if cfg.routes.len() > MAX_ROUTES {
        errors.push(format!("route count {} exceeds MAX_ROUTES {}", cfg.routes.len(), MAX_ROUTES));
    }
    if !cfg.routes.iter().any(|r| r.path_prefix == "/") {
        errors.push("a route with path_prefix '/' is required".to_string());
    }
    for r in &cfg.routes {
        if r.path_prefix.len() > 256 {
            errors.push(format!("path_prefix '{}' exceeds 256 bytes", r.path_prefix));
        }
        if r.kind == RouteKind::Proxy && r.target_host.is_empty() {
            errors.push("proxy route missing target_host".to_string());
        }
        if r.auth == AuthKind::OAuth && cfg.oauth_app_secret.is_empty() {
            errors.push(format!("route '{}' requires auth=oauth but oauth_secret is not set", r.path_prefix));
        }
    }
    if cfg.worker_processes == 0 || cfg.worker_processes > 64 {
        errors.push("worker_processes must be in [1, 64]".to_string());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
