//! Route table behavior driven through a real parsed configuration file
//! (§4.5 versus §4.1), rather than hand-built `Route` values as the inline
//! unit tests in `src/route.rs` use.

use std::io::Write;

use xserver::config::{self, RouteKind};
use xserver::route;

fn write_config(body: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.conf");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    (dir, path)
}

#[test]
fn longest_prefix_route_wins_over_the_catch_all() {
    let (_dir, path) = write_config(
        "listen_port 8080\n\
         route static / ./public\n\
         route proxy /api 127.0.0.1:9000\n",
    );
    let cfg = config::load(&path).unwrap();
    let matched = route::lookup(&cfg.routes, "/api/v1/widgets").unwrap();
    assert_eq!(matched.kind, RouteKind::Proxy);
    assert_eq!(matched.target_port, 9000);
}

#[test]
fn unmatched_prefixes_fall_back_to_the_root_route() {
    let (_dir, path) = write_config(
        "listen_port 8080\n\
         route static / ./public\n\
         route proxy /api 127.0.0.1:9000\n",
    );
    let cfg = config::load(&path).unwrap();
    let matched = route::lookup(&cfg.routes, "/favicon.ico").unwrap();
    assert_eq!(matched.kind, RouteKind::Static);
    assert_eq!(matched.path_prefix, "/");
}

#[test]
fn oauth_route_carries_its_auth_mode_into_the_snapshot() {
    let (_dir, path) = write_config(
        "listen_port 8080\n\
         oauth_secret s3cr3t\n\
         route static / ./public\n\
         route static /private ./private oauth\n",
    );
    let cfg = config::load(&path).unwrap();
    let matched = route::lookup(&cfg.routes, "/private/doc.txt").unwrap();
    assert_eq!(matched.auth, xserver::config::AuthKind::OAuth);
}
