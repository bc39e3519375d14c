//! Longest-prefix-match route table (§4.5). Reads are lock-free: the table
//! is an immutable slice borrowed from the current `ConfigSnapshot`, valid
//! for the lifetime of that snapshot.

use crate::config::Route;

/// `lookup(path) -> route | none`: returns the route whose `path_prefix` is
/// a prefix of `path` with maximum length; ties resolve to configuration
/// order (first wins).
pub fn lookup<'a>(routes: &'a [Route], path: &str) -> Option<&'a Route> {
    let mut best: Option<&Route> = None;
    for route in routes {
        if path.starts_with(route.path_prefix.as_str()) {
            match best {
                Some(b) if b.path_prefix.len() >= route.path_prefix.len() => {}
                _ => best = Some(route),
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthKind, RouteKind};

    fn route(prefix: &str, kind: RouteKind) -> Route {
        Route {
            kind,
            path_prefix: prefix.to_string(),
            target_host: "127.0.0.1".to_string(),
            target_port: 9000,
            local_path: "./public".to_string(),
            auth: AuthKind::None,
            charset: "utf-8".to_string(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let routes = vec![route("/", RouteKind::Static), route("/api", RouteKind::Proxy)];
        let r = lookup(&routes, "/api/v1").unwrap();
        assert_eq!(r.path_prefix, "/api");
        assert_eq!(r.kind, RouteKind::Proxy);
    }

    #[test]
    fn root_is_fallback() {
        let routes = vec![route("/", RouteKind::Static), route("/api", RouteKind::Proxy)];
        let r = lookup(&routes, "/hello.txt").unwrap();
        assert_eq!(r.path_prefix, "/");
    }

    #[test]
    fn first_wins_on_tie() {
        let routes = vec![route("/a", RouteKind::Static), route("/a", RouteKind::Proxy)];
        let r = lookup(&routes, "/a/x").unwrap();
        assert_eq!(r.kind, RouteKind::Static);
    }

    #[test]
    fn no_match_returns_none() {
        let routes = vec![route("/api", RouteKind::Proxy)];
        assert!(lookup(&routes, "/other").is_none());
    }
}
