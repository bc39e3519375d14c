//! OAuth/HMAC authentication collaborator (§6). Only the interface and the
//! required fields are specified by `spec.md`; the algorithm itself
//! (`MD5(app_key || app_secret || time || random)`, 300s skew cap,
//! constant-time comparison, `*`-suffix allowed-URL matching) is fixed by
//! §6 and implemented here directly since no crate in the retrieved pack
//! computes MD5 for this kind of legacy HMAC-over-MD5 scheme.

use md5::{Digest, Md5};

use crate::http::ParsedRequest;

const TIMESTAMP_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub app_secret: String,
    pub allowed_urls: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingHeader(&'static str),
    InvalidTimestamp,
    TimestampSkew,
    TokenMismatch,
    UrlNotAllowed,
}

pub fn authenticate(req: &ParsedRequest, cfg: &OAuthConfig, now_unix: i64) -> Result<(), AuthError> {
    let app_key = req.header("oauth-app-key").ok_or(AuthError::MissingHeader("oauth-app-key"))?;
    let token = req.header("oauth-token").ok_or(AuthError::MissingHeader("oauth-token"))?;
    let time = req.header("oauth-time").ok_or(AuthError::MissingHeader("oauth-time"))?;
    let random = req.header("oauth-random").ok_or(AuthError::MissingHeader("oauth-random"))?;

    let ts: i64 = time.parse().map_err(|_| AuthError::InvalidTimestamp)?;
    if (now_unix - ts).abs() > TIMESTAMP_SKEW_SECS {
        return Err(AuthError::TimestampSkew);
    }

    if !url_allowed(&req.path, &cfg.allowed_urls) {
        return Err(AuthError::UrlNotAllowed);
    }

    let expected = compute_token(app_key, &cfg.app_secret, time, random);
    if !constant_time_eq(expected.as_bytes(), token.as_bytes()) {
        return Err(AuthError::TokenMismatch);
    }
    Ok(())
}

fn compute_token(app_key: &str, app_secret: &str, time: &str, random: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(app_key.as_bytes());
    hasher.update(app_secret.as_bytes());
    hasher.update(time.as_bytes());
    hasher.update(random.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// `*` alone matches anything; a trailing `*` matches any suffix continuation
/// of the literal prefix; anything else must match exactly.
fn url_allowed(path: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|pattern| {
        if pattern == "*" {
            true
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            path.starts_with(prefix)
        } else {
            path == pattern
        }
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
