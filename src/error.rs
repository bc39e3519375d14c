//! Crate-wide error type. Component-local errors (`ParseError`, `ProxyError`,
//! ...) stay local to their module and convert into this one only at a
//! process-level boundary (`main`, the Master's own operations).

use std::{fmt, io};

pub type Result<T> = std::result::Result<T, GatewayError>;

pub enum GatewayError {
    Io(io::Error),
    Config(String),
    AlreadyRunning(u16),
    NotRunning(u16),
}

impl fmt::Debug for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::AlreadyRunning(port) => write!(f, "another x-server instance already bound to port {port}"),
            Self::NotRunning(port) => write!(f, "no x-server master found for port {port}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<io::Error> for GatewayError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
