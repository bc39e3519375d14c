//! nginx-style HTTP/1.1 gateway: static file delivery and reverse proxying
//! behind a Master/Worker multi-process model (see the crate-level modules
//! for each component; `src/main.rs` wires the CLI surface on top).

pub mod admission;
pub mod auth;
pub mod buffer;
pub mod cache;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod logging;
pub mod master;
pub mod proxy;
pub mod reactor;
pub mod route;
pub mod shared;
pub mod static_handler;
pub mod worker;
