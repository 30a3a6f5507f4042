//! # StrandKV Sync Client
//!
//! Small, blocking client for the StrandKV text protocol, used by the
//! server's integration tests and handy for poking at a running server.

mod client;

pub use client::{CacheClient, ClientConfig, ClientError, ClientResult};
