//! # StrandKV Server
//!
//! Coroutine-based TCP front end for the cache: one epoll instance drives
//! an accept fiber plus one worker fiber per connection, all on a single
//! dedicated OS thread. Workers see blocking-looking `read`/`write`/
//! `accept` calls; under the hood each call registers interest with the
//! reactor and parks the fiber until readiness arrives.

pub mod conn;
pub mod execute;
pub mod metrics;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod sock;

pub use execute::Command;
pub use metrics::{Metrics, MetricsSnapshot};
pub use protocol::Parser;
pub use server::Server;
