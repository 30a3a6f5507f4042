//! # Server Configuration
//!
//! Plain data describing how to run the server. The binary builds this from
//! CLI flags; tests build it directly.

use serde::{Deserialize, Serialize};

/// Default cache budget: 64 MiB of key+value bytes.
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Default fiber stack size. Workers carry small live stacks; 64 KiB leaves
/// ample headroom over the 4 KiB read buffer.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Runtime configuration for a StrandKV server.
///
/// `acceptors` and `workers` are advisory: the coroutine server always runs
/// one acceptor fiber and one worker fiber per connection. They are kept so
/// deployments can carry one config across server variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind, e.g. "127.0.0.1:8080". Port 0 picks an ephemeral
    /// port (used by tests).
    pub addr: String,
    /// Cache byte budget: the sum of key and value lengths over all
    /// entries never exceeds this.
    pub max_bytes: usize,
    /// Listen backlog.
    pub backlog: i32,
    /// Advisory acceptor count; ignored by the coroutine variant.
    pub acceptors: u32,
    /// Advisory worker count; ignored by the coroutine variant.
    pub workers: u32,
    /// Stack size for each fiber, in bytes.
    pub stack_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: "127.0.0.1:8080".to_string(),
            max_bytes: DEFAULT_MAX_BYTES,
            backlog: 5,
            acceptors: 1,
            workers: 1,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}
