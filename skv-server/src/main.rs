use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skv_common::config::{DEFAULT_MAX_BYTES, DEFAULT_STACK_SIZE};
use skv_common::ServerConfig;
use skv_server::Server;
use skv_store::LruStore;

/// In-memory LRU cache server speaking a text protocol over TCP.
#[derive(Parser, Debug)]
#[command(name = "skv-server", about = "In-memory LRU cache server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Cache byte budget (sum of key and value lengths)
    #[arg(long, default_value_t = DEFAULT_MAX_BYTES)]
    max_bytes: usize,

    /// Listen backlog
    #[arg(long, default_value_t = 5)]
    backlog: i32,

    /// Fiber stack size in bytes
    #[arg(long, default_value_t = DEFAULT_STACK_SIZE)]
    stack_size: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        addr: args.listen,
        max_bytes: args.max_bytes,
        backlog: args.backlog,
        stack_size: args.stack_size,
        ..ServerConfig::default()
    };

    let store = LruStore::new(config.max_bytes);
    let mut server = Server::start(config, store).context("failed to start server")?;
    info!(addr = %server.local_addr(), "listening; stop with SIGKILL or ctrl-c");

    server.join().context("server thread failed")?;
    Ok(())
}
