// skv-common - Shared error and configuration types for StrandKV

pub mod config;
pub mod error;

// Re-export for convenience
pub use config::ServerConfig;
pub use error::{SkvError, SkvResult};
