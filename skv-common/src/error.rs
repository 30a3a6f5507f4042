//! # Shared Error Type
//!
//! One error enum for the whole workspace so crate boundaries stay thin.
//! Store-level refusals (key absent, budget exceeded) are not errors; they
//! are ordinary `false`/`None` returns on the storage surface.

use std::io;

use thiserror::Error;

/// Result alias used across the workspace.
pub type SkvResult<T> = Result<T, SkvError>;

/// Errors surfaced by StrandKV components.
#[derive(Debug, Error)]
pub enum SkvError {
    /// Network or file-descriptor level failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The client sent bytes the parser cannot accept.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A parsed command failed during execution.
    #[error("execute error: {0}")]
    Execute(String),

    /// The coroutine engine or reactor died; the server thread is gone.
    #[error("engine failure: {0}")]
    Engine(String),

    /// Invalid server configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl SkvError {
    /// Message sent to a client when command execution fails.
    ///
    /// The wire format is `SERVER_ERROR <message>`; the worker appends the
    /// line terminator.
    pub fn server_error_line(&self) -> String {
        format!("SERVER_ERROR {self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_line_includes_message() {
        let err = SkvError::Execute("boom".to_string());
        assert_eq!(err.server_error_line(), "SERVER_ERROR execute error: boom");
    }
}
