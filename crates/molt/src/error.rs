//! Error types for the supervisor.

use std::io;

use thiserror::Error;

/// Errors produced by the framed control channel.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The channel was closed locally. Callers treat this as "peer gone".
    #[error("framed pipe is closed")]
    Closed,

    /// The underlying pipe failed.
    #[error("framed pipe I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum MoltError {
    /// IO error (pid file, bootstrap log directory, spawn)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Control-channel error
    #[error(transparent)]
    Pipe(#[from] PipeError),

    /// Bootstrap map could not be encoded or decoded
    #[error("bootstrap payload error: {0}")]
    Bootstrap(#[from] serde_json::Error),

    /// Listener bind failure, fatal to parent startup
    #[error("failed to bind listener '{name}' on port {port}: {source}")]
    Bind {
        /// Logical listener name
        name: String,
        /// Requested TCP port
        port: u16,
        /// Underlying bind error
        source: io::Error,
    },

    /// Configuration error (empty bootstrap args, unparseable pid file)
    #[error("configuration error: {0}")]
    Config(String),

    /// A replacement child never reported ready while no other child was
    /// serving
    #[error("replacement child failed to become ready")]
    ChildNotReady,

    /// Too many unexpected child exits; an outer process manager decides next
    #[error("crash-restart budget exhausted")]
    RebootBudgetExhausted,
}

impl MoltError {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
