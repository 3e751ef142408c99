use thiserror::Error;

/// Errors surfaced by server control operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start()` was called on a server that is already running.
    #[error("server already running")]
    AlreadyRunning,
    /// The server stopped while the operation was in flight.
    #[error("server stopped")]
    Stopped,
    /// Configuration failed validation at start.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Listener bind or other startup I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The node-observation sink failed to open or load.
    #[error(transparent)]
    Sink(#[from] crate::persist::SinkError),
}
