use std::io;
use thiserror::Error;

/// Central error type for the Etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed its end of the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The read buffer was already full when more input was expected.
    #[error("read buffer exhausted")]
    ReadBufferFull,

    /// Response headers did not fit in the fixed write buffer.
    #[error("response headers overflow the write buffer ({capacity} bytes)")]
    WriteBufferOverflow { capacity: usize },

    /// The connection table has no room for another socket.
    #[error("connection table is full")]
    TableFull,

    /// The request queue is at capacity.
    #[error("request queue is full")]
    QueueFull,

    /// The worker pool no longer accepts work.
    #[error("thread pool is shutting down")]
    ShuttingDown,

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signal handlers could not be installed.
    #[error("signal setup failed: {0}")]
    Signal(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;

impl EtudeError {
    /// Whether the error came from the peer or the socket rather than from a
    /// limit of this server.
    pub fn is_transport(&self) -> bool {
        matches!(self, EtudeError::Io(_) | EtudeError::PeerClosed)
    }
}
