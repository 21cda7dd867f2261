use std::io;

use thiserror::Error;

/// Errors produced by the imp protocol layer.
#[derive(Debug, Error)]
pub enum ImpError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("no such process: {0}")]
    NoSuchProcess(u32),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ImpError {
    /// Whether this error is an expected outcome rather than a fault.
    ///
    /// Expected outcomes are logged below error level.
    pub fn is_expected(&self) -> bool {
        match self {
            ImpError::NoSuchProcess(_) | ImpError::ConnectionLost | ImpError::Cancelled => true,
            ImpError::Io(e) => is_closed_error(e),
            _ => false,
        }
    }
}

impl From<ciborium::de::Error<io::Error>> for ImpError {
    fn from(e: ciborium::de::Error<io::Error>) -> Self {
        ImpError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for ImpError {
    fn from(e: ciborium::ser::Error<io::Error>) -> Self {
        ImpError::Codec(e.to_string())
    }
}

impl From<ssh_key::Error> for ImpError {
    fn from(e: ssh_key::Error) -> Self {
        ImpError::Format(e.to_string())
    }
}

pub type ImpResult<T> = Result<T, ImpError>;

/// Whether an I/O error only signals that the other side went away.
///
/// Broken pipes, resets and EOF-class errors end a stream normally and are
/// never reported as failures.
pub fn is_closed_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
