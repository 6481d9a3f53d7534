use std::{fmt, io};

use tokio::time::error::Elapsed;

/// The closed set of failure categories a call or subscription can end in.
///
/// Every kind maps onto a stable status code (see [`ErrorKind::code`]):
/// local validation failures are negative, remote and protocol failures are
/// positive, `0` is reserved for success.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A required argument was null or empty.
    InvalidArgument,
    /// The process-wide I/O pool is not running.
    NotInitialized,
    /// The transport could not establish or keep the connection.
    ConnectionFailed,
    /// No response arrived within the configured deadline.
    Timeout,
    /// Malformed or unroutable traffic, or a topic hash collision.
    ProtocolError,
    /// The operation was cancelled before it could complete.
    Cancelled,
    /// The remote peer answered with an application-level failure.
    RemoteError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::InvalidArgument,
        ErrorKind::NotInitialized,
        ErrorKind::ConnectionFailed,
        ErrorKind::Timeout,
        ErrorKind::ProtocolError,
        ErrorKind::Cancelled,
        ErrorKind::RemoteError,
    ];

    /// Status code reported across the foreign-function boundary.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidArgument => -1,
            ErrorKind::NotInitialized => -2,
            ErrorKind::ConnectionFailed => 1,
            ErrorKind::Timeout => 2,
            ErrorKind::ProtocolError => 3,
            ErrorKind::Cancelled => 4,
            ErrorKind::RemoteError => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Returns true for failures detected before any I/O was scheduled.
    pub fn is_local(self) -> bool {
        self.code() < 0
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotInitialized => "not initialized",
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::Timeout => "timed out",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RemoteError => "remote error",
        };
        f.write_str(name)
    }
}

/// A failed call, publish or subscription.
///
/// Carries the [`ErrorKind`], a human-readable message and, for remote
/// failures, whatever diagnostic payload the peer attached to its answer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    partial: Option<Vec<u8>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            partial: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_initialized() -> Self {
        Self::new(ErrorKind::NotInitialized, "I/O pool is not initialized")
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolError, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// A failure reported by the peer. An empty diagnostic payload is
    /// treated as absent.
    pub fn remote(message: impl Into<String>, partial: Vec<u8>) -> Self {
        Self {
            kind: ErrorKind::RemoteError,
            message: message.into(),
            partial: (!partial.is_empty()).then_some(partial),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The partial response received before the failure, if any.
    pub fn partial(&self) -> Option<&[u8]> {
        self.partial.as_deref()
    }

    pub fn into_partial(self) -> Option<Vec<u8>> {
        self.partial
    }

    pub fn code(&self) -> i32 {
        self.kind.code()
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::InvalidData => Self::protocol(error.to_string()),
            io::ErrorKind::TimedOut => Self::timeout(error.to_string()),
            io::ErrorKind::UnexpectedEof => {
                Self::connection_failed("connection closed by peer")
            }
            _ => Self::connection_failed(error.to_string()),
        }
    }
}

impl From<Elapsed> for Error {
    fn from(_: Elapsed) -> Self {
        Self::timeout("deadline elapsed")
    }
}

#[cfg(feature = "quic")]
impl From<quinn::ConnectError> for Error {
    fn from(error: quinn::ConnectError) -> Self {
        use quinn::ConnectError::*;
        match error {
            InvalidDnsName(name) => {
                Self::invalid_argument(format!("invalid server name {name}"))
            }
            InvalidRemoteAddress(addr) => {
                Self::invalid_argument(format!("invalid remote address {addr}"))
            }
            other => Self::connection_failed(other.to_string()),
        }
    }
}

#[cfg(feature = "quic")]
impl From<quinn::ConnectionError> for Error {
    fn from(error: quinn::ConnectionError) -> Self {
        match error {
            quinn::ConnectionError::TimedOut => {
                Self::connection_failed("QUIC handshake timed out")
            }
            other => Self::connection_failed(other.to_string()),
        }
    }
}

#[cfg(feature = "quic")]
impl From<rustls::Error> for Error {
    fn from(error: rustls::Error) -> Self {
        Self::connection_failed(format!("TLS: {error}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
