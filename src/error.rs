use crate::config::ConfigError;
use crate::observer::ObserverError;
use std::io;
use thiserror::Error;

/// Categorizes errors for caller and observer decision-making.
///
/// This is a lightweight, copyable view of [`Error`] that tells whether a
/// failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or service unavailability; absorbed by the manager and retried
    Transient,
    /// The configuration can never succeed; not retried
    Configuration,
    /// The manager has been shut down
    Closed,
    /// An observer failed while handling a notification
    Observer,
}

/// Kinds of failures a [`Transport`](crate::Transport) can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The peer refused the connection
    Refused,
    /// The attempt or the live connection timed out
    Timeout,
    /// The connection was reset or aborted
    Reset,
    /// The peer closed the connection
    Closed,
    /// Any other I/O failure
    Io,
    /// The address can never be reached (malformed, unresolvable by construction)
    InvalidAddress,
    /// The service rejected our credentials
    AuthRejected,
}

impl TransportErrorKind {
    /// Whether failures of this kind go through the backoff policy.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::InvalidAddress | Self::AuthRejected)
    }
}

/// A failure reported by the underlying transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    /// Create a transport error of the given kind.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Refused, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn reset(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Reset, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }

    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidAddress, message)
    }

    pub fn auth_rejected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::AuthRejected, message)
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the manager should retry after this failure.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => TransportErrorKind::Refused,
            io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportErrorKind::Reset,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::NotConnected => {
                TransportErrorKind::Closed
            }
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                TransportErrorKind::InvalidAddress
            }
            _ => TransportErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

/// Errors that can occur in cache-conn-manager
#[derive(Error, Debug)]
pub enum Error {
    /// Transient transport failure (never returned by `initialize`)
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Configuration rejected before any connection attempt
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The transport reported a failure no retry can fix
    #[error("Invalid configuration reported by transport: {0}")]
    InvalidConfiguration(TransportError),

    /// Manager has been shut down
    #[error("Manager closed")]
    Closed,

    /// An observer failed
    #[error("Observer error: {0}")]
    Observer(#[from] ObserverError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transient,
            Error::Configuration(_) | Error::InvalidConfiguration(_) => ErrorKind::Configuration,
            Error::Closed => ErrorKind::Closed,
            Error::Observer(_) => ErrorKind::Observer,
        }
    }

    /// Whether the error is a transient failure the manager retries.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        if err.is_retryable() {
            Error::Transport(err)
        } else {
            Error::InvalidConfiguration(err)
        }
    }
}
