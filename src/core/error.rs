//! Unified error handling for the dispatch engine.
//!
//! This module provides a centralized error type system so the scheduler,
//! cache, and transport layers do not depend on each other for error
//! handling. Errors that terminate a work item must be observable by every
//! waiter of a deduplicated submission, so all variants are cloneable and
//! carry rendered causes rather than boxed ones.

use std::fmt;

/// Classification of a transport failure.
///
/// The retry policy only ever retries [transient](TransportErrorKind::is_transient)
/// kinds, and only for idempotent requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection could not be established
    Connect,

    /// The remote end actively refused the connection
    ConnectionRefused,

    /// Connect or read deadline elapsed
    Timeout,

    /// Hostname did not resolve
    Dns,

    /// No route to host / port unreachable
    RouteUnreachable,

    /// TLS handshake failed for a reason other than certificate validation
    TlsHandshake,

    /// Certificate validation failed
    TlsCertificate,

    /// Generic TLS protocol error
    Tls,

    /// The connection was established but reading the response failed
    Read,

    /// The in-flight attempt was interrupted by cancellation
    Interrupted,

    /// Anything the transport could not classify
    Other,
}

impl TransportErrorKind {
    /// Whether a failure of this kind may be retried for an idempotent request.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TransportErrorKind::Connect
                | TransportErrorKind::ConnectionRefused
                | TransportErrorKind::Timeout
                | TransportErrorKind::Dns
                | TransportErrorKind::RouteUnreachable
                | TransportErrorKind::TlsHandshake
                | TransportErrorKind::Tls
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::ConnectionRefused => "connection refused",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::RouteUnreachable => "route unreachable",
            TransportErrorKind::TlsHandshake => "tls handshake",
            TransportErrorKind::TlsCertificate => "tls certificate",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Read => "read",
            TransportErrorKind::Interrupted => "interrupted",
            TransportErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A failure raised by the HTTP transport for a single wire attempt.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error ({}): {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

/// Unified error types for the dispatch engine
#[derive(Debug, Clone)]
pub enum CommsError {
    /// Wire-level failures (connect, read, DNS, route, TLS)
    Transport(TransportError),

    /// Malformed URI, header, or unserializable response
    Protocol(String),

    /// Missing or mis-typed configuration
    Configuration(String),

    /// Raised by the cache provider; never fatal to a submission
    Cache(String),

    /// The work was cancelled before producing a result
    Cancelled,

    /// Internal system errors
    Internal(String),
}

impl fmt::Display for CommsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommsError::Transport(err) => write!(f, "{err}"),
            CommsError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            CommsError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            CommsError::Cache(msg) => write!(f, "Cache error: {msg}"),
            CommsError::Cancelled => write!(f, "Work cancelled"),
            CommsError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for CommsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommsError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for CommsError {
    fn from(err: TransportError) -> Self {
        CommsError::Transport(err)
    }
}

impl From<http::uri::InvalidUri> for CommsError {
    fn from(err: http::uri::InvalidUri) -> Self {
        CommsError::Protocol(format!("invalid URI: {err}"))
    }
}

impl From<serde_json::Error> for CommsError {
    fn from(err: serde_json::Error) -> Self {
        CommsError::Protocol(format!("serialization failed: {err}"))
    }
}

/// Result type alias for engine operations
pub type CommsResult<T> = std::result::Result<T, CommsError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> CommsResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> CommsResult<T> {
        self.map_err(|e| CommsError::Internal(format!("{context}: {e}")))
    }
}
