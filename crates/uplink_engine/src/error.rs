//! Error types for the uplink engine.

use crate::classify::ErrorKind;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uplink_protocol::ProtocolError;

/// Result type for transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// A raw failure raised at the transport boundary.
///
/// Each transport translates its own wire-level failures (status codes,
/// notice topics, `{tag}` error strings) into one of these variants exactly
/// once; everything above the transport works with the typed value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The service asked the client to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The addressed feed or group does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Link-level failure (dropped connection, server-side 5xx).
    #[error("connection error: {0}")]
    Connection(String),

    /// Response could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// No answer within the bounded timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Memory or buffer exhaustion on the device.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Credentials rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Permanent protocol violation.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Anything the transport could not place.
    #[error("unclassified transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// Maps an HTTP-style status code to a transport error.
    ///
    /// Both the polling channel and the push channel's error notices use
    /// status semantics.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            404 => TransportError::NotFound(detail),
            429 => TransportError::RateLimited(detail),
            401 | 403 => TransportError::Auth(detail),
            408 => TransportError::Timeout(Duration::ZERO),
            500..=599 => TransportError::Connection(format!("status {status}: {detail}")),
            _ => TransportError::Protocol(format!("status {status}: {detail}")),
        }
    }

    /// Returns true for link-level failures that invalidate the connection.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::Timeout(_) | TransportError::Malformed(_)
        )
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Malformed(msg) => TransportError::Malformed(msg),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Malformed(err.to_string())
    }
}

/// A request for the host to reinitialise the link or reset the device.
///
/// The engine has no authority to restart anything itself; it surfaces this
/// and stops doing work until the host acts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetRequest {
    /// Classification of the failure that caused the request.
    pub kind: ErrorKind,
    /// Description of the underlying cause.
    pub reason: String,
}

impl ResetRequest {
    /// Creates a reset request.
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ResetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.kind)
    }
}

/// Errors surfaced by the engine to its host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A fatal condition the engine cannot heal.
    #[error("hard reset requested: {0}")]
    ResetRequested(ResetRequest),

    /// The transport refused to connect.
    #[error("connect failed: {0}")]
    Connect(TransportError),

    /// The circuit breaker is open.
    #[error("channel offline (retry in {retry_in:?})")]
    Offline {
        /// Time left until the next connect attempt, `None` if never.
        retry_in: Option<Duration>,
    },

    /// Invalid feed key or protocol value supplied by the application.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport failure surfaced directly.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SyncError {
    /// Returns true if the host must act (reset or reinitialise).
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::ResetRequested(_))
    }

    /// Returns true if a later attempt may succeed without host action.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Connect(err) | SyncError::Transport(err) => !matches!(
                err,
                TransportError::Auth(_) | TransportError::Protocol(_) | TransportError::Other(_)
            ),
            SyncError::Offline { retry_in } => retry_in.is_some(),
            _ => false,
        }
    }
}
