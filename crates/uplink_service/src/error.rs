//! Error types for the telemetry service.

use thiserror::Error;

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised by the telemetry service.
///
/// Application errors ([`is_client_error`](Self::is_client_error)) are
/// reported in-band: as a status on the HTTP channel, as a notice on the
/// push channel, as an `err` field for the note hub. Link errors abort the
/// exchange itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed.
    #[error("not authorized: {0}")]
    Forbidden(String),

    /// No such feed, group or route.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write budget exhausted.
    #[error("rate limited: {limit} writes per {window_secs}s")]
    RateLimited {
        /// Writes per window.
        limit: u32,
        /// Window length in seconds.
        window_secs: u64,
    },

    /// A service-side capacity was reached.
    #[error("limit reached: {0}")]
    LimitReached(String),

    /// Injected status code.
    #[error("status {status}: {message}")]
    Status {
        /// HTTP-style status.
        status: u16,
        /// Detail.
        message: String,
    },

    /// The link dropped mid-exchange.
    #[error("connection dropped")]
    Disconnected,

    /// The exchange never completed.
    #[error("request timed out")]
    TimedOut,

    /// The device ran out of memory.
    #[error("out of memory")]
    OutOfMemory,

    /// Internal service error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// HTTP-style status for in-band reporting.
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::InvalidRequest(_) | ServiceError::LimitReached(_) => 400,
            ServiceError::Unauthorized(_) => 401,
            ServiceError::Forbidden(_) => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::TimedOut => 408,
            ServiceError::RateLimited { .. } => 429,
            ServiceError::Status { status, .. } => *status,
            ServiceError::OutOfMemory => 507,
            ServiceError::Disconnected | ServiceError::Internal(_) => 500,
        }
    }

    /// Returns true if this error is reported in-band.
    pub fn is_client_error(&self) -> bool {
        !self.is_link_error()
    }

    /// Returns true if this error aborts the exchange.
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Disconnected | ServiceError::TimedOut | ServiceError::OutOfMemory
        )
    }

    /// `{tag}` used by the note hub.
    pub fn note_tag(&self) -> &'static str {
        match self {
            ServiceError::RateLimited { .. } => "rate-limit",
            ServiceError::NotFound(_) => "env-noexist",
            ServiceError::Unauthorized(_) | ServiceError::Forbidden(_) => "auth",
            ServiceError::OutOfMemory | ServiceError::LimitReached(_) => "heap",
            ServiceError::TimedOut => "timeout",
            ServiceError::Disconnected => "io",
            ServiceError::InvalidRequest(_)
            | ServiceError::Status { .. }
            | ServiceError::Internal(_) => "req",
        }
    }
}
