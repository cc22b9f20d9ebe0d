//! Error types for protocol parsing and validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while validating identifiers or decoding documents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Feed key contains characters outside `[A-Za-z0-9-]` or is too long.
    #[error("invalid feed key {key:?}: {reason}")]
    InvalidFeedKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Topic string does not follow the `{account}/{kind}/{name}` layout.
    #[error("unrecognised topic: {0}")]
    InvalidTopic(String),

    /// Timestamp could not be parsed.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// JSON document could not be decoded.
    #[error("malformed document: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::InvalidFeedKey {
            key: "bad key".into(),
            reason: "whitespace",
        };
        assert!(err.to_string().contains("bad key"));
        assert!(err.to_string().contains("whitespace"));
    }

    #[test]
    fn json_errors_become_malformed() {
        let err: ProtocolError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
