//! Error types for tollgate
//!
//! Absence of a key is never an error; storage lookups return `Option`/`bool`.
//! The remaining variants follow the failure classes the control plane has to
//! tell apart: transport loss is retried, serialization failures are local to
//! one key, conflicts are resolved by re-reading.

use hyper::StatusCode;

/// Main error type for tollgate operations
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    /// Store or subscription connectivity failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// A stored value could not be encoded or decoded
    #[error("Serialization error for key {key}: {message}")]
    Serialization { key: String, message: String },

    /// The stored record moved to a status that is neither the expected prior
    /// status nor the requested target
    #[error("Unexpected status for {key}: expected {expected}, found {found}")]
    UnexpectedStatus {
        key: String,
        expected: String,
        found: String,
    },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Compare-and-swap retries exhausted
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Training provider error: {0}")]
    Provider(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TollgateError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UnexpectedStatus { .. } => StatusCode::CONFLICT,
            Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Metadata(_) => StatusCode::BAD_GATEWAY,
            Self::Subscription(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn serialization(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            key: key.into(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for TollgateError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for TollgateError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for TollgateError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<reqwest::Error> for TollgateError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(format!("HTTP client error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TollgateError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Subscription(err.to_string())
    }
}

/// Result type alias for tollgate operations
pub type Result<T> = std::result::Result<T, TollgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            TollgateError::Transport("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TollgateError::Unauthorized("no key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            TollgateError::Conflict("cas".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_serialization_error_names_key() {
        let err = TollgateError::serialization("/model/storage/{ID:o|s|g|1}", "expected value");
        let rendered = err.to_string();
        assert!(rendered.contains("{ID:o|s|g|1}"));
    }
}
