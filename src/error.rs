//! Error types shared by the transport, coordinators and download handler.

use serde_json::Value;
use thiserror::Error;

use crate::key::QueryKey;

/// A request that produced no usable response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The request never produced a response (connection refused, timeout, ...).
    #[error("Network error: {message}")]
    Network { message: String },

    /// The server answered with a non-success status code.
    #[error("HTTP {status}")]
    Status {
        status: u16,
        /// Parsed JSON error payload, when the body held one.
        body: Option<Value>,
    },
}

impl TransportError {
    /// Returns the HTTP status code, or `None` when no response was received.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Network { .. } => None,
            Self::Status { status, .. } => Some(*status),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// A success response whose body did not have the expected shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Decode error: {0}")]
pub struct DecodeError(pub String);

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Error type for query operations.
///
/// This is what gets stored on a cache entry when a fetch fails.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The fetch was superseded by a mutation on the same key.
    #[error("Fetch cancelled")]
    Cancelled,
}

impl QueryError {
    /// Returns the HTTP status code carried by a transport failure, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(err) => err.status(),
            _ => None,
        }
    }
}

/// A failed remote write. The cache entry for `key` has already been rolled back.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Mutation on {key} failed: {source}")]
pub struct MutationError {
    pub key: QueryKey,
    #[source]
    pub source: QueryError,
}

/// Failure to produce a downloaded artifact.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DownloadError {
    #[error("Download request failed: {0}")]
    Transport(#[from] QueryError),

    #[error("Unexpected content type: {0}")]
    UnexpectedContentType(String),

    #[error("Failed to save artifact: {0}")]
    Io(String),
}

impl From<TransportError> for DownloadError {
    fn from(err: TransportError) -> Self {
        Self::Transport(QueryError::Transport(err))
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Invalid client configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    InvalidVar { name: &'static str, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use serde_json::json;

    #[test]
    fn test_transport_error_status() {
        let err = TransportError::Network {
            message: "connection refused".to_string(),
        };
        assert_eq!(err.status(), None);
        assert_eq!(err.to_string(), "Network error: connection refused");

        let err = TransportError::Status {
            status: 500,
            body: Some(json!({"detail": "boom"})),
        };
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.to_string(), "HTTP 500");
    }

    #[test]
    fn test_query_error_display_is_transparent() {
        let err = QueryError::from(TransportError::Status {
            status: 404,
            body: None,
        });
        assert_eq!(err.to_string(), "HTTP 404");
        assert_eq!(err.status(), Some(404));

        let err = QueryError::from(DecodeError("expected array".to_string()));
        assert_eq!(err.to_string(), "Decode error: expected array");
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_mutation_error_display() {
        let err = MutationError {
            key: query_key!["slides", "r1"],
            source: QueryError::Cancelled,
        };
        assert_eq!(
            err.to_string(),
            r#"Mutation on ["slides", "r1"] failed: Fetch cancelled"#
        );
    }
}
