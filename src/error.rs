// =============================================================================
// Error taxonomy for the sync layer
// =============================================================================
//
// Every error is cloneable so it can be stored on the published snapshot and
// handed to any number of consumers.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

/// Typed failure surfaced by the fetcher, the stream connector and the
/// backend request helper.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncError {
    /// Transport failure, no response received.
    #[error("network error: {message}")]
    Network { message: String },

    /// Non-2xx response with its status and parsed body.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: serde_json::Value },

    /// Client-side deadline exceeded.
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Malformed payload.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Socket-level failure.
    #[error("connection error: {message}")]
    Connection { message: String },
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// HTTP status code, for `Http` errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Connection { .. } => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Parse { .. } => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::network("reset").is_retryable());
        assert!(SyncError::Timeout { timeout_ms: 10_000 }.is_retryable());
        assert!(SyncError::connection("refused").is_retryable());
        assert!(SyncError::Http { status: 503, body: serde_json::Value::Null }.is_retryable());
        assert!(SyncError::Http { status: 429, body: serde_json::Value::Null }.is_retryable());
        assert!(!SyncError::Http { status: 404, body: serde_json::Value::Null }.is_retryable());
        assert!(!SyncError::parse("bad json").is_retryable());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let err = SyncError::Http {
            status: 401,
            body: serde_json::json!({ "detail": "expired" }),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "http");
        assert_eq!(json["status"], 401);
        assert_eq!(json["body"]["detail"], "expired");
        assert_eq!(err.status(), Some(401));
    }

    #[test]
    fn display_carries_details() {
        let err = SyncError::Timeout { timeout_ms: 10_000 };
        assert_eq!(err.to_string(), "request timed out after 10000 ms");
    }
}
