// =============================================================================
// Bearer Token Authentication — Axum extractor for control routes
// =============================================================================
//
// Extracts and validates a Bearer token from the `Authorization` header
// against the dashboard token held by `AppState` (loaded from
// `FXDASH_DASHBOARD_TOKEN` at startup). Comparison is constant time.
//
// Usage as an Axum extractor:
//
//   async fn handler(_auth: AuthBearer, State(state): State<Arc<AppState>>) { ... }
//
// If the token is missing or invalid, the extractor short-circuits the request
// with a 403 Forbidden response before the handler body executes.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;

pub const ENV_DASHBOARD_TOKEN: &str = "FXDASH_DASHBOARD_TOKEN";

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. A length mismatch returns early;
/// the expected token length is not secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// `true` when `presented` matches the configured dashboard token.
pub fn token_matches(expected: Option<&str>, presented: &str) -> bool {
    match expected {
        Some(expected) if !expected.is_empty() => constant_time_eq(presented.as_bytes(), expected.as_bytes()),
        _ => false,
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Proof that the request carried the dashboard token.
pub struct AuthBearer;

/// Rejection type returned when authentication fails.
#[derive(Debug)]
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthBearer {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.dashboard_token() else {
            warn!("{ENV_DASHBOARD_TOKEN} is not set, control request rejected");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Server authentication not configured",
            });
        };

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let Some(token) = token else {
            warn!("missing or malformed Authorization header");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Missing or invalid authorization token",
            });
        };

        if !token_matches(Some(expected), token.trim()) {
            warn!("invalid dashboard token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid authorization token",
            });
        }

        Ok(AuthBearer)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn unset_or_empty_token_never_matches() {
        assert!(!token_matches(None, ""));
        assert!(!token_matches(Some(""), ""));
        assert!(token_matches(Some("s3cret"), "s3cret"));
        assert!(!token_matches(Some("s3cret"), "s3cre"));
    }
}
