//! Pre-shared API key checks.
//!
//! REST endpoints except `/api/health` take an `Authorization: Bearer <key>`
//! header. WebSocket connections authenticate in-band with a `system/auth`
//! frame instead; both paths compare with [`constant_time_eq`].

use axum::{
    extract::Request,
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Expected key, injected as a router extension so [`require_api_key`] does
/// not need the application state.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Why a REST request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No extension configured: a wiring bug, not a client error.
    Misconfigured,
    MissingBearer,
    WrongKey,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Misconfigured => (StatusCode::INTERNAL_SERVER_ERROR, "Server configuration error"),
            Self::MissingBearer => (StatusCode::UNAUTHORIZED, "Missing or invalid Authorization header"),
            Self::WrongKey => (StatusCode::FORBIDDEN, "Invalid API key"),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Check `headers` against the configured key.
pub fn check_bearer(expected: &str, headers: &HeaderMap) -> Result<(), Rejection> {
    let provided = bearer_token(headers).ok_or(Rejection::MissingBearer)?;
    if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        Ok(())
    } else {
        Err(Rejection::WrongKey)
    }
}

/// Axum middleware guarding the authenticated REST routes.
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return Rejection::Misconfigured.into_response();
    };
    match check_bearer(&expected, request.headers()) {
        Ok(()) => next.run(request).await,
        Err(rejection) => rejection.into_response(),
    }
}

/// Compare without an early exit. Work is proportional to `expected`, so the
/// timing reveals neither the mismatch position nor the key length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-and-more"));
        assert!(!constant_time_eq(b"secret", b"sec"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_check_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(check_bearer("k", &headers), Err(Rejection::MissingBearer));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic k"));
        assert_eq!(check_bearer("k", &headers), Err(Rejection::MissingBearer));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert_eq!(check_bearer("k", &headers), Err(Rejection::WrongKey));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer k"));
        assert_eq!(check_bearer("k", &headers), Ok(()));
    }
}
