//! Operator API key authentication.
//!
//! `/ws/stats` and everything under `/api/` require an
//! `Authorization: Bearer <key>` header. Devices never use this path: they
//! authenticate in-band with their connect key after the `/ws` upgrade.
//! `/health` is public.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Axum middleware that rejects requests without a valid `Authorization: Bearer`
/// header. The expected key is injected via the [`ApiKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or not a Bearer token
/// - `403 Forbidden`: key present but wrong
/// - `500 Internal Server Error`: [`ApiKey`] extension not installed
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return reject(StatusCode::INTERNAL_SERVER_ERROR, "Server configuration error");
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        None => reject(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header",
        ),
        Some(key) if !constant_time_eq(expected.as_bytes(), key.as_bytes()) => {
            reject(StatusCode::FORBIDDEN, "Invalid API key")
        }
        Some(_) => next.run(request).await,
    }
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Constant-time byte comparison.
///
/// Always walks the full length of `expected`, so response time does not
/// depend on where `provided` first differs or on its length. Also used for
/// device connect keys.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

/// Extension type carrying the expected API key, injected into the router
/// layer so [`require_api_key`] can access it without touching `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);
