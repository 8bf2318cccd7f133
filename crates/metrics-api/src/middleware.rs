//! Request middleware: bearer authorization and request logging

use crate::api::AppState;
use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Body returned with every 401
pub const UNAUTHORIZED_BODY: &str = "unauthorized";

const BEARER_SCHEME: &str = "bearer";

/// Reason a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Malformed,
    Mismatch,
}

impl AuthFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFailure::Missing => "missing authorization header",
            AuthFailure::Malformed => "malformed authorization header",
            AuthFailure::Mismatch => "token mismatch",
        }
    }
}

/// Check an `Authorization` header against the expected token.
///
/// The header must split on single spaces into exactly two parts, the first
/// being `Bearer` in any case.
pub fn check_bearer(header: Option<&HeaderValue>, expected: &str) -> Result<(), AuthFailure> {
    let value = header
        .ok_or(AuthFailure::Missing)?
        .to_str()
        .map_err(|_| AuthFailure::Malformed)?;

    let parts: Vec<&str> = value.split(' ').collect();
    let [scheme, token] = parts.as_slice() else {
        return Err(AuthFailure::Malformed);
    };
    if !scheme.eq_ignore_ascii_case(BEARER_SCHEME) {
        return Err(AuthFailure::Malformed);
    }
    if *token != expected {
        return Err(AuthFailure::Mismatch);
    }
    Ok(())
}

/// Reject requests without the configured bearer token
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match check_bearer(request.headers().get(AUTHORIZATION), &state.auth_token) {
        Ok(()) => next.run(request).await,
        Err(failure) => {
            warn!(
                path = %request.uri().path(),
                reason = failure.as_str(),
                "Rejected unauthorized request"
            );
            (
                StatusCode::UNAUTHORIZED,
                [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                UNAUTHORIZED_BODY,
            )
                .into_response()
        }
    }
}

/// Log method, path, status and duration of every request
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "HTTP request"
    );
    response
}
