//! Rate limiting middleware.
//!
//! Classifies each request into an operation class, consults the
//! shared limiter, and exposes the `X-RateLimit-*` headers on every
//! limited response. Health, docs, and metrics bypass.

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use herald_core::cache::{OperationClass, RateLimitDecision};
use herald_core::Error;

use crate::envelope::ApiError;
use crate::middleware::auth::AuthOutcome;
use crate::state::AppState;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Operation class for a request.
pub fn classify(method: &Method, path: &str) -> OperationClass {
    if path == "/health" || path.starts_with("/actuator") || path.starts_with("/docs") {
        return OperationClass::Public;
    }

    if path.starts_with("/admin") || path.starts_with("/api/v1/admin") {
        return OperationClass::Admin;
    }

    match *method {
        Method::GET | Method::HEAD | Method::OPTIONS => OperationClass::Read,
        _ => OperationClass::Write,
    }
}

pub async fn rate_limit_layer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let class = classify(request.method(), request.uri().path());

    if class == OperationClass::Public {
        return next.run(request).await;
    }

    let principal_key = request
        .extensions()
        .get::<AuthOutcome>()
        .map(|outcome| outcome.principal.rate_limit_key())
        .unwrap_or_else(|| "anonymous".to_string());

    let decision = state.rate_limiter.check(&principal_key, class).await;

    if !decision.allowed {
        let mut response = ApiError(Error::RateLimited {
            retry_after_secs: decision.reset_secs,
        })
        .into_response();
        apply_headers(&mut response, &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(&mut response, &decision);
    response
}

fn apply_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert(HEADER_LIMIT, value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert(HEADER_REMAINING, value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_secs.to_string()) {
        headers.insert(HEADER_RESET, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_paths_bypass() {
        assert_eq!(classify(&Method::GET, "/health"), OperationClass::Public);
        assert_eq!(
            classify(&Method::GET, "/actuator/health"),
            OperationClass::Public
        );
        assert_eq!(
            classify(&Method::GET, "/actuator/prometheus"),
            OperationClass::Public
        );
        assert_eq!(
            classify(&Method::GET, "/docs/openapi.json"),
            OperationClass::Public
        );
    }

    #[test]
    fn test_admin_paths() {
        assert_eq!(
            classify(&Method::POST, "/admin/cleanup/run"),
            OperationClass::Admin
        );
        assert_eq!(
            classify(&Method::GET, "/api/v1/admin/templates"),
            OperationClass::Admin
        );
    }

    #[test]
    fn test_read_write_split() {
        assert_eq!(
            classify(&Method::GET, "/api/v1/notifications"),
            OperationClass::Read
        );
        assert_eq!(
            classify(&Method::POST, "/api/v1/notifications"),
            OperationClass::Write
        );
        assert_eq!(
            classify(&Method::PUT, "/api/v1/notifications/1/read"),
            OperationClass::Write
        );
        assert_eq!(
            classify(&Method::DELETE, "/api/v1/notifications/1"),
            OperationClass::Write
        );
    }

    #[test]
    fn test_header_values() {
        let decision = RateLimitDecision {
            allowed: true,
            limit: 60,
            remaining: 12,
            reset_secs: 30,
        };
        let mut response = axum::http::StatusCode::OK.into_response();
        apply_headers(&mut response, &decision);

        assert_eq!(response.headers().get(HEADER_LIMIT).unwrap(), "60");
        assert_eq!(response.headers().get(HEADER_REMAINING).unwrap(), "12");
        assert_eq!(response.headers().get(HEADER_RESET).unwrap(), "30");
    }
}
