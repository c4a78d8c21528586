//! Uniform error envelope.
//!
//! Every error response carries
//! `{timestamp, status, error, message, path, correlationId,
//! validationErrors?, additionalDetails?}`. Handlers return `ApiError`
//! which stashes a partial envelope in the response extensions; the
//! outermost envelope layer completes it with the request path and
//! correlation id so handlers never thread those through.

use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use herald_core::{Error, ValidationErrors};

use crate::middleware::correlation::CorrelationId;

/// Envelope material known at the point an error is raised.
#[derive(Debug, Clone)]
pub struct PartialEnvelope {
    pub status: StatusCode,
    pub message: String,
    pub validation_errors: Option<ValidationErrors>,
    pub retry_after_secs: Option<u64>,
    /// Internal detail logged under the correlation id, never sent
    pub internal: Option<String>,
}

/// Error wrapper returned by handlers.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let retry_after_secs = match &self.0 {
            Error::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        // Validation errors may carry structured field errors
        let validation_errors = match &self.0 {
            Error::Validation(msg) => serde_json::from_str::<ValidationErrors>(msg).ok(),
            _ => None,
        };

        // Clients see internals only for 4xx; 5xx details go to the log
        let (message, internal) = if status.is_server_error() {
            ("Internal server error".to_string(), Some(self.0.to_string()))
        } else if validation_errors.is_some() {
            ("Validation failed".to_string(), None)
        } else {
            (self.0.to_string(), None)
        };

        let partial = PartialEnvelope {
            status,
            message,
            validation_errors,
            retry_after_secs,
            internal,
        };

        let mut response = status.into_response();
        if let Some(retry_after) = retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response.extensions_mut().insert(partial);
        response
    }
}

/// Outermost layer: completes partial envelopes with path and
/// correlation id, including the router fallback's 404.
pub async fn envelope_layer(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0.clone());

    let response = next.run(request).await;

    let (mut parts, body) = response.into_parts();
    let Some(partial) = parts.extensions.remove::<PartialEnvelope>() else {
        return Response::from_parts(parts, body);
    };

    if let Some(internal) = &partial.internal {
        tracing::error!(
            path = %path,
            correlation_id = correlation_id.as_deref().unwrap_or("-"),
            status = partial.status.as_u16(),
            error = %internal,
            "Request failed"
        );
    }

    let mut body = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "status": partial.status.as_u16(),
        "error": partial.status.canonical_reason().unwrap_or("Error"),
        "message": partial.message,
        "path": path,
        "correlationId": correlation_id,
    });
    if let Some(validation_errors) = &partial.validation_errors {
        body["validationErrors"] = serde_json::to_value(&validation_errors.errors)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Some(retry_after) = partial.retry_after_secs {
        body["additionalDetails"] = serde_json::json!({ "retryAfterSeconds": retry_after });
    }

    let mut enveloped = (partial.status, Json(body)).into_response();
    // Keep headers set earlier in the stack (rate limit, correlation)
    for (name, value) in parts.headers.iter() {
        if name != http::header::CONTENT_TYPE && name != http::header::CONTENT_LENGTH {
            enveloped.headers_mut().insert(name.clone(), value.clone());
        }
    }

    enveloped
}

/// Router fallback: unknown paths resolve to 404 before any
/// authentication challenge.
pub async fn not_found() -> ApiError {
    ApiError(Error::not_found("No handler for path"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let response = ApiError(Error::unauthorized("missing token")).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.extensions().get::<PartialEnvelope>().is_some());
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let response = ApiError(Error::RateLimited { retry_after_secs: 17 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("Retry-After").unwrap(),
            &HeaderValue::from_static("17")
        );
        let partial = response.extensions().get::<PartialEnvelope>().unwrap();
        assert_eq!(partial.retry_after_secs, Some(17));
    }

    #[test]
    fn test_server_errors_hide_internals() {
        let response = ApiError(Error::Other("pool exhausted".to_string())).into_response();
        let partial = response.extensions().get::<PartialEnvelope>().unwrap();
        assert_eq!(partial.message, "Internal server error");
        assert_eq!(partial.internal.as_deref(), Some("Error: pool exhausted"));
    }

    #[test]
    fn test_validation_errors_structured() {
        let mut errors = ValidationErrors::new();
        errors.add("channels", "must not be empty");
        let response = ApiError(errors.into_error()).into_response();
        let partial = response.extensions().get::<PartialEnvelope>().unwrap();
        let validation = partial.validation_errors.as_ref().unwrap();
        assert_eq!(validation.errors[0].field, "channels");
    }
}
