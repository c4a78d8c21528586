//! Authentication middleware.
//!
//! Credential parsing runs for every request but never rejects on its
//! own; the guards attached with `route_layer` enforce access, so an
//! unknown path falls through to the 404 handler instead of producing
//! an authentication challenge. When both an API key and a bearer
//! token are present, the API key is tried first; either success
//! suffices.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use herald_core::auth::{extract_bearer, Principal};
use herald_core::Error;
use tracing::debug;

use crate::envelope::ApiError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const SOURCE_SERVICE_HEADER: &str = "x-source-service";

/// Outcome of credential parsing, consumed by the guards.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub principal: Principal,

    /// Why credential verification failed, when it did
    pub failure: Option<String>,
}

/// Parse credentials and attach the resulting principal.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let outcome = resolve_principal(&state, request.headers()).await;
    request.extensions_mut().insert(outcome);
    next.run(request).await
}

async fn resolve_principal(state: &AppState, headers: &http::HeaderMap) -> AuthOutcome {
    // API key first
    let api_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    let source_service = headers
        .get(SOURCE_SERVICE_HEADER)
        .and_then(|v| v.to_str().ok());

    let mut failure = None;

    if let (Some(api_key), Some(service)) = (api_key, source_service) {
        match state.api_keys.verify(service, api_key) {
            Some(principal) => {
                debug!(service, "Service authenticated via API key");
                return AuthOutcome {
                    principal,
                    failure: None,
                };
            }
            None => {
                failure = Some(format!("Unknown API key for service '{}'", service));
            }
        }
    }

    // Bearer token second
    if let Some(authorization) = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = extract_bearer(authorization) {
            match verify_bearer(state, token).await {
                Ok(principal) => {
                    return AuthOutcome {
                        principal,
                        failure: None,
                    }
                }
                Err(e) => failure = Some(e.to_string()),
            }
        }
    }

    AuthOutcome {
        principal: Principal::Anonymous,
        failure,
    }
}

async fn verify_bearer(state: &AppState, token: &str) -> herald_core::Result<Principal> {
    let claims = state.jwt.verify(token)?;

    // Revoked credentials are rejected; blacklist lookups fail closed
    if let Some(jti) = &claims.jti {
        if state.blacklist.is_blacklisted(jti).await {
            return Err(Error::unauthorized("Token revoked"));
        }
    }

    let principal = claims.into_principal()?;
    if let Some(user_id) = principal.user_id() {
        if state.blacklist.is_user_revoked(user_id).await {
            return Err(Error::unauthorized("All credentials for user revoked"));
        }
    }

    Ok(principal)
}

fn auth_outcome(request: &Request) -> AuthOutcome {
    request
        .extensions()
        .get::<AuthOutcome>()
        .cloned()
        .unwrap_or(AuthOutcome {
            principal: Principal::Anonymous,
            failure: None,
        })
}

/// Guard: authenticated principal able to use the notification API.
pub async fn require_user(request: Request, next: Next) -> Response {
    let outcome = auth_outcome(&request);

    match &outcome.principal {
        Principal::Anonymous => {
            let message = outcome
                .failure
                .unwrap_or_else(|| "Authentication required".to_string());
            ApiError(Error::unauthorized(message)).into_response()
        }
        _ => next.run(request).await,
    }
}

/// Guard: `ADMIN` authority.
pub async fn require_admin(request: Request, next: Next) -> Response {
    let outcome = auth_outcome(&request);

    match &outcome.principal {
        Principal::Anonymous => {
            let message = outcome
                .failure
                .unwrap_or_else(|| "Authentication required".to_string());
            ApiError(Error::unauthorized(message)).into_response()
        }
        principal if !principal.is_admin() => {
            ApiError(Error::forbidden("Admin authority required")).into_response()
        }
        _ => next.run(request).await,
    }
}
