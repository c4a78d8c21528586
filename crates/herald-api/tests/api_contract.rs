//! Contract tests for the middleware stack: envelope shape,
//! correlation propagation, and route-matching order (unknown paths
//! produce 404, never an authentication challenge).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::from_fn;
use axum::routing::get;
use axum::Router;
use herald_api::envelope::{envelope_layer, not_found};
use herald_api::middleware::correlation::correlation_layer;
use herald_api::middleware::require_user;
use tower::ServiceExt;

async fn ok_handler() -> &'static str {
    "ok"
}

/// Router with the same layer ordering as the real server, minus the
/// stateful layers.
fn test_router() -> Router {
    let guarded = Router::new()
        .route("/api/v1/notifications", get(ok_handler))
        .route_layer(from_fn(require_user));

    Router::new()
        .route("/health", get(ok_handler))
        .merge(guarded)
        .fallback(not_found)
        .layer(from_fn(envelope_layer))
        .layer(from_fn(correlation_layer))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn unknown_path_is_404_with_envelope() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_json(response).await;
    assert_eq!(body["status"], 404);
    assert_eq!(body["error"], "Not Found");
    assert_eq!(body["path"], "/api/v1/does-not-exist");
    assert!(body["correlationId"].is_string());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn unknown_path_prefers_404_over_401() {
    // No credentials at all: a guarded route challenges, an unknown
    // route does not.
    let known = test_router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/notifications")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(known.status(), StatusCode::UNAUTHORIZED);

    let unknown = test_router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/unknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn correlation_id_is_propagated() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .uri("/missing")
                .header("x-correlation-id", "corr-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response.headers().get("x-correlation-id").unwrap(),
        "corr-42"
    );
    let body = body_json(response).await;
    assert_eq!(body["correlationId"], "corr-42");
}

#[tokio::test]
async fn correlation_id_is_minted_when_absent() {
    let response = test_router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let minted = response.headers().get("x-correlation-id").unwrap();
    assert!(!minted.to_str().unwrap().is_empty());
}

#[tokio::test]
async fn unauthorized_envelope_carries_message() {
    let response = test_router()
        .oneshot(
            Request::builder()
                .uri("/api/v1/notifications")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let body = body_json(response).await;
    assert_eq!(body["status"], 401);
    assert_eq!(body["error"], "Unauthorized");
    assert_eq!(body["path"], "/api/v1/notifications");
}
