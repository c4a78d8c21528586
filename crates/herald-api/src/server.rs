//! Router assembly and HTTP serving.
//!
//! Auth guards are attached with `route_layer`, so they only run for
//! matched routes: an unknown path reaches the fallback and produces a
//! 404, never an authentication challenge. Credential parsing and rate
//! limiting run for every matched request; the envelope and
//! correlation layers wrap everything.

use std::net::SocketAddr;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::envelope::{envelope_layer, not_found};
use crate::middleware::{authenticate, rate_limit_layer, require_admin, require_user};
use crate::middleware::correlation::correlation_layer;
use crate::routes::{admin, health, notifications, preferences, templates};
use crate::state::AppState;
use herald_core::{Error, Result};

pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health::liveness))
        .route("/actuator/health", get(health::readiness))
        .route("/actuator/prometheus", get(health::prometheus));

    let user_api = Router::new()
        .route(
            "/api/v1/notifications",
            get(notifications::list).post(notifications::create),
        )
        .route(
            "/api/v1/notifications/bulk-read",
            post(notifications::bulk_mark_read),
        )
        .route("/api/v1/notifications/:id/read", put(notifications::mark_read))
        .route(
            "/api/v1/notifications/:id",
            axum::routing::delete(notifications::delete),
        )
        .route(
            "/api/v1/preferences",
            get(preferences::get).put(preferences::update),
        )
        .route_layer(from_fn(require_user));

    let admin_api = Router::new()
        .route("/admin/cleanup/run", post(admin::cleanup_run))
        .route("/admin/cleanup/run-async", post(admin::cleanup_run_async))
        .route("/admin/cleanup/user/:id", post(admin::cleanup_user))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/export", get(admin::export))
        .route("/admin/config", get(admin::config))
        .route(
            "/admin/dlq/:queue",
            get(admin::dlq_list).delete(admin::dlq_purge),
        )
        .route("/admin/dlq/replay/:id", post(admin::dlq_replay))
        .route(
            "/api/v1/admin/templates",
            get(templates::list).post(templates::create),
        )
        .route(
            "/api/v1/admin/templates/:id",
            get(templates::get)
                .put(templates::update)
                .delete(templates::delete),
        )
        .route_layer(from_fn(require_admin));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(public)
        .merge(user_api)
        .merge(admin_api)
        .fallback(not_found)
        .layer(from_fn_with_state(state.clone(), rate_limit_layer))
        .layer(from_fn_with_state(state.clone(), authenticate))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(envelope_layer))
        .layer(from_fn(correlation_layer))
        .layer(cors)
        .with_state(state)
}

/// Serve the router until the shutdown signal resolves.
pub async fn serve(
    router: Router,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = SocketAddr::from((
        host.parse::<std::net::IpAddr>()
            .map_err(|e| Error::Config(format!("Invalid host: {}", e)))?,
        port,
    ));

    info!("Herald API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(Error::Io)?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::Io)?;

    Ok(())
}
