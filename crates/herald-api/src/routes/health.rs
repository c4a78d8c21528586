//! Health probes and the metrics scrape endpoint. All public.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::state::AppState;

/// `GET /health`: liveness: the process is up.
pub async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "UP" }))
}

/// `GET /actuator/health`: readiness: store, broker, and cache all
/// reachable.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let db_up = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let broker_up = state.broker.is_connected();
    let cache_up = state.cache.health_check().await;

    let all_up = db_up && broker_up && cache_up;
    let status = if all_up { "UP" } else { "DOWN" };

    let body = Json(serde_json::json!({
        "status": status,
        "components": {
            "db": { "status": if db_up { "UP" } else { "DOWN" } },
            "broker": { "status": if broker_up { "UP" } else { "DOWN" } },
            "cache": { "status": if cache_up { "UP" } else { "DOWN" } },
        }
    }));

    let code = if all_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, body)
}

/// `GET /actuator/prometheus`: metrics scrape body.
pub async fn prometheus(State(state): State<AppState>) -> String {
    state.metrics.render()
}
