use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::config::ModelRoutes;
use crate::routes::error::ProblemDetails;
use crate::state::AppState;

const ERROR_WINDOW_LIMIT: usize = 10;

/// GET /api_usage — the governor snapshot against configured limits.
pub async fn api_usage(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.governor.snapshot(state.registry.providers());
    Json(json!({
        "data": snapshot,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /api/config — the live model→provider mapping.
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ModelRoutes> {
    Json(state.registry.routes_snapshot())
}

/// POST /api/config — replace the mapping and persist the document.
pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(routes): Json<ModelRoutes>,
) -> Response {
    tracing::info!("🔄 [Admin] replacing model routes ({} model(s))", routes.len());
    state.registry.replace_routes(routes);

    match state.save_config().await {
        Ok(()) => Json(json!({"status": "success"})).into_response(),
        Err(e) => {
            tracing::error!("❌ [Admin] config write failed: {}", e);
            ProblemDetails::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Config Write Failed",
                e.to_string(),
            )
            .into_response()
        }
    }
}

/// GET /api/error_logs — recent error windows from the interaction log.
pub async fn error_logs(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"error_logs": state.log.error_windows(ERROR_WINDOW_LIMIT)}))
}

/// POST /api/reset_rate_limits — clears every window, daily count and
/// error ledger.
pub async fn reset_rate_limits(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.governor.reset_all();
    tracing::info!("🧹 [Admin] all rate limit counters cleared");
    Json(json!({"status": "success", "message": "all rate limit counters cleared"}))
}

/// GET / — the dashboard lives under /admin.
pub async fn root_redirect() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, "/admin")])
}
