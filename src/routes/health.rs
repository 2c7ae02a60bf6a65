use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, response::{IntoResponse, Response}, Json};
use serde::Deserialize;
use serde_json::json;

use crate::routes::error::ProblemDetails;
use crate::state::AppState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct HealthCheckRequest {
    pub provider: String,
    pub model: String,
}

/// POST /api/health_check — fires a tiny synthetic completion at the named
/// provider and reports round-trip health. Deliberately bypasses the
/// governor: a probe must not consume request budget.
pub async fn health_check(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HealthCheckRequest>,
) -> Response {
    let Some(provider) = state.registry.provider(&request.provider) else {
        return ProblemDetails::new(
            axum::http::StatusCode::NOT_FOUND,
            "Unknown Provider",
            format!("provider '{}' is not configured", request.provider),
        )
        .into_response();
    };

    let url = format!("{}/chat/completions", provider.base_url.trim_end_matches('/'));
    let probe = json!({
        "model": request.model,
        "messages": [{"role": "user", "content": "Hello"}],
        "max_tokens": 5,
    });

    let mut builder = state.http_client.post(&url).json(&probe).timeout(PROBE_TIMEOUT);
    if let Some(key) = &provider.api_key {
        builder = builder.bearer_auth(key);
    }

    let started = Instant::now();
    let outcome = builder.send().await;
    let response_time = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(upstream) if upstream.status().is_success() => {
            tracing::info!("💚 [Health] {} / {} ok in {}ms", request.provider, request.model, response_time);
            Json(json!({
                "status": "healthy",
                "provider": request.provider,
                "model": request.model,
                "response_time": response_time,
            }))
            .into_response()
        }
        Ok(upstream) => {
            let status = upstream.status();
            let text = upstream.text().await.unwrap_or_default();
            tracing::warn!("💔 [Health] {} / {} returned {}", request.provider, request.model, status);
            Json(json!({
                "status": "unhealthy",
                "provider": request.provider,
                "model": request.model,
                "response_time": response_time,
                "error": format!("upstream returned {}: {}", status, text),
            }))
            .into_response()
        }
        Err(e) => {
            tracing::warn!("💔 [Health] {} / {} unreachable: {}", request.provider, request.model, e);
            Json(json!({
                "status": "unhealthy",
                "provider": request.provider,
                "model": request.model,
                "response_time": response_time,
                "error": e.to_string(),
            }))
            .into_response()
        }
    }
}
