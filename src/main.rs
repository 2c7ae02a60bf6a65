use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod gateway;
mod logging;
mod routes;
mod state;

use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    if dotenvy::dotenv().is_err() {
        tracing::debug!("no .env file, reading configuration from the process environment");
    }

    let app_state = Arc::new(AppState::new());
    spawn_maintenance(app_state.clone());

    let app = Router::new()
        .route("/v1/models", get(routes::proxy::models).post(routes::proxy::models))
        .route("/v1/*path", post(routes::proxy::completions))
        .route("/api_usage", get(routes::admin::api_usage))
        .route("/api/config", get(routes::admin::get_config).post(routes::admin::update_config))
        .route("/api/error_logs", get(routes::admin::error_logs))
        .route("/api/health_check", post(routes::health::health_check))
        .route("/api/reset_rate_limits", post(routes::admin::reset_rate_limits))
        .route("/", get(routes::admin::root_redirect))
        .route_service("/admin", ServeFile::new("static/admin.html"))
        .nest_service("/static", ServeDir::new("static"))
        .with_state(app_state)
        // outermost layer: preflights must be answered before anything else runs
        .layer(cors_from_env());

    let port = std::env::var("PORT").unwrap_or_else(|_| "8100".to_string());
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    tracing::info!("🚀 LLM Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// RUST_LOG takes precedence; the default keeps the gateway chatty and
/// tower-http quiet.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "llm_gateway=debug,tower_http=info".into());
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

/// CORS for the admin page. ALLOWED_ORIGINS (comma-separated) narrows the
/// allow-list; unset or unparsable leaves it wide open.
fn cors_from_env() -> CorsLayer {
    let configured = std::env::var("ALLOWED_ORIGINS").unwrap_or_default();
    let origins: Vec<HeaderValue> =
        configured.split(',').filter_map(|origin| origin.trim().parse().ok()).collect();

    if origins.is_empty() {
        if !configured.trim().is_empty() {
            tracing::warn!("🌐 ALLOWED_ORIGINS contained no parsable origin, CORS stays open");
        }
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    tracing::info!("🌐 CORS allow-list active ({} origin(s))", origins.len());
    CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
}

/// Two long-lived governor chores: the rpd rollover at local midnight and a
/// periodic error-ledger sweep. Both take the governor lock only briefly.
fn spawn_maintenance(state: Arc<AppState>) {
    let midnight_state = state.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(duration_until_local_midnight()).await;
            midnight_state.governor.reset_daily();
            tracing::info!("🕛 [Scheduler] daily request counters reset");
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            state.governor.sweep_errors();
            tracing::debug!("🧹 [Scheduler] error ledgers swept");
        }
    });
}

/// Wall-clock gap to the next local midnight, when `rpd` counters reset.
fn duration_until_local_midnight() -> Duration {
    use chrono::TimeZone;

    let now = chrono::Local::now();
    let tomorrow = match now.date_naive().succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0)) {
        Some(t) => t,
        None => return Duration::from_secs(24 * 3600),
    };
    match chrono::Local.from_local_datetime(&tomorrow).earliest() {
        Some(midnight) => (midnight - now).to_std().unwrap_or(Duration::from_secs(60)),
        // DST gap exactly at midnight: try again in a day
        None => Duration::from_secs(24 * 3600),
    }
}
