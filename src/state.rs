use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Client;

use crate::config::{self, GatewayConfig};
use crate::gateway::governor::RateGovernor;
use crate::gateway::registry::ProviderRegistry;
use crate::logging::InteractionLog;

/// The global application state shared across all routes via Axum State.
pub struct AppState {
    /// Providers + model routes from the config document.
    pub registry: ProviderRegistry,

    /// The sole shared mutable accounting engine.
    pub governor: RateGovernor,

    /// Shared HTTP client — connection pool is reused across all upstream
    /// calls. Industry standard: one client per process, not per request.
    /// No global timeout: each dispatch path sets its own (60s buffered,
    /// 90s streaming, 30s health probe).
    pub http_client: Arc<Client>,

    /// Rotating REQUEST/RESPONSE interaction log.
    pub log: Arc<InteractionLog>,

    config_path: PathBuf,
    config_write_lock: tokio::sync::Mutex<()>,
}

impl AppState {
    pub fn new() -> Self {
        let config_path: PathBuf = std::env::var("GATEWAY_CONFIG")
            .unwrap_or_else(|_| "config.yaml".to_string())
            .into();
        let log_dir = std::env::var("GATEWAY_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let config = config::load(&config_path);
        Self::with_config(config, config_path, log_dir)
    }

    pub fn with_config(
        config: GatewayConfig,
        config_path: PathBuf,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        let http_client = Arc::new(
            Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .pool_max_idle_per_host(20)
                .build()
                .expect("Failed to build HTTP client"),
        );

        Self {
            registry: ProviderRegistry::new(config),
            governor: RateGovernor::new(),
            http_client,
            log: Arc::new(InteractionLog::new(log_dir)),
            config_path,
            config_write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Persists the live registry back to the config document. Admin writes
    /// are serialized so concurrent updates cannot interleave on disk.
    pub async fn save_config(&self) -> anyhow::Result<()> {
        let _guard = self.config_write_lock.lock().await;
        let document = GatewayConfig {
            api_provider: self.registry.providers().clone(),
            model_config: self.registry.routes_snapshot(),
        };
        config::save(&self.config_path, &document).await
    }
}
