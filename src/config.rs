use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Model routes, keyed `model name → provider id → route`.
/// IndexMap preserves the YAML document order on both levels: model order is
/// the `auto` iteration order, provider order is the failover priority.
pub type ModelRoutes = IndexMap<String, IndexMap<String, RouteConfig>>;

/// The on-disk configuration document (`config.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub api_provider: IndexMap<String, ProviderConfig>,
    #[serde(default)]
    pub model_config: ModelRoutes,
}

/// A concrete upstream endpoint. Endpoint, key and limits are fixed for the
/// process lifetime; only the model routes are mutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub limits: Limits,
}

/// Per-provider quota ceilings. A missing field means unlimited on that
/// dimension.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Limits {
    /// Requests per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u64>,
    /// Tokens per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u64>,
    /// Requests per calendar day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpd: Option<u64>,
    /// Tokens per single request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpr: Option<u64>,
}

/// One entry in a model's ordered provider list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Upstream model name to substitute for the logical one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

fn default_enable() -> bool {
    true
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self { enable: true, alias: None }
    }
}

/// Loads the configuration document from disk.
/// Falls back to an empty config if the file is missing or unparsable, so the
/// server still boots for admin-driven configuration.
pub fn load(path: &Path) -> GatewayConfig {
    if path.exists() {
        match fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<GatewayConfig>(&content) {
                Ok(config) => {
                    tracing::info!(
                        "✅ Loaded {} provider(s) and {} model route(s) from {}",
                        config.api_provider.len(),
                        config.model_config.len(),
                        path.display()
                    );
                    return config;
                }
                Err(e) => tracing::error!(
                    file = %path.display(),
                    error = %e,
                    "❌ [Config] YAML parse failure — starting with an empty config"
                ),
            },
            Err(e) => tracing::error!(
                file = %path.display(),
                error = %e,
                "❌ [Config] File read failure — starting with an empty config"
            ),
        }
    } else {
        tracing::warn!("⚠️ [Config] {} not found — starting with an empty config", path.display());
    }
    GatewayConfig::default()
}

/// Persists the full configuration document to disk as YAML.
/// Uses `tokio::fs` to avoid blocking the async runtime.
pub async fn save(path: &Path, config: &GatewayConfig) -> Result<()> {
    let content = serde_yaml::to_string(config)?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
api_provider:
  openai_main:
    base_url: https://api.openai.com/v1
    api_key: sk-test
    limits: { rpm: 60, tpm: 100000, rpd: 5000, tpr: 8000 }
  local_vllm:
    base_url: http://127.0.0.1:8000/v1
    api_key: null
model_config:
  gpt-4o:
    openai_main:
      enable: true
  llama-70b:
    local_vllm:
      alias: meta-llama/Llama-3-70B
    openai_main:
      enable: false
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.api_provider.len(), 2);
        assert_eq!(config.api_provider["openai_main"].limits.rpm, Some(60));
        assert_eq!(config.api_provider["local_vllm"].api_key, None);
        assert_eq!(config.api_provider["local_vllm"].limits, Limits::default());

        // route order is the failover priority
        let llama = &config.model_config["llama-70b"];
        let order: Vec<&String> = llama.keys().collect();
        assert_eq!(order, ["local_vllm", "openai_main"]);
        assert_eq!(llama["local_vllm"].alias.as_deref(), Some("meta-llama/Llama-3-70B"));
        assert!(llama["local_vllm"].enable, "enable defaults to true");
        assert!(!llama["openai_main"].enable);
    }

    #[test]
    fn test_roundtrip_preserves_order() {
        let yaml = "api_provider:\n  b: { base_url: http://b }\n  a: { base_url: http://a }\nmodel_config: {}\n";
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        let rendered = serde_yaml::to_string(&config).unwrap();
        let reparsed: GatewayConfig = serde_yaml::from_str(&rendered).unwrap();
        let order: Vec<&String> = reparsed.api_provider.keys().collect();
        assert_eq!(order, ["b", "a"]);
    }

    #[test]
    fn test_load_missing_file_yields_empty() {
        let path = std::env::temp_dir().join(format!("gateway_cfg_{}.yaml", uuid::Uuid::new_v4()));
        let config = load(&path);
        assert!(config.api_provider.is_empty());
        assert!(config.model_config.is_empty());
    }
}
