use std::sync::RwLock;

use indexmap::IndexMap;

use crate::config::{GatewayConfig, ModelRoutes, ProviderConfig, RouteConfig};

/// Runtime view of the configuration document. Providers are fixed for the
/// process lifetime; the model routes can be replaced wholesale through the
/// admin surface. Readers take cloned snapshots so no lock outlives a call.
pub struct ProviderRegistry {
    providers: IndexMap<String, ProviderConfig>,
    routes: RwLock<ModelRoutes>,
}

impl ProviderRegistry {
    pub fn new(config: GatewayConfig) -> Self {
        Self { providers: config.api_provider, routes: RwLock::new(config.model_config) }
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.get(id)
    }

    pub fn providers(&self) -> &IndexMap<String, ProviderConfig> {
        &self.providers
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ModelRoutes> {
        self.routes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Logical model names in document order — the `auto` iteration order.
    pub fn model_names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// The ordered provider routes for one model, or None if unknown.
    pub fn routes_for(&self, model: &str) -> Option<IndexMap<String, RouteConfig>> {
        self.read().get(model).cloned()
    }

    pub fn routes_snapshot(&self) -> ModelRoutes {
        self.read().clone()
    }

    /// Replaces the whole model→provider mapping.
    pub fn replace_routes(&self, routes: ModelRoutes) {
        let mut guard = self.routes.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = routes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_from_yaml(yaml: &str) -> ProviderRegistry {
        ProviderRegistry::new(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn test_model_order_follows_document() {
        let registry = registry_from_yaml(
            "api_provider: {}\nmodel_config:\n  zeta: {}\n  alpha: {}\n  mid: {}\n",
        );
        assert_eq!(registry.model_names(), ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_replace_routes_swaps_mapping() {
        let registry = registry_from_yaml("api_provider: {}\nmodel_config:\n  old-model: {}\n");
        assert!(registry.routes_for("old-model").is_some());

        let mut new_routes = ModelRoutes::new();
        new_routes.insert("new-model".into(), IndexMap::new());
        registry.replace_routes(new_routes);

        assert!(registry.routes_for("old-model").is_none());
        assert_eq!(registry.model_names(), ["new-model"]);
    }
}
