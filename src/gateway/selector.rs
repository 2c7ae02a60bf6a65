use thiserror::Error;

use crate::gateway::governor::RateGovernor;
use crate::gateway::registry::ProviderRegistry;

/// Models whose name starts with this prefix route to the first logical
/// model with remaining capacity instead of a fixed one.
const AUTO_PREFIX: &str = "auto";

/// The outcome of a successful selection. `upstream_model` is what the
/// outbound body's `model` field must become: the binding's alias when one
/// is configured, or — in auto mode — the concrete model that won, so the
/// literal `auto` name never reaches an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub provider_id: String,
    pub model: String,
    pub upstream_model: Option<String>,
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("model '{0}' is not configured")]
    UnknownModel(String),
    #[error("no provider has remaining capacity for model '{0}'")]
    NoCapacity(String),
}

/// Picks a provider for `model_name` and commits its budget in the same
/// step. Exactly one selection happens per inbound request; failover only
/// exists here, never after dispatch begins.
pub fn select(
    registry: &ProviderRegistry,
    governor: &RateGovernor,
    model_name: &str,
    tokens: u64,
) -> Result<Selection, SelectError> {
    if model_name.starts_with(AUTO_PREFIX) {
        for candidate in registry.model_names() {
            if let Ok(mut selection) = select_for_model(registry, governor, &candidate, tokens) {
                if selection.upstream_model.is_none() {
                    selection.upstream_model = Some(candidate);
                }
                return Ok(selection);
            }
        }
        return Err(SelectError::NoCapacity(model_name.to_string()));
    }
    select_for_model(registry, governor, model_name, tokens)
}

fn select_for_model(
    registry: &ProviderRegistry,
    governor: &RateGovernor,
    model: &str,
    tokens: u64,
) -> Result<Selection, SelectError> {
    let routes = registry
        .routes_for(model)
        .ok_or_else(|| SelectError::UnknownModel(model.to_string()))?;

    for (provider_id, route) in routes {
        if !route.enable {
            continue;
        }
        let Some(provider) = registry.provider(&provider_id) else {
            tracing::warn!("⚠️ [Selector] model {} routes to unregistered provider '{}'", model, provider_id);
            continue;
        };
        if let Some(minutes) = governor.error_state(&provider_id) {
            tracing::warn!(
                "⛔ [Selector] {} is error-limited for {} more minute(s), skipping for model {}",
                provider_id, minutes, model
            );
            continue;
        }
        match governor.try_admit_and_commit(&provider_id, &provider.limits, tokens) {
            Ok(()) => {
                tracing::info!("✅ [Selector] model {} → {} ({} tokens)", model, provider_id, tokens);
                return Ok(Selection {
                    provider_id,
                    model: model.to_string(),
                    upstream_model: route.alias,
                });
            }
            Err(rejection) => {
                tracing::warn!("🚦 [Selector] {} rejected model {}: {}", provider_id, model, rejection);
            }
        }
    }
    Err(SelectError::NoCapacity(model.to_string()))
}
