use crate::config::GatewayConfig;
use crate::gateway::governor::RateGovernor;
use crate::gateway::registry::ProviderRegistry;
use crate::gateway::selector::{self, SelectError};

fn registry_from_yaml(yaml: &str) -> ProviderRegistry {
    let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
    ProviderRegistry::new(config)
}

// ─────────────────────────────────────────────────────────
//  SELECTOR FAILOVER
// ─────────────────────────────────────────────────────────

#[test]
fn test_selector_prefers_first_binding() {
    let registry = registry_from_yaml(
        r#"
api_provider:
  p1: { base_url: "http://p1" }
  p2: { base_url: "http://p2" }
model_config:
  m:
    p1: {}
    p2: {}
"#,
    );
    let governor = RateGovernor::new();

    let selection = selector::select(&registry, &governor, "m", 100).unwrap();
    assert_eq!(selection.provider_id, "p1");
    assert_eq!(selection.model, "m");
    assert_eq!(selection.upstream_model, None);
}

#[test]
fn test_selector_fails_over_past_error_limited_provider() {
    let registry = registry_from_yaml(
        r#"
api_provider:
  p1: { base_url: "http://p1" }
  p2: { base_url: "http://p2" }
model_config:
  m:
    p1: {}
    p2: {}
"#,
    );
    let governor = RateGovernor::new();
    governor.record_error("p1");

    let selection = selector::select(&registry, &governor, "m", 100).unwrap();
    assert_eq!(selection.provider_id, "p2");

    // only p2's counters moved
    let snap = governor.snapshot(registry.providers());
    assert_eq!(snap["p1"].rpm.current, 0);
    assert_eq!(snap["p2"].rpm.current, 1);
    assert_eq!(snap["p2"].tpm.current, 100);
}

#[test]
fn test_selector_skips_disabled_bindings() {
    let registry = registry_from_yaml(
        r#"
api_provider:
  p1: { base_url: "http://p1" }
  p2: { base_url: "http://p2" }
model_config:
  m:
    p1: { enable: false }
    p2: { alias: upstream-m }
"#,
    );
    let governor = RateGovernor::new();

    let selection = selector::select(&registry, &governor, "m", 5).unwrap();
    assert_eq!(selection.provider_id, "p2");
    assert_eq!(selection.upstream_model.as_deref(), Some("upstream-m"));
}

#[test]
fn test_selector_exhaustion_is_no_capacity() {
    let registry = registry_from_yaml(
        r#"
api_provider:
  p1: { base_url: "http://p1", limits: { rpm: 1 } }
model_config:
  m:
    p1: {}
"#,
    );
    let governor = RateGovernor::new();

    selector::select(&registry, &governor, "m", 1).unwrap();
    let err = selector::select(&registry, &governor, "m", 1).unwrap_err();
    assert!(matches!(err, SelectError::NoCapacity(_)));
}

#[test]
fn test_selector_unknown_model() {
    let registry = registry_from_yaml("api_provider: {}\nmodel_config: {}\n");
    let governor = RateGovernor::new();
    let err = selector::select(&registry, &governor, "does-not-exist", 1).unwrap_err();
    assert!(matches!(err, SelectError::UnknownModel(_)));
}

// ─────────────────────────────────────────────────────────
//  AUTO ROUTING
// ─────────────────────────────────────────────────────────

#[test]
fn test_auto_routing_falls_through_models_in_order() {
    // model A → P1 (rpm=1), model B → P2 (rpm=10)
    let registry = registry_from_yaml(
        r#"
api_provider:
  P1: { base_url: "http://p1", limits: { rpm: 1 } }
  P2: { base_url: "http://p2", limits: { rpm: 10 } }
model_config:
  A:
    P1: {}
  B:
    P2: {}
"#,
    );
    let governor = RateGovernor::new();

    // first auto request lands on A/P1
    let first = selector::select(&registry, &governor, "auto", 10).unwrap();
    assert_eq!(first.provider_id, "P1");
    assert_eq!(first.model, "A");
    // the literal "auto" must never reach an upstream
    assert_eq!(first.upstream_model.as_deref(), Some("A"));

    // second one: A/P1 is out of rpm budget, falls through to B/P2
    let second = selector::select(&registry, &governor, "auto", 10).unwrap();
    assert_eq!(second.provider_id, "P2");
    assert_eq!(second.model, "B");
    assert_eq!(second.upstream_model.as_deref(), Some("B"));
}

#[test]
fn test_auto_prefix_matches_variants() {
    let registry = registry_from_yaml(
        r#"
api_provider:
  P1: { base_url: "http://p1" }
model_config:
  A:
    P1: { alias: real-a }
"#,
    );
    let governor = RateGovernor::new();

    let selection = selector::select(&registry, &governor, "auto-fast", 1).unwrap();
    assert_eq!(selection.model, "A");
    // a configured alias wins over the auto substitution
    assert_eq!(selection.upstream_model.as_deref(), Some("real-a"));
}

#[test]
fn test_auto_with_no_admissible_model_is_no_capacity() {
    let registry = registry_from_yaml(
        r#"
api_provider:
  P1: { base_url: "http://p1", limits: { tpr: 10 } }
model_config:
  A:
    P1: {}
"#,
    );
    let governor = RateGovernor::new();
    let err = selector::select(&registry, &governor, "auto", 50).unwrap_err();
    assert!(matches!(err, SelectError::NoCapacity(_)));
}
