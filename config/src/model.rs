//! The configuration data model: breaker defaults, health, fallback, and LLM
//! router settings. Mirrors the nested record named in the external
//! interfaces of the substrate, scoped to exactly those fields — no
//! `ServerConfig`, `DatabaseConfig`, or other whole-platform concerns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub breaker: BreakerDefaults,
    pub health: HealthConfig,
    pub fallback: FallbackConfig,
    pub llm: LlmConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerDefaults::default(),
            health: HealthConfig::default(),
            fallback: FallbackConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl ResilienceConfig {
    /// Runs each section's own `Validate` impl, matching the teacher's
    /// pattern of validating one flat struct at a time rather than relying
    /// on nested-derive attributes whose syntax drifts across `validator`
    /// releases.
    pub fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.breaker.validate()?;
        self.health.validate()?;
        self.fallback.validate()?;
        self.llm.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BreakerDefaults {
    #[validate(range(min = 1, message = "failure_threshold must be at least 1"))]
    pub failure_threshold: u32,
    #[validate(range(min = 1, message = "call_timeout_sec must be at least 1"))]
    pub call_timeout_sec: u64,
    #[validate(range(min = 1, message = "half_open_max must be at least 1"))]
    pub half_open_max: u32,
    #[validate(range(min = 1.0, message = "backoff_multiplier must be >= 1.0"))]
    pub backoff_multiplier: f64,
    #[validate(range(min = 1, message = "max_backoff_sec must be at least 1"))]
    pub max_backoff_sec: u64,
    #[validate(range(min = 0.0, max = 1.0, message = "jitter_fraction must be within [0, 1]"))]
    pub jitter_fraction: f64,
    /// Per-service overrides, keyed by logical service name.
    #[serde(default)]
    pub overrides: HashMap<String, BreakerOverride>,
}

impl Default for BreakerDefaults {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            call_timeout_sec: 60,
            half_open_max: 3,
            backoff_multiplier: 2.0,
            max_backoff_sec: 300,
            jitter_fraction: 0.1,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerOverride {
    pub failure_threshold: Option<u32>,
    pub call_timeout_sec: Option<u64>,
    pub half_open_max: Option<u32>,
    pub backoff_multiplier: Option<f64>,
    pub max_backoff_sec: Option<u64>,
    pub jitter_fraction: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HealthConfig {
    #[validate(range(min = 1, message = "probe_interval_sec must be at least 1"))]
    pub probe_interval_sec: u64,
    #[validate(range(min = 1, message = "probe_timeout_sec must be at least 1"))]
    pub probe_timeout_sec: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { probe_interval_sec: 30, probe_timeout_sec: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    Immediate,
    Gradual,
    Selective,
}

impl Default for FallbackStrategy {
    fn default() -> Self {
        FallbackStrategy::Immediate
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradableOperation {
    pub service: String,
    pub operation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FallbackConfig {
    pub strategy: FallbackStrategy,
    #[validate(range(min = 1, message = "recovery_threshold must be at least 1"))]
    pub recovery_threshold: u32,
    #[validate(range(min = 1, message = "max_recovery_attempts must be at least 1"))]
    pub max_recovery_attempts: u32,
    #[validate(range(min = 1, message = "recovery_probe_interval_sec must be at least 1"))]
    pub recovery_probe_interval_sec: u64,
    #[validate(range(min = 1, message = "degradation_timeout_sec must be at least 1"))]
    pub degradation_timeout_sec: u64,
    pub degradable_operations: Vec<DegradableOperation>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            strategy: FallbackStrategy::Immediate,
            recovery_threshold: 3,
            max_recovery_attempts: 5,
            recovery_probe_interval_sec: 15,
            degradation_timeout_sec: 300,
            degradable_operations: default_degradable_operations(),
        }
    }
}

/// The minimum required degradation table named by the substrate: search's
/// hybrid search, cache reads/writes, and storage listing.
pub fn default_degradable_operations() -> Vec<DegradableOperation> {
    vec![
        DegradableOperation { service: "search".into(), operation: "hybrid_search".into() },
        DegradableOperation { service: "cache".into(), operation: "get".into() },
        DegradableOperation { service: "cache".into(), operation: "exists".into() },
        DegradableOperation { service: "cache".into(), operation: "set".into() },
        DegradableOperation { service: "cache".into(), operation: "delete".into() },
        DegradableOperation { service: "storage".into(), operation: "list_objects".into() },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPriceOverride {
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LlmConfig {
    #[validate(length(min = 1, message = "provider_priority must name at least one provider"))]
    pub provider_priority: Vec<String>,
    #[validate(range(min = 1, message = "cache_ttl_sec must be at least 1"))]
    pub cache_ttl_sec: u64,
    #[validate(range(min = 1, message = "failure_threshold must be at least 1"))]
    pub failure_threshold: u32,
    #[serde(default)]
    pub price_overrides: HashMap<String, ModelPriceOverride>,
    #[validate(range(min = 0.0, max = 1.0, message = "default_input_ratio must be within [0, 1]"))]
    pub default_input_ratio: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider_priority: vec!["bedrock".into(), "openai".into(), "local".into()],
            cache_ttl_sec: 3600,
            failure_threshold: 3,
            price_overrides: HashMap::new(),
            default_input_ratio: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ResilienceConfig::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.call_timeout_sec, 60);
        assert_eq!(config.health.probe_interval_sec, 30);
        assert_eq!(config.fallback.recovery_threshold, 3);
        assert_eq!(config.llm.cache_ttl_sec, 3600);
        assert_eq!(config.fallback.degradable_operations.len(), 6);
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(ResilienceConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_failure_threshold_fails_validation() {
        let mut config = ResilienceConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
