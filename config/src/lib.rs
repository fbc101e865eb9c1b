//! Configuration surface for the resilience substrate.
//!
//! Scoped to exactly the fields the substrate's external interfaces name:
//! breaker defaults and per-service overrides, health probe cadence,
//! fallback/degradation/recovery tuning, and the LLM router's provider
//! priority and pricing. Whole-platform concerns (server bind address,
//! database credentials, secrets management) live in the platform's own
//! config crate, not here.

mod loader;
mod model;

pub use loader::{ConfigError, ConfigLoader};
pub use model::{
    default_degradable_operations, BreakerDefaults, BreakerOverride, DegradableOperation,
    FallbackConfig, FallbackStrategy, HealthConfig, LlmConfig, ModelPriceOverride,
    ResilienceConfig,
};
