//! Capability trait contracts consumed by the resilience core from adapters,
//! plus the cloud/local service registry.
//!
//! Concrete adapters (S3, Redis, OpenSearch, Bedrock, …) live outside this
//! workspace and implement these traits. The `local` module ships in-memory
//! stand-ins used by the demo binary and by tests.

mod capability;
mod registry;

pub mod local;

pub use capability::{
    Cache, CapabilityError, CapabilityResult, Compute, Health, HealthCheckResult, HealthProbe,
    HealthStatus, Llm, LlmRequest, LlmResult, Search, ServiceHealthMetrics, ServiceMode, Storage,
    TokenStream,
};
pub use registry::{Capability, ServiceRegistry};
