//! Capability trait contracts consumed by the core from adapters.
//!
//! Every operation is tenant-scoped: the core never infers tenancy from
//! ambient state, so each trait method takes an explicit tenant identifier.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error surfaced by a capability adapter back to the core.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("operation not supported by this capability: {0}")]
    Unsupported(String),
    #[error("upstream error: {0}")]
    Upstream(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type CapabilityResult<T> = Result<T, CapabilityError>;

#[async_trait]
pub trait Search: Send + Sync {
    async fn index_document(&self, tenant: &str, id: &str, document: Value) -> CapabilityResult<()>;
    async fn search(&self, tenant: &str, query: &str) -> CapabilityResult<Vec<Value>>;
    async fn hybrid_search(&self, tenant: &str, query: &str) -> CapabilityResult<Vec<Value>>;
    async fn delete_document(&self, tenant: &str, id: &str) -> CapabilityResult<()>;
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, tenant: &str, key: &str) -> CapabilityResult<Option<Value>>;
    async fn set(&self, tenant: &str, key: &str, value: Value, ttl: Option<Duration>) -> CapabilityResult<()>;
    async fn delete(&self, tenant: &str, key: &str) -> CapabilityResult<()>;
    async fn exists(&self, tenant: &str, key: &str) -> CapabilityResult<bool>;
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn put_object(&self, tenant: &str, key: &str, bytes: Vec<u8>) -> CapabilityResult<()>;
    async fn get_object(&self, tenant: &str, key: &str) -> CapabilityResult<Vec<u8>>;
    async fn delete_object(&self, tenant: &str, key: &str) -> CapabilityResult<()>;
    async fn list_objects(&self, tenant: &str, prefix: &str) -> CapabilityResult<Vec<String>>;
}

#[async_trait]
pub trait Compute: Send + Sync {
    async fn invoke(&self, tenant: &str, name: &str, payload: Value, run_async: bool) -> CapabilityResult<Value>;
    async fn schedule(&self, tenant: &str, config: Value) -> CapabilityResult<String>;
    async fn status(&self, tenant: &str, id: &str) -> CapabilityResult<Value>;
}

/// A single LLM completion request. `primary` names the caller's preferred
/// provider; the router reorders its cascade so that provider is tried first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub tenant: String,
    pub agent: Option<String>,
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub format: Option<String>,
    /// Caller-chosen provider to try first; the router reorders its cascade
    /// so this name (if it names a configured provider) goes first.
    pub primary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResult {
    pub content: String,
    pub model: String,
    pub tokens: u32,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub provider: String,
    pub cached: bool,
    pub estimated_cost: f64,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = CapabilityResult<String>> + Send>>;

#[async_trait]
pub trait Llm: Send + Sync {
    async fn generate(&self, request: LlmRequest) -> CapabilityResult<LlmResult>;
    async fn generate_stream(&self, request: LlmRequest) -> CapabilityResult<TokenStream>;
    async fn usage_stats(&self, filter: Value) -> CapabilityResult<Value>;
}

/// Three-level health classification. `degraded` is supplied per probe; the
/// engine composing probes does not invent the policy itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Worst-of ordering: `Unhealthy` > `Degraded` > `Healthy`.
    pub fn priority(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    pub fn is_problematic(self) -> bool {
        !matches!(self, HealthStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub healthy: bool,
    pub status: HealthStatus,
    pub latency_ms: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub observed_at: chrono::DateTime<chrono::Utc>,
    pub error: Option<String>,
    pub details: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealthMetrics {
    pub total_checks: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub uptime_pct: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_success_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for ServiceHealthMetrics {
    fn default() -> Self {
        Self {
            total_checks: 0,
            successes: 0,
            failures: 0,
            avg_latency_ms: 0.0,
            uptime_pct: 0.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success_at: None,
            last_failure_at: None,
        }
    }
}

impl ServiceHealthMetrics {
    /// Applies one probe outcome, maintaining the running mean latency,
    /// uptime percentage, and reciprocal consecutive counters.
    pub fn record(&mut self, result: &HealthCheckResult) {
        self.total_checks += 1;
        if result.healthy {
            self.successes += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.last_success_at = Some(result.observed_at);
            let n = self.successes as f64;
            self.avg_latency_ms += (result.latency_ms - self.avg_latency_ms) / n;
        } else {
            self.failures += 1;
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            self.last_failure_at = Some(result.observed_at);
        }
        self.uptime_pct = self.successes as f64 / self.total_checks as f64;
    }
}

#[async_trait]
pub trait Health: Send + Sync {
    async fn check(&self, service: &str) -> CapabilityResult<HealthCheckResult>;
    async fn check_all(&self) -> CapabilityResult<HashMap<String, HealthStatus>>;
    async fn metrics(&self, service: &str) -> CapabilityResult<ServiceHealthMetrics>;
}

/// A probe supplied by a capability provider. The engine composing probes
/// imposes its own timeout regardless of what the probe does internally.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> HealthCheckResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    Cloud,
    Local,
}

impl std::fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceMode::Cloud => write!(f, "cloud"),
            ServiceMode::Local => write!(f, "local"),
        }
    }
}
