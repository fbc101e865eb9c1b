//! LLM multi-provider router: the same breaker primitive specialized for a
//! cascade of providers rather than a single cloud/local pair, plus response
//! caching and cost/usage accounting layered on top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_agency_interfaces::{CapabilityResult, Llm, LlmRequest, LlmResult, TokenStream};
use agent_agency_resilience_config::LlmConfig;
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use crate::circuit_breaker::{BreakerRegistry, BreakerState};
use crate::error::{ResilienceError, ResilienceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmProvider {
    Bedrock,
    OpenAi,
    Local,
}

impl LlmProvider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "bedrock" => Some(LlmProvider::Bedrock),
            "openai" => Some(LlmProvider::OpenAi),
            "local" => Some(LlmProvider::Local),
            _ => None,
        }
    }

    fn breaker_key(self) -> String {
        format!("llm:{self}")
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LlmProvider::Bedrock => "bedrock",
            LlmProvider::OpenAi => "openai",
            LlmProvider::Local => "local",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProviderHealth {
    pub available: bool,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self { available: true, total_calls: 0, successes: 0, failures: 0, consecutive_failures: 0, avg_latency_ms: 0.0 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ModelPrice {
    input_cost_per_1k: f64,
    output_cost_per_1k: f64,
}

const DEFAULT_PRICING: &[(&str, f64, f64)] = &[
    ("anthropic.claude-3-sonnet-20240229-v1:0", 0.003, 0.015),
    ("anthropic.claude-3-haiku-20240307-v1:0", 0.00025, 0.00125),
    ("gpt-4o", 0.005, 0.015),
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("local", 0.0, 0.0),
];

fn build_pricing_table(config: &LlmConfig) -> HashMap<String, ModelPrice> {
    let mut table: HashMap<String, ModelPrice> = DEFAULT_PRICING
        .iter()
        .map(|(model, input, output)| {
            (model.to_string(), ModelPrice { input_cost_per_1k: *input, output_cost_per_1k: *output })
        })
        .collect();
    for (model, price) in &config.price_overrides {
        table.insert(
            model.clone(),
            ModelPrice { input_cost_per_1k: price.input_cost_per_1k, output_cost_per_1k: price.output_cost_per_1k },
        );
    }
    table
}

/// `H(tenant || model || temperature || max_tokens || prompt)`, tenant
/// always first so two tenants never collide even on identical prompts.
fn fingerprint(tenant: &str, model: &str, temperature: f32, max_tokens: u32, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant.as_bytes());
    hasher.update(model.as_bytes());
    hasher.update(temperature.to_bits().to_be_bytes());
    hasher.update(max_tokens.to_be_bytes());
    hasher.update(prompt.as_bytes());
    hasher.finalize().iter().map(|byte| format!("{byte:02x}")).collect()
}

fn estimate_cost(
    pricing: &HashMap<String, ModelPrice>,
    model: &str,
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
    input_ratio: f64,
) -> f64 {
    let price = pricing.get(model).copied().unwrap_or_default();
    let (input_tokens, output_tokens) = if prompt_tokens + completion_tokens > 0 {
        (prompt_tokens, completion_tokens)
    } else {
        let input = (total_tokens as f64 * input_ratio).round() as u32;
        (input, total_tokens.saturating_sub(input))
    };
    price.input_cost_per_1k * (input_tokens as f64 / 1000.0) + price.output_cost_per_1k * (output_tokens as f64 / 1000.0)
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub tenant: String,
    pub agent: Option<String>,
    pub model: String,
    pub provider: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub latency_ms: f64,
    pub cached: bool,
    pub success: bool,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Usage records are forwarded best-effort and never re-read by the router;
/// a sink that drops records on the floor is a valid implementation.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord);
}

pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: UsageRecord) {}
}

#[derive(Clone)]
struct CachedResponse {
    content: String,
    model: String,
    tokens: u32,
    prompt_tokens: u32,
    completion_tokens: u32,
    provider: String,
    cost: f64,
    created_at: Instant,
}

pub struct LlmRouter {
    breakers: Arc<BreakerRegistry>,
    provider_priority: RwLock<Vec<LlmProvider>>,
    adapters: HashMap<LlmProvider, Arc<dyn Llm>>,
    health: RwLock<HashMap<LlmProvider, ProviderHealth>>,
    cache: Mutex<HashMap<(String, String), CachedResponse>>,
    cache_ttl: Duration,
    failure_threshold: u32,
    pricing: HashMap<String, ModelPrice>,
    default_input_ratio: f64,
    usage_sink: Arc<dyn UsageSink>,
}

impl LlmRouter {
    pub fn new(
        adapters: HashMap<LlmProvider, Arc<dyn Llm>>,
        breakers: Arc<BreakerRegistry>,
        config: &LlmConfig,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Arc<Self> {
        let provider_priority = config.provider_priority.iter().filter_map(|name| LlmProvider::parse(name)).collect();
        Arc::new(Self {
            breakers,
            provider_priority: RwLock::new(provider_priority),
            adapters,
            health: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(config.cache_ttl_sec),
            failure_threshold: config.failure_threshold,
            pricing: build_pricing_table(config),
            default_input_ratio: config.default_input_ratio,
            usage_sink,
        })
    }

    async fn cascade_order(&self, primary: Option<&str>) -> Vec<LlmProvider> {
        let mut order = self.provider_priority.read().await.clone();
        if let Some(primary) = primary.and_then(LlmProvider::parse) {
            if let Some(pos) = order.iter().position(|provider| *provider == primary) {
                order.remove(pos);
                order.insert(0, primary);
            }
        }
        order
    }

    async fn record_provider_success(&self, provider: LlmProvider, latency_ms: f64) {
        let mut health = self.health.write().await;
        let entry = health.entry(provider).or_default();
        entry.total_calls += 1;
        entry.successes += 1;
        entry.consecutive_failures = 0;
        entry.available = true;
        entry.avg_latency_ms = 0.3 * latency_ms + 0.7 * entry.avg_latency_ms;
    }

    async fn record_provider_failure(&self, provider: LlmProvider) {
        let mut health = self.health.write().await;
        let entry = health.entry(provider).or_default();
        entry.total_calls += 1;
        entry.failures += 1;
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.failure_threshold {
            entry.available = false;
        }
    }

    pub async fn provider_health(&self, provider: LlmProvider) -> ProviderHealth {
        self.health.read().await.get(&provider).copied().unwrap_or_default()
    }

    pub async fn reset_provider(&self, provider: LlmProvider) {
        self.health.write().await.insert(provider, ProviderHealth::default());
    }

    async fn cache_get(&self, tenant: &str, fingerprint: &str) -> Option<CachedResponse> {
        let mut cache = self.cache.lock().await;
        let key = (tenant.to_string(), fingerprint.to_string());
        let expired = cache.get(&key).map(|entry| entry.created_at.elapsed() > self.cache_ttl).unwrap_or(false);
        if expired {
            cache.remove(&key);
            return None;
        }
        cache.get(&key).cloned()
    }

    async fn cache_put(&self, tenant: &str, fingerprint: &str, result: &LlmResult) {
        self.cache.lock().await.insert(
            (tenant.to_string(), fingerprint.to_string()),
            CachedResponse {
                content: result.content.clone(),
                model: result.model.clone(),
                tokens: result.tokens,
                prompt_tokens: result.prompt_tokens,
                completion_tokens: result.completion_tokens,
                provider: result.provider.clone(),
                cost: result.estimated_cost,
                created_at: Instant::now(),
            },
        );
    }

    /// Cascades across the ordered provider list, skipping open breakers,
    /// returning on the first success, and exhausting to `AllProvidersDown`
    /// when every provider refuses or fails.
    pub async fn generate(self: &Arc<Self>, request: LlmRequest) -> ResilienceResult<LlmResult> {
        let fingerprint = fingerprint(&request.tenant, &request.model, request.temperature, request.max_tokens, &request.prompt);

        if let Some(cached) = self.cache_get(&request.tenant, &fingerprint).await {
            let result = LlmResult {
                content: cached.content,
                model: cached.model.clone(),
                tokens: cached.tokens,
                prompt_tokens: cached.prompt_tokens,
                completion_tokens: cached.completion_tokens,
                provider: cached.provider.clone(),
                cached: true,
                estimated_cost: cached.cost,
            };
            self.emit_usage(&request, &result, 0.0, true).await;
            return Ok(result);
        }

        let order = self.cascade_order(request.primary.as_deref()).await;
        let mut last_error: Option<String> = None;
        for provider in order {
            let breaker = self.breakers.get_or_create(&provider.breaker_key()).await;
            if breaker.state() == BreakerState::Open {
                continue;
            }
            let adapter = match self.adapters.get(&provider) {
                Some(adapter) => adapter.clone(),
                None => continue,
            };

            let started = Instant::now();
            let req = request.clone();
            let outcome = breaker.call(|| adapter.generate(req)).await;
            let latency_ms = started.elapsed().as_millis() as f64;

            match outcome {
                Ok(mut result) => {
                    self.record_provider_success(provider, latency_ms).await;
                    result.provider = provider.to_string();
                    result.cached = false;
                    result.estimated_cost = estimate_cost(
                        &self.pricing,
                        &result.model,
                        result.prompt_tokens,
                        result.completion_tokens,
                        result.tokens,
                        self.default_input_ratio,
                    );
                    self.cache_put(&request.tenant, &fingerprint, &result).await;
                    self.emit_usage(&request, &result, latency_ms, false).await;
                    return Ok(result);
                }
                Err(err) => {
                    last_error = Some(err.to_string());
                    self.record_provider_failure(provider).await;
                }
            }
        }

        Err(ResilienceError::AllProvidersDown {
            last_error: last_error.unwrap_or_else(|| "no providers configured".to_string()),
        })
    }

    /// Cascades the same way as `generate`, but never touches the cache or
    /// emits cost accounting: once a provider starts yielding tokens there is
    /// no way back to the cascade, so caching a partial stream would be
    /// meaningless.
    pub async fn generate_stream(self: &Arc<Self>, request: LlmRequest) -> ResilienceResult<TokenStream> {
        let order = self.cascade_order(request.primary.as_deref()).await;
        let mut last_error: Option<String> = None;
        for provider in order {
            let breaker = self.breakers.get_or_create(&provider.breaker_key()).await;
            if breaker.state() == BreakerState::Open {
                continue;
            }
            let adapter = match self.adapters.get(&provider) {
                Some(adapter) => adapter.clone(),
                None => continue,
            };

            let req = request.clone();
            match breaker.call(|| adapter.generate_stream(req)).await {
                Ok(stream) => {
                    self.record_provider_success(provider, 0.0).await;
                    return Ok(stream);
                }
                Err(err) => {
                    last_error = Some(err.to_string());
                    self.record_provider_failure(provider).await;
                }
            }
        }

        Err(ResilienceError::AllProvidersDown {
            last_error: last_error.unwrap_or_else(|| "no providers configured".to_string()),
        })
    }

    async fn emit_usage(&self, request: &LlmRequest, result: &LlmResult, latency_ms: f64, cached: bool) {
        self.usage_sink
            .record(UsageRecord {
                tenant: request.tenant.clone(),
                agent: request.agent.clone(),
                model: result.model.clone(),
                provider: result.provider.clone(),
                tokens_in: result.prompt_tokens,
                tokens_out: result.completion_tokens,
                cost: if cached { 0.0 } else { result.estimated_cost },
                latency_ms,
                cached,
                success: true,
                at: chrono::Utc::now(),
            })
            .await;
    }
}
