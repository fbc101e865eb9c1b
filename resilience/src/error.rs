//! The error taxonomy shared by every engine in this crate.
//!
//! Mirrors the teacher's `CircuitBreakerOpenError` pattern of carrying
//! structured context rather than a bare string, so observability code can
//! match on variants instead of parsing messages.

use crate::circuit_breaker::Stats;

#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("breaker for '{service}' is open (next attempt at {next_attempt_in_ms}ms)")]
    BreakerOpen { service: String, next_attempt_in_ms: u64, stats: Stats },

    #[error("call to '{service}' exceeded its call_timeout of {timeout_ms}ms")]
    BreakerTimeout { service: String, timeout_ms: u64 },

    #[error("upstream error from '{service}': {source}")]
    Upstream { service: String, #[source] source: Box<dyn std::error::Error + Send + Sync> },

    #[error("service '{service}' is unavailable in any mode: {reason}")]
    Unavailable { service: String, reason: String },

    #[error("no capability registered for '{service}' in mode '{mode}'")]
    ConfigError { service: String, mode: String },

    #[error("all LLM providers are unavailable; last error: {last_error}")]
    AllProvidersDown { last_error: String },

    #[error("degradation window for '{service}'.'{operation}' expired")]
    DegradationExhausted { service: String, operation: String },
}

pub type ResilienceResult<T> = Result<T, ResilienceError>;
