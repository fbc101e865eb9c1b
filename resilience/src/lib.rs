//! Resilience substrate: circuit breaking, AWS-style retry classification,
//! health monitoring, and cloud/local fallback coordination for outbound
//! dependencies. Built to survive partial outages of external providers
//! without taking the whole system down with them.

pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod fallback;
pub mod health;
pub mod llm;
pub mod retry;

pub use circuit_breaker::{Breaker, BreakerConfig, BreakerRegistry, BreakerState, Stats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ResilienceError, ResilienceResult};
pub use fallback::{CoordinatorStatus, FallbackCoordinator, ServiceStatus, Transition};
pub use health::HealthMonitor;
pub use llm::{LlmProvider, LlmRouter, NoopUsageSink, ProviderHealth, UsageRecord, UsageSink};
pub use retry::{AwsErrorClassifier, AwsErrorType, AwsRetryConfig, AwsRetryHandler};
