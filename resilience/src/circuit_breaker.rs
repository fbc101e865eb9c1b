//! Per-service circuit breaker: a CLOSED/OPEN/HALF_OPEN state machine with
//! exponential backoff and jitter, registry-backed so one instance can guard
//! an arbitrary number of logical services.
//!
//! The admission check and every state transition happen under one mutex
//! per breaker; the guarded user function always runs outside it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::error::ResilienceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub state_changes: u64,
    pub last_failure_at: Option<SystemTime>,
    pub last_success_at: Option<SystemTime>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            state_changes: 0,
            last_failure_at: None,
            last_success_at: None,
        }
    }
}

impl Stats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub call_timeout: Duration,
    pub half_open_max: u32,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    pub jitter_fraction: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            call_timeout: Duration::from_secs(60),
            half_open_max: 3,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
            jitter_fraction: 0.1,
        }
    }
}

impl From<&agent_agency_resilience_config::BreakerDefaults> for BreakerConfig {
    fn from(defaults: &agent_agency_resilience_config::BreakerDefaults) -> Self {
        Self {
            failure_threshold: defaults.failure_threshold,
            call_timeout: Duration::from_secs(defaults.call_timeout_sec),
            half_open_max: defaults.half_open_max,
            backoff_multiplier: defaults.backoff_multiplier,
            max_backoff: Duration::from_secs(defaults.max_backoff_sec),
            jitter_fraction: defaults.jitter_fraction,
        }
    }
}

impl BreakerConfig {
    /// Applies a per-service `BreakerOverride` on top of this config,
    /// leaving any field the override leaves `None` untouched.
    fn merge_override(&self, over: &agent_agency_resilience_config::BreakerOverride) -> Self {
        Self {
            failure_threshold: over.failure_threshold.unwrap_or(self.failure_threshold),
            call_timeout: over.call_timeout_sec.map(Duration::from_secs).unwrap_or(self.call_timeout),
            half_open_max: over.half_open_max.unwrap_or(self.half_open_max),
            backoff_multiplier: over.backoff_multiplier.unwrap_or(self.backoff_multiplier),
            max_backoff: over.max_backoff_sec.map(Duration::from_secs).unwrap_or(self.max_backoff),
            jitter_fraction: over.jitter_fraction.unwrap_or(self.jitter_fraction),
        }
    }
}

#[derive(Copy, Clone)]
enum Admission {
    Closed,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_in_flight: u32,
    trip_count: u32,
    next_attempt_at: Instant,
    stats: Stats,
}

pub struct Breaker {
    service: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl Breaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(service, config, Arc::new(SystemClock))
    }

    pub fn with_clock(service: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            service: service.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_in_flight: 0,
                trip_count: 0,
                next_attempt_at: now,
                stats: Stats::default(),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Executes `f` under the breaker: rejects fast when closed-for-business,
    /// otherwise runs `f` with `call_timeout` enforced and feeds the outcome
    /// back into the state machine.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let admission = self.admit()?;
        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.on_outcome(admission, true, false);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_outcome(admission, false, false);
                Err(ResilienceError::Upstream { service: self.service.clone(), source: Box::new(err) })
            }
            Err(_) => {
                self.on_outcome(admission, false, true);
                Err(ResilienceError::BreakerTimeout {
                    service: self.service.clone(),
                    timeout_ms: self.config.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn admit(&self) -> Result<Admission, ResilienceError> {
        let mut inner = self.inner.lock().unwrap();
        let now = self.clock.now();
        match inner.state {
            BreakerState::Closed => Ok(Admission::Closed),
            BreakerState::Open => {
                if now >= inner.next_attempt_at {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    inner.stats.state_changes += 1;
                    tracing::info!(service = %self.service, "breaker half-open, admitting probe call");
                    Ok(Admission::HalfOpen)
                } else {
                    Err(self.open_error(&inner, now))
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max {
                    inner.half_open_in_flight += 1;
                    Ok(Admission::HalfOpen)
                } else {
                    Err(self.open_error(&inner, now))
                }
            }
        }
    }

    fn open_error(&self, inner: &Inner, now: Instant) -> ResilienceError {
        let next_attempt_in_ms = inner.next_attempt_at.saturating_duration_since(now).as_millis() as u64;
        ResilienceError::BreakerOpen {
            service: self.service.clone(),
            next_attempt_in_ms,
            stats: inner.stats.clone(),
        }
    }

    fn on_outcome(&self, admission: Admission, success: bool, timed_out: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.total += 1;
        if success {
            inner.stats.succeeded += 1;
            inner.stats.last_success_at = Some(SystemTime::now());
        } else {
            inner.stats.failed += 1;
            inner.stats.last_failure_at = Some(SystemTime::now());
            if timed_out {
                inner.stats.timed_out += 1;
            }
        }

        match admission {
            Admission::Closed => {
                if success {
                    inner.consecutive_failures = 0;
                } else {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        self.trip(&mut inner);
                    }
                }
            }
            Admission::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if success {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.trip_count = 0;
                    inner.half_open_in_flight = 0;
                    inner.stats.state_changes += 1;
                    tracing::info!(service = %self.service, "breaker closed after successful probe");
                } else {
                    self.trip(&mut inner);
                }
            }
        }
    }

    /// Enters `Open`, computing backoff from the current trip streak:
    /// `delay = min(call_timeout * multiplier^(n-1), max_backoff)`, then a
    /// symmetric jitter so peer instances don't reopen in lockstep.
    fn trip(&self, inner: &mut Inner) {
        inner.trip_count += 1;
        let n = inner.trip_count;
        let base_ms = self.config.call_timeout.as_millis() as f64;
        let exponent = self.config.backoff_multiplier.powi((n.saturating_sub(1)) as i32);
        let max_ms = self.config.max_backoff.as_millis() as f64;
        let delay_ms = (base_ms * exponent).min(max_ms);
        let jitter_span = delay_ms * self.config.jitter_fraction;
        let jitter = if jitter_span > 0.0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0.0
        };
        let delay_ms = (delay_ms + jitter).max(0.0);

        inner.state = BreakerState::Open;
        inner.half_open_in_flight = 0;
        inner.next_attempt_at = self.clock.now() + Duration::from_millis(delay_ms as u64);
        inner.stats.state_changes += 1;
        tracing::warn!(service = %self.service, trip_count = n, delay_ms, "breaker open");
    }

    /// Operational override: forces `Open` for `max_backoff`, still recorded
    /// as a state change.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Open;
        inner.next_attempt_at = self.clock.now() + self.config.max_backoff;
        inner.half_open_in_flight = 0;
        inner.stats.state_changes += 1;
    }

    /// Operational override: restores `Closed` and zeroes the failure and
    /// half-open counters, independent of `reset_stats`.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.trip_count = 0;
        inner.half_open_in_flight = 0;
        inner.stats.state_changes += 1;
    }

    /// Zeroes the counters without touching the FSM state, distinct from
    /// `force_close`.
    pub fn reset_stats(&self) {
        self.inner.lock().unwrap().stats = Stats::default();
    }
}

/// Lazily creates and owns one `Breaker` per logical service name.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, Arc<Breaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self::with_clock(default_config, Arc::new(SystemClock))
    }

    pub fn with_clock(default_config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { default_config, overrides: HashMap::new(), clock, breakers: RwLock::new(HashMap::new()) }
    }

    pub fn with_override(mut self, service: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(service.into(), config);
        self
    }

    /// Builds a registry from `BreakerDefaults`, merging each entry of its
    /// `overrides` map (spec §6's "per-service threshold overrides") over
    /// the defaults and registering the result, so `[breaker.overrides.*]`
    /// in the config file actually reaches the breakers it names instead of
    /// being parsed and discarded.
    pub fn from_config(defaults: &agent_agency_resilience_config::BreakerDefaults) -> Self {
        let default_config = BreakerConfig::from(defaults);
        let mut registry = Self::new(default_config.clone());
        for (service, over) in &defaults.overrides {
            registry = registry.with_override(service.clone(), default_config.merge_override(over));
        }
        registry
    }

    pub async fn get_or_create(&self, service: &str) -> Arc<Breaker> {
        if let Some(breaker) = self.breakers.read().await.get(service) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get(service) {
            return breaker.clone();
        }
        let config = self.overrides.get(service).cloned().unwrap_or_else(|| self.default_config.clone());
        let breaker = Arc::new(Breaker::with_clock(service.to_string(), config, self.clock.clone()));
        breakers.insert(service.to_string(), breaker.clone());
        breaker
    }

    pub async fn snapshot(&self) -> HashMap<String, (BreakerState, Stats)> {
        self.breakers
            .read()
            .await
            .iter()
            .map(|(name, breaker)| (name.clone(), (breaker.state(), breaker.stats())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(failure_threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            call_timeout: Duration::from_millis(50),
            half_open_max: 2,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(500),
            jitter_fraction: 0.0,
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[tokio::test]
    async fn closed_breaker_admits_and_records_success() {
        let breaker = Breaker::new("svc", config(3));
        let result = breaker.call(|| async { Ok::<_, Boom>(42) }).await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn exactly_k_consecutive_failures_opens_the_breaker() {
        let breaker = Breaker::new("svc", config(3));
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed, "k-1 failures must not trip");

        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn k_minus_one_failures_then_success_leaves_it_closed() {
        let breaker = Breaker::new("svc", config(3));
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        let _ = breaker.call(|| async { Ok::<_, Boom>(()) }).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().failed, 2);
    }

    #[tokio::test]
    async fn open_breaker_rejects_fast_without_invoking_the_function() {
        let breaker = Breaker::new("svc", config(1));
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker
            .call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Boom>(()) }
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::BreakerOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn half_open_admits_up_to_max_then_rejects_the_overflow_call() {
        let clock = Arc::new(crate::clock::ManualClock::new());
        let breaker = Breaker::with_clock("svc", config(1), clock.clone());
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        clock.advance(Duration::from_secs(10));

        // First call transitions Open -> HalfOpen and is admitted (slot 1/2).
        // We don't let it resolve yet conceptually; instead drive admission
        // directly to assert the cap without depending on timing.
        let admitted_first = breaker.admit().unwrap();
        assert!(matches!(admitted_first, Admission::HalfOpen));
        let admitted_second = breaker.admit();
        assert!(admitted_second.is_ok(), "half_open_max=2 allows a second concurrent admission");
        let admitted_third = breaker.admit();
        assert!(
            matches!(admitted_third, Err(ResilienceError::BreakerOpen { .. })),
            "the (m+1)-th concurrent admission must fail without invoking the function"
        );
    }

    #[tokio::test]
    async fn half_open_success_closes_and_zeroes_failure_counters() {
        let clock = Arc::new(crate::clock::ManualClock::new());
        let breaker = Breaker::with_clock("svc", config(1), clock.clone());
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        clock.advance(Duration::from_secs(10));
        let _ = breaker.call(|| async { Ok::<_, Boom>(()) }).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_recomputes_next_attempt() {
        let clock = Arc::new(crate::clock::ManualClock::new());
        let breaker = Breaker::with_clock("svc", config(1), clock.clone());
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        clock.advance(Duration::from_secs(10));
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure_and_surfaces_breaker_timeout() {
        let breaker = Breaker::new("svc", config(5));
        let result = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, Boom>(())
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::BreakerTimeout { .. })));
        assert_eq!(breaker.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn backoff_clamps_at_max_backoff_after_repeated_trips() {
        let clock = Arc::new(crate::clock::ManualClock::new());
        let breaker = Breaker::with_clock("svc", config(1), clock.clone());
        for _ in 0..6 {
            let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
            clock.advance(Duration::from_secs(10));
        }
        // With backoff_multiplier=2 and call_timeout=50ms, the delay would
        // exceed max_backoff (500ms) well before the 6th trip; the breaker
        // must still be well-formed (Open) and admit only after the clamp.
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn force_open_then_force_close_restores_closed_with_zeroed_half_open() {
        let breaker = Breaker::new("svc", config(3));
        breaker.force_open();
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.force_close();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn reset_stats_zeroes_counters_without_changing_state() {
        let breaker = Breaker::new("svc", config(1));
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset_stats();
        assert_eq!(breaker.stats().total, 0);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn registry_lazily_creates_one_breaker_per_service() {
        let registry = BreakerRegistry::new(config(5));
        let a1 = registry.get_or_create("search").await;
        let a2 = registry.get_or_create("search").await;
        let b = registry.get_or_create("cache").await;
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[tokio::test]
    async fn registry_applies_per_service_override() {
        let registry = BreakerRegistry::new(config(5)).with_override("flaky", config(1));
        let breaker = registry.get_or_create("flaky").await;
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn from_config_wires_per_service_overrides_from_breaker_defaults() {
        use agent_agency_resilience_config::{BreakerDefaults, BreakerOverride};
        use std::collections::HashMap;

        let mut overrides = HashMap::new();
        overrides.insert(
            "flaky".to_string(),
            BreakerOverride { failure_threshold: Some(1), ..BreakerOverride::default() },
        );
        let defaults = BreakerDefaults {
            failure_threshold: 5,
            call_timeout_sec: 60,
            half_open_max: 3,
            backoff_multiplier: 2.0,
            max_backoff_sec: 300,
            jitter_fraction: 0.0,
            overrides,
        };

        let registry = BreakerRegistry::from_config(&defaults);

        let flaky = registry.get_or_create("flaky").await;
        let _ = flaky.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(flaky.state(), BreakerState::Open, "override's failure_threshold=1 must trip after one failure");

        let other = registry.get_or_create("steady").await;
        let _ = other.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(other.state(), BreakerState::Closed, "unoverridden services keep the default threshold of 5");
    }
}
