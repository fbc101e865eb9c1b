//! Health monitoring: periodic probes composed from a table supplied by
//! capability providers, three-level classification, and per-service
//! running metrics. The core never embeds adapter-specific probe logic —
//! it only imposes `probe_timeout` and aggregates the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_agency_interfaces::{HealthCheckResult, HealthProbe, HealthStatus, ServiceHealthMetrics};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{ResilienceError, ResilienceResult};

pub struct HealthMonitor {
    probes: HashMap<String, Arc<dyn HealthProbe>>,
    probe_timeout: Duration,
    probe_interval: Duration,
    results: RwLock<HashMap<String, HealthCheckResult>>,
    metrics: RwLock<HashMap<String, ServiceHealthMetrics>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl HealthMonitor {
    pub fn new(
        probes: HashMap<String, Arc<dyn HealthProbe>>,
        probe_timeout: Duration,
        probe_interval: Duration,
    ) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            probes,
            probe_timeout,
            probe_interval,
            results: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            stop,
        })
    }

    /// On-demand probe of a single service, bounded by `probe_timeout`
    /// regardless of the probe's own behavior.
    pub async fn check(&self, service: &str) -> ResilienceResult<HealthCheckResult> {
        let probe = self
            .probes
            .get(service)
            .ok_or_else(|| ResilienceError::Unavailable {
                service: service.to_string(),
                reason: "no health probe registered".to_string(),
            })?
            .clone();

        let result = match tokio::time::timeout(self.probe_timeout, probe.probe()).await {
            Ok(result) => result,
            Err(_) => HealthCheckResult {
                service: service.to_string(),
                healthy: false,
                status: HealthStatus::Unhealthy,
                latency_ms: self.probe_timeout.as_millis() as f64,
                observed_at: chrono::Utc::now(),
                error: Some("probe exceeded probe_timeout".to_string()),
                details: HashMap::new(),
            },
        };

        self.record(result.clone()).await;
        Ok(result)
    }

    /// Fans out to every registered probe concurrently; a single slow or
    /// crashing probe cannot block or take down the others.
    pub async fn check_all(&self) -> HashMap<String, HealthStatus> {
        let services: Vec<String> = self.probes.keys().cloned().collect();
        let outcomes = futures::future::join_all(services.iter().map(|service| async move {
            let status = match self.check(service).await {
                Ok(result) => result.status,
                Err(_) => HealthStatus::Unhealthy,
            };
            (service.clone(), status)
        }))
        .await;
        outcomes.into_iter().collect()
    }

    /// The worst (highest-priority) status across every known service.
    pub async fn overall_health(&self) -> HealthStatus {
        self.check_all()
            .await
            .values()
            .copied()
            .max_by_key(|status| status.priority())
            .unwrap_or(HealthStatus::Healthy)
    }

    pub async fn metrics(&self, service: &str) -> ServiceHealthMetrics {
        self.metrics.read().await.get(service).cloned().unwrap_or_default()
    }

    /// Returns every service's metrics as real, already-computed values —
    /// never a join handle or future standing in for the data.
    pub async fn all_metrics(&self) -> HashMap<String, ServiceHealthMetrics> {
        self.metrics.read().await.clone()
    }

    pub async fn latest_result(&self, service: &str) -> Option<HealthCheckResult> {
        self.results.read().await.get(service).cloned()
    }

    async fn record(&self, result: HealthCheckResult) {
        let mut metrics = self.metrics.write().await;
        metrics.entry(result.service.clone()).or_default().record(&result);
        drop(metrics);
        self.results.write().await.insert(result.service.clone(), result);
    }

    /// Spawns one periodic task per registered probe. A probe that panics
    /// only unwinds its own task; the others keep running.
    pub async fn start_continuous(self: &Arc<Self>) {
        let _ = self.stop.send(false);
        let mut tasks = self.tasks.lock().await;
        for service in self.probes.keys() {
            let monitor = self.clone();
            let service = service.clone();
            let mut stop_rx = self.stop.subscribe();
            let interval = self.probe_interval;
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            let _ = monitor.check(&service).await;
                        }
                        changed = stop_rx.changed() => {
                            if changed.is_err() || *stop_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
            tasks.push(handle);
        }
    }

    pub async fn stop_continuous(&self) {
        let _ = self.stop.send(true);
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct ScriptedProbe {
        healthy: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> HealthCheckResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let healthy = self.healthy.load(Ordering::SeqCst);
            HealthCheckResult {
                service: "search".to_string(),
                healthy,
                status: if healthy { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
                latency_ms: 5.0,
                observed_at: chrono::Utc::now(),
                error: if healthy { None } else { Some("down".to_string()) },
                details: HashMap::new(),
            }
        }
    }

    struct TimeoutProbe;

    #[async_trait]
    impl HealthProbe for TimeoutProbe {
        async fn probe(&self) -> HealthCheckResult {
            tokio::time::sleep(Duration::from_secs(10)).await;
            unreachable!("probe_timeout should have cancelled this");
        }
    }

    fn monitor_with(probes: HashMap<String, Arc<dyn HealthProbe>>) -> Arc<HealthMonitor> {
        HealthMonitor::new(probes, Duration::from_millis(50), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn check_updates_metrics_for_the_probed_service() {
        let probe = Arc::new(ScriptedProbe { healthy: AtomicBool::new(true), calls: AtomicU32::new(0) });
        let probes: HashMap<String, Arc<dyn HealthProbe>> = [("search".to_string(), probe as Arc<dyn HealthProbe>)].into();
        let monitor = monitor_with(probes);

        let result = monitor.check("search").await.unwrap();
        assert!(result.healthy);

        let metrics = monitor.metrics("search").await;
        assert_eq!(metrics.total_checks, 1);
        assert_eq!(metrics.successes, 1);
        assert!((metrics.uptime_pct - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn probe_exceeding_timeout_is_classified_unhealthy() {
        let probes: HashMap<String, Arc<dyn HealthProbe>> = [("slow".to_string(), Arc::new(TimeoutProbe) as Arc<dyn HealthProbe>)].into();
        let monitor = monitor_with(probes);

        let result = monitor.check("slow").await.unwrap();
        assert!(!result.healthy);
        assert_eq!(result.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn check_unknown_service_is_unavailable_not_a_panic() {
        let monitor = monitor_with(HashMap::new());
        let result = monitor.check("ghost").await;
        assert!(matches!(result, Err(ResilienceError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn consecutive_counters_are_reciprocal() {
        let probe = Arc::new(ScriptedProbe { healthy: AtomicBool::new(true), calls: AtomicU32::new(0) });
        let probes: HashMap<String, Arc<dyn HealthProbe>> = [("search".to_string(), probe.clone() as Arc<dyn HealthProbe>)].into();
        let monitor = monitor_with(probes);

        monitor.check("search").await.unwrap();
        monitor.check("search").await.unwrap();
        probe.healthy.store(false, Ordering::SeqCst);
        monitor.check("search").await.unwrap();

        let metrics = monitor.metrics("search").await;
        assert_eq!(metrics.consecutive_successes, 0);
        assert_eq!(metrics.consecutive_failures, 1);
        assert_eq!(metrics.total_checks, 3);
    }

    #[tokio::test]
    async fn all_metrics_returns_real_values_for_every_probed_service() {
        let probe_a = Arc::new(ScriptedProbe { healthy: AtomicBool::new(true), calls: AtomicU32::new(0) });
        let probes: HashMap<String, Arc<dyn HealthProbe>> = [("search".to_string(), probe_a as Arc<dyn HealthProbe>)].into();
        let monitor = monitor_with(probes);
        monitor.check("search").await.unwrap();

        let all = monitor.all_metrics().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all["search"].total_checks, 1);
    }

    #[tokio::test]
    async fn continuous_loop_probes_repeatedly_until_stopped() {
        let probe = Arc::new(ScriptedProbe { healthy: AtomicBool::new(true), calls: AtomicU32::new(0) });
        let probes: HashMap<String, Arc<dyn HealthProbe>> = [("search".to_string(), probe.clone() as Arc<dyn HealthProbe>)].into();
        let monitor = monitor_with(probes);

        monitor.start_continuous().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        monitor.stop_continuous().await;

        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
    }
}
