//! Per-target breaker registry and call wrapper.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::observability::{AlertEvent, AlertKind, AlertSink, GateMetrics, TracingAlertSink};

use super::circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot};

/// Error surfaced by [`BreakerRegistry::execute`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The target's circuit is open; no call was attempted.
    Open {
        target: String,
        retry_after: Duration,
    },
    /// The wrapped operation failed; the failure was recorded.
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Open { retry_after, .. } => Some(*retry_after),
            Self::Inner(_) => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open {
                target,
                retry_after,
            } => write!(
                f,
                "Circuit open for {target}, retry in {:.1}s",
                retry_after.as_secs_f64()
            ),
            Self::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(e) => Some(e),
        }
    }
}

/// Registry of one [`CircuitBreaker`] per downstream target.
///
/// Breakers are created on first use with the registry's config. State is
/// process-local; horizontally scaled instances each learn about a failing
/// target from their own traffic.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitConfig,
    metrics: Arc<GateMetrics>,
    alerts: Arc<dyn AlertSink>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            metrics: Arc::new(GateMetrics::new()),
            alerts: Arc::new(TracingAlertSink),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GateMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// Run `operation` against `target` under its breaker.
    ///
    /// An open circuit rejects immediately without invoking the operation.
    /// The operation must carry its own timeout; a timed-out future should
    /// resolve to `Err`, which is recorded as a failure here.
    pub async fn execute<T, E, F, Fut>(
        &self,
        target: &str,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(target);

        if let Err(retry_after) = breaker.allow_request() {
            self.metrics.denied_circuit_open.inc();
            return Err(BreakerError::Open {
                target: target.to_string(),
                retry_after,
            });
        }

        match operation().await {
            Ok(value) => {
                if breaker.record_success() {
                    self.metrics.breaker_closes.inc();
                    self.metrics.open_circuits.dec();
                    tracing::info!(target = target, "Circuit recovered");
                }
                Ok(value)
            }
            Err(e) => {
                if breaker.record_failure() {
                    self.metrics.breaker_opens.inc();
                    self.metrics.open_circuits.inc();
                    self.alerts.emit(AlertEvent::new(
                        AlertKind::CircuitOpened,
                        target,
                        format!("Circuit opened for downstream target '{target}'"),
                    ));
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Like [`execute`](Self::execute), but a failed operation falls back to
    /// `fallback` after the failure is recorded. An open circuit still
    /// rejects immediately.
    pub async fn execute_with_fallback<T, E, F, Fut, G, FFut>(
        &self,
        target: &str,
        operation: F,
        fallback: G,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, E>>,
    {
        match self.execute(target, operation).await {
            Err(BreakerError::Inner(_)) => fallback().await.map_err(BreakerError::Inner),
            other => other,
        }
    }

    pub fn snapshot(&self, target: &str) -> Option<CircuitSnapshot> {
        self.breakers.get(target).map(|b| b.snapshot())
    }

    /// Administrative reset of one target's breaker.
    pub fn reset(&self, target: &str) -> bool {
        match self.breakers.get(target) {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }

    pub fn targets(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("targets", &self.breakers.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;

    fn registry(threshold: u32, base_ms: u64) -> BreakerRegistry {
        BreakerRegistry::new(CircuitConfig {
            failure_threshold: threshold,
            base_backoff: Duration::from_millis(base_ms),
            max_backoff: Duration::from_millis(base_ms * 8),
            half_open_max_calls: 1,
            monitoring_period: Duration::from_secs(60),
        })
    }

    async fn fail(registry: &BreakerRegistry, target: &str) {
        let _ = registry
            .execute::<(), _, _, _>(target, || async { Err("boom") })
            .await;
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let registry = registry(3, 10_000);

        for _ in 0..3 {
            fail(&registry, "azure").await;
        }
        assert_eq!(registry.snapshot("azure").unwrap().state, CircuitState::Open);

        let mut invoked = false;
        let result = registry
            .execute::<(), &str, _, _>("azure", || {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_targets_are_isolated() {
        let registry = registry(1, 10_000);

        fail(&registry, "azure").await;
        assert_eq!(registry.snapshot("azure").unwrap().state, CircuitState::Open);

        // The healthy target is unaffected.
        let result = registry
            .execute::<_, &str, _, _>("local", || async { Ok(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_recovery_cycle_invokes_probe() {
        let registry = registry(1, 20);

        fail(&registry, "azure").await;
        assert_eq!(registry.snapshot("azure").unwrap().state, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Backoff elapsed: the next call is a half-open probe and runs.
        let mut invoked = false;
        let result = registry
            .execute::<_, &str, _, _>("azure", || {
                invoked = true;
                async { Ok("recovered") }
            })
            .await;
        assert!(invoked);
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(
            registry.snapshot("azure").unwrap().state,
            CircuitState::Closed
        );
        assert_eq!(registry.snapshot("azure").unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_fallback_on_operation_failure() {
        let registry = registry(5, 10_000);

        let result = registry
            .execute_with_fallback::<_, &str, _, _, _, _>(
                "azure",
                || async { Err("primary down") },
                || async { Ok("from fallback") },
            )
            .await;

        assert_eq!(result.unwrap(), "from fallback");
        // The primary failure was still recorded.
        assert_eq!(registry.snapshot("azure").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_admin_reset_clears_target() {
        let registry = registry(1, 10_000);
        fail(&registry, "azure").await;

        assert!(registry.reset("azure"));
        assert_eq!(
            registry.snapshot("azure").unwrap().state,
            CircuitState::Closed
        );
        assert!(!registry.reset("unknown"));
    }
}
