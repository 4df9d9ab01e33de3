//! Circuit breaker state machine.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::backoff::ExponentialBackoff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// Consecutive failures within `monitoring_period` that trip the circuit.
    pub failure_threshold: u32,
    /// Backoff before the first retry after a trip; doubles per consecutive
    /// reopen, capped at `max_backoff`.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Trial calls admitted in half-open; that many consecutive successes
    /// close the circuit.
    pub half_open_max_calls: u32,
    /// Failures older than this no longer count toward the threshold.
    pub monitoring_period: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(600),
            half_open_max_calls: 3,
            monitoring_period: Duration::from_secs(60),
        }
    }
}

/// Introspection view of one breaker (admin surface).
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub consecutive_opens: u32,
    /// Milliseconds until the next half-open probe; zero unless OPEN.
    pub retry_after_ms: u64,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    backoff: ExponentialBackoff,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    /// Start of the failure-counting window, ms since epoch.
    window_started_ms: AtomicU64,
    /// Consecutive trips without a full recovery; drives the backoff exponent.
    open_count: AtomicU32,
    next_retry_at_ms: AtomicU64,
    half_open_successes: AtomicU32,
    half_open_inflight: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        let backoff = ExponentialBackoff::new(config.base_backoff, config.max_backoff, 2.0);
        Self {
            config,
            backoff,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            window_started_ms: AtomicU64::new(0),
            open_count: AtomicU32::new(0),
            next_retry_at_ms: AtomicU64::new(0),
            half_open_successes: AtomicU32::new(0),
            half_open_inflight: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission check. `Err` carries the time until the next probe window.
    ///
    /// An OPEN circuit whose backoff has elapsed transitions to HALF_OPEN
    /// lazily here, and the call that triggered the transition is admitted
    /// as the first probe.
    pub fn allow_request(&self) -> Result<(), Duration> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());

        match *state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let retry_at = self.next_retry_at_ms.load(Ordering::Acquire);
                let now = now_ms();
                if now >= retry_at {
                    drop(state);
                    self.transition_to_half_open();
                    self.try_admit_probe()
                } else {
                    Err(Duration::from_millis(retry_at - now))
                }
            }
            CircuitState::HalfOpen => self.try_admit_probe(),
        }
    }

    fn try_admit_probe(&self) -> Result<(), Duration> {
        let mut current = self.half_open_inflight.load(Ordering::Acquire);
        loop {
            if current >= self.config.half_open_max_calls {
                return Err(Duration::ZERO);
            }
            match self.half_open_inflight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Record a successful call. Returns true when this success closed the
    /// circuit (full half-open recovery cycle).
    pub fn record_success(&self) -> bool {
        let state = *self.state.read().unwrap_or_else(|e| e.into_inner());

        match state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
                false
            }
            CircuitState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.config.half_open_max_calls {
                    self.transition_to_closed();
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Record a failed call (timeouts count as failures). Returns true when
    /// this failure tripped the circuit open.
    pub fn record_failure(&self) -> bool {
        let state = *self.state.read().unwrap_or_else(|e| e.into_inner());

        match state {
            CircuitState::Closed => {
                let failures = self.bump_windowed_failures();
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // A probe failure reopens with extended backoff.
                self.transition_to_open();
                true
            }
            CircuitState::Open => false,
        }
    }

    fn bump_windowed_failures(&self) -> u32 {
        let now = now_ms();
        let window_ms = self.config.monitoring_period.as_millis() as u64;
        let started = self.window_started_ms.load(Ordering::Acquire);

        if started == 0 || now.saturating_sub(started) > window_ms {
            self.window_started_ms.store(now, Ordering::Release);
            self.failure_count.store(1, Ordering::Relaxed);
            1
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    fn transition_to_open(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == CircuitState::Open {
            return;
        }
        *state = CircuitState::Open;

        let opens = self.open_count.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = self.backoff.delay_for(opens);
        self.next_retry_at_ms
            .store(now_ms() + delay.as_millis() as u64, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Relaxed);
        self.half_open_inflight.store(0, Ordering::Relaxed);
        tracing::warn!(
            consecutive_opens = opens,
            backoff_ms = delay.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn transition_to_half_open(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == CircuitState::Open {
            *state = CircuitState::HalfOpen;
            self.half_open_inflight.store(0, Ordering::Relaxed);
            self.half_open_successes.store(0, Ordering::Relaxed);
            tracing::info!("Circuit breaker half-open");
        }
    }

    fn transition_to_closed(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::Relaxed);
        self.window_started_ms.store(0, Ordering::Relaxed);
        self.open_count.store(0, Ordering::Relaxed);
        self.half_open_successes.store(0, Ordering::Relaxed);
        self.half_open_inflight.store(0, Ordering::Relaxed);
        tracing::info!("Circuit breaker closed");
    }

    /// Administrative reset to CLOSED, clearing all counters.
    pub fn reset(&self) {
        self.transition_to_closed();
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let retry_after_ms = if state == CircuitState::Open {
            self.next_retry_at_ms
                .load(Ordering::Acquire)
                .saturating_sub(now_ms())
        } else {
            0
        };
        CircuitSnapshot {
            state,
            failure_count: self.failure_count(),
            consecutive_opens: self.open_count.load(Ordering::Relaxed),
            retry_after_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, base_ms: u64) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: threshold,
            base_backoff: Duration::from_millis(base_ms),
            max_backoff: Duration::from_millis(base_ms * 8),
            half_open_max_calls: 2,
            monitoring_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::new(CircuitConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request().is_ok());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(config(3, 10_000));

        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);

        let retry_after = cb.allow_request().unwrap_err();
        assert!(retry_after > Duration::ZERO);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(config(3, 10_000));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_after_backoff_then_closes() {
        let cb = CircuitBreaker::new(config(1, 20));

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow_request().is_err());

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Backoff elapsed: probe admitted, state HALF_OPEN.
        assert!(cb.allow_request().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(!cb.record_success());
        assert!(cb.allow_request().is_ok());
        assert!(cb.record_success());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_with_longer_backoff() {
        let cb = CircuitBreaker::new(config(1, 20));

        cb.record_failure();
        let first = cb.snapshot().retry_after_ms;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cb.allow_request().is_ok());
        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);

        // Second open doubles the backoff.
        let second = cb.snapshot().retry_after_ms;
        assert!(second > first, "expected {second} > {first}");
    }

    #[tokio::test]
    async fn test_half_open_caps_probe_count() {
        let cb = CircuitBreaker::new(config(1, 20));
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cb.allow_request().is_ok());
        assert!(cb.allow_request().is_ok());
        // Third probe exceeds half_open_max_calls = 2.
        assert!(cb.allow_request().is_err());
    }

    #[test]
    fn test_admin_reset() {
        let cb = CircuitBreaker::new(config(1, 10_000));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request().is_ok());
    }
}
