//! Atomic counters for enforcement outcomes.
//!
//! Process-local and lock-free; an exporter can scrape [`GateMetrics::snapshot`]
//! on its own schedule.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for every stage of the admission path.
#[derive(Debug, Default)]
pub struct GateMetrics {
    pub allowed: Counter,
    pub denied_budget: Counter,
    pub denied_kill_switch: Counter,
    pub denied_storage: Counter,
    pub denied_circuit_open: Counter,
    pub denied_rate_limited: Counter,
    pub kill_switch_activations: Counter,
    pub breaker_opens: Counter,
    pub breaker_closes: Counter,
    pub open_circuits: Gauge,
}

impl GateMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denials_total(&self) -> u64 {
        self.denied_budget.get()
            + self.denied_kill_switch.get()
            + self.denied_storage.get()
            + self.denied_circuit_open.get()
            + self.denied_rate_limited.get()
    }

    pub fn snapshot(&self) -> GateMetricsSnapshot {
        GateMetricsSnapshot {
            allowed: self.allowed.get(),
            denied_budget: self.denied_budget.get(),
            denied_kill_switch: self.denied_kill_switch.get(),
            denied_storage: self.denied_storage.get(),
            denied_circuit_open: self.denied_circuit_open.get(),
            denied_rate_limited: self.denied_rate_limited.get(),
            kill_switch_activations: self.kill_switch_activations.get(),
            breaker_opens: self.breaker_opens.get(),
            breaker_closes: self.breaker_closes.get(),
            open_circuits: self.open_circuits.get(),
        }
    }
}

/// Point-in-time export of [`GateMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateMetricsSnapshot {
    pub allowed: u64,
    pub denied_budget: u64,
    pub denied_kill_switch: u64,
    pub denied_storage: u64,
    pub denied_circuit_open: u64,
    pub denied_rate_limited: u64,
    pub kill_switch_activations: u64,
    pub breaker_opens: u64,
    pub breaker_closes: u64,
    pub open_circuits: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let c = Counter::new();
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_gauge_set_and_move() {
        let g = Gauge::new();
        g.set(3);
        g.dec();
        assert_eq!(g.get(), 2);
    }

    #[test]
    fn test_denials_total_sums_all_codes() {
        let m = GateMetrics::new();
        m.denied_budget.inc();
        m.denied_rate_limited.add(2);
        assert_eq!(m.denials_total(), 3);
        assert_eq!(m.snapshot().denied_rate_limited, 2);
    }
}
