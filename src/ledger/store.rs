//! Budget store backends.
//!
//! A store holds one monotone counter per `(org_id, period_key)` in integer
//! micro-EUR and must make the read-check-commit of [`BudgetStore::try_add_micros`]
//! atomic per key: two concurrent reservations may not both observe the
//! pre-increment value and both commit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::LedgerResult;

/// Result of an atomic conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReservation {
    pub accepted: bool,
    /// Committed counter value after the call (unchanged on deny).
    pub total_micros: u64,
    /// The total the increment would have produced.
    pub would_be_micros: u64,
}

/// Storage backend for budget counters.
#[async_trait::async_trait]
pub trait BudgetStore: Send + Sync {
    fn name(&self) -> &str;

    /// Committed spend for a period; zero when no record exists.
    async fn spent_micros(&self, org_id: &str, period_key: &str) -> LedgerResult<u64>;

    /// Atomically add `amount_micros` iff the result stays within
    /// `ceiling_micros`. A denial must leave the counter untouched.
    async fn try_add_micros(
        &self,
        org_id: &str,
        period_key: &str,
        amount_micros: u64,
        ceiling_micros: u64,
    ) -> LedgerResult<StoreReservation>;

    /// When the counter was last committed to, if the backend tracks it.
    async fn updated_at(
        &self,
        _org_id: &str,
        _period_key: &str,
    ) -> LedgerResult<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

fn counter_key(org_id: &str, period_key: &str) -> String {
    format!("{org_id}:{period_key}")
}

#[derive(Debug, Default)]
struct PeriodCounter {
    spent_micros: AtomicU64,
    updated_at_ms: AtomicU64,
}

/// In-memory store for tests and single-instance deployments.
///
/// The conditional increment is a compare-exchange loop over the packed
/// counter, so concurrent reservations for one key serialize without a lock.
#[derive(Debug, Default)]
pub struct MemoryBudgetStore {
    counters: DashMap<String, Arc<PeriodCounter>>,
}

impl MemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, org_id: &str, period_key: &str) -> Arc<PeriodCounter> {
        self.counters
            .entry(counter_key(org_id, period_key))
            .or_default()
            .clone()
    }

    pub fn tracked_periods(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait::async_trait]
impl BudgetStore for MemoryBudgetStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn spent_micros(&self, org_id: &str, period_key: &str) -> LedgerResult<u64> {
        Ok(self
            .counters
            .get(&counter_key(org_id, period_key))
            .map(|c| c.spent_micros.load(Ordering::Acquire))
            .unwrap_or(0))
    }

    async fn try_add_micros(
        &self,
        org_id: &str,
        period_key: &str,
        amount_micros: u64,
        ceiling_micros: u64,
    ) -> LedgerResult<StoreReservation> {
        let counter = self.counter(org_id, period_key);

        let mut current = counter.spent_micros.load(Ordering::Acquire);
        loop {
            let would_be = current.saturating_add(amount_micros);
            if would_be > ceiling_micros {
                return Ok(StoreReservation {
                    accepted: false,
                    total_micros: current,
                    would_be_micros: would_be,
                });
            }
            match counter.spent_micros.compare_exchange_weak(
                current,
                would_be,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    counter
                        .updated_at_ms
                        .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
                    return Ok(StoreReservation {
                        accepted: true,
                        total_micros: would_be,
                        would_be_micros: would_be,
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    async fn updated_at(
        &self,
        org_id: &str,
        period_key: &str,
    ) -> LedgerResult<Option<DateTime<Utc>>> {
        Ok(self
            .counters
            .get(&counter_key(org_id, period_key))
            .and_then(|c| {
                let ms = c.updated_at_ms.load(Ordering::Relaxed);
                if ms == 0 {
                    return None;
                }
                DateTime::<Utc>::from_timestamp_millis(ms as i64)
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_reads_zero() {
        let store = MemoryBudgetStore::new();
        assert_eq!(store.spent_micros("org", "2026-08").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accept_commits() {
        let store = MemoryBudgetStore::new();

        let r = store
            .try_add_micros("org", "2026-08", 4_000_000, 10_000_000)
            .await
            .unwrap();
        assert!(r.accepted);
        assert_eq!(r.total_micros, 4_000_000);
        assert_eq!(store.spent_micros("org", "2026-08").await.unwrap(), 4_000_000);
    }

    #[tokio::test]
    async fn test_deny_leaves_counter_untouched() {
        let store = MemoryBudgetStore::new();
        store
            .try_add_micros("org", "2026-08", 8_000_000, 10_000_000)
            .await
            .unwrap();

        let r = store
            .try_add_micros("org", "2026-08", 4_000_000, 10_000_000)
            .await
            .unwrap();
        assert!(!r.accepted);
        assert_eq!(r.total_micros, 8_000_000);
        assert_eq!(r.would_be_micros, 12_000_000);
        assert_eq!(store.spent_micros("org", "2026-08").await.unwrap(), 8_000_000);
    }

    #[tokio::test]
    async fn test_exact_ceiling_accepted() {
        let store = MemoryBudgetStore::new();
        let r = store
            .try_add_micros("org", "2026-08", 10_000_000, 10_000_000)
            .await
            .unwrap();
        assert!(r.accepted);
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        use std::thread;

        let store = Arc::new(MemoryBudgetStore::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&store);
                thread::spawn(move || {
                    let mut accepted = 0u64;
                    for _ in 0..100 {
                        let r = tokio_test::block_on(s.try_add_micros(
                            "org", "2026-08", 1_000, 500_000,
                        ))
                        .unwrap();
                        if r.accepted {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();

        let total_accepted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // 800 attempts of 1000 micros against a 500_000 ceiling: exactly 500 fit.
        assert_eq!(total_accepted, 500);
        let spent = tokio_test::block_on(store.spent_micros("org", "2026-08")).unwrap();
        assert_eq!(spent, 500_000);
    }
}
