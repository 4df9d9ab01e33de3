//! Fixed-window rate limiting per tenant and route.
//!
//! Best-effort and process-local: counters are not shared across instances,
//! and the limiter is deliberately decoupled from the budget ledger. A
//! request can be within budget yet rate-limited, and vice versa.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Window configuration for one tier of traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitTier {
    #[serde(with = "duration_ms")]
    pub window: Duration,
    pub max_requests: u32,
}

impl RateLimitTier {
    pub const fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }

    /// Conservative defaults for trial tenants.
    pub const fn demo() -> Self {
        Self::new(Duration::from_secs(60), 30)
    }

    pub const fn production() -> Self {
        Self::new(Duration::from_secs(60), 600)
    }
}

mod duration_ms {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms: u64 = serde::Deserialize::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window after this check.
    pub remaining: u32,
    /// Time until the current window resets.
    pub reset_after: Duration,
}

#[derive(Debug)]
struct FixedWindow {
    count: u32,
    window_start: Instant,
}

/// Fixed-window counter keyed by caller-chosen strings (`org`, `org:route`,
/// `org:ip`, ...).
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, FixedWindow>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and count one request against `key` under `tier`.
    ///
    /// The window boundary resets atomically with the check: the entry lock
    /// covers the rollover and the increment together.
    pub fn check(&self, key: &str, tier: RateLimitTier) -> RateLimitDecision {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| FixedWindow {
                count: 0,
                window_start: now,
            });

        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= tier.window {
            entry.count = 0;
            entry.window_start = now;
        }

        let reset_after = tier
            .window
            .saturating_sub(now.duration_since(entry.window_start));

        if entry.count < tier.max_requests {
            entry.count += 1;
            RateLimitDecision {
                allowed: true,
                remaining: tier.max_requests - entry.count,
                reset_after,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after,
            }
        }
    }

    /// Drop windows idle for longer than `older_than`; returns how many were
    /// removed. Intended for a periodic maintenance task.
    pub fn prune(&self, older_than: Duration) -> usize {
        let before = self.windows.len();
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.window_start) < older_than);
        before - self.windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_max_then_denies() {
        let limiter = RateLimiter::new();
        let tier = RateLimitTier::new(Duration::from_secs(1), 5);

        for i in 0..5 {
            let d = limiter.check("org-a:/ai/chat", tier);
            assert!(d.allowed);
            assert_eq!(d.remaining, 4 - i);
        }

        let denied = limiter.check("org-a:/ai/chat", tier);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_after > Duration::ZERO);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        let tier = RateLimitTier::new(Duration::from_secs(1), 1);

        assert!(limiter.check("org-a", tier).allowed);
        assert!(!limiter.check("org-a", tier).allowed);
        assert!(limiter.check("org-b", tier).allowed);
    }

    #[tokio::test]
    async fn test_window_resets_after_elapse() {
        let limiter = RateLimiter::new();
        let tier = RateLimitTier::new(Duration::from_millis(30), 2);

        assert!(limiter.check("org-a", tier).allowed);
        assert!(limiter.check("org-a", tier).allowed);
        assert!(!limiter.check("org-a", tier).allowed);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let d = limiter.check("org-a", tier);
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
    }

    #[test]
    fn test_prune_drops_idle_windows() {
        let limiter = RateLimiter::new();
        let tier = RateLimitTier::new(Duration::from_millis(1), 1);

        limiter.check("org-a", tier);
        limiter.check("org-b", tier);
        assert_eq!(limiter.tracked_keys(), 2);

        std::thread::sleep(Duration::from_millis(10));
        let removed = limiter.prune(Duration::from_millis(5));
        assert_eq!(removed, 2);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_tier_presets() {
        assert!(RateLimitTier::demo().max_requests < RateLimitTier::production().max_requests);
    }
}
