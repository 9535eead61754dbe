//! Admission control for request-handling workers.
//!
//! Each `(client key, category)` pair owns a refilling bucket: capacity `C`,
//! refilled to `C` once the fixed window `W` has elapsed. State is
//! process-local; a multi-instance deployment that needs shared limits must
//! substitute a [`RateLimiter`] implementation backed by a shared store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::error;

use crate::clock::Clock;
use crate::config::RateQuota;

/// Endpoint categories, classified by request path before the limiter is
/// invoked. `Otp` is the strictest tier, `General` the loosest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateCategory {
    Auth,
    Otp,
    General,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn try_consume(&self, key: &str, category: RateCategory) -> RateLimitDecision;
}

/// Limiter that admits everything; wiring default for tests and trusted paths.
#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn try_consume(&self, _key: &str, _category: RateCategory) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    remaining: u32,
    window_started_unix: i64,
}

/// In-memory keyed token-bucket limiter.
///
/// Buckets are created lazily on first use and never evicted on the hot
/// path; callers mitigate unbounded key growth with [`Self::sweep_idle`].
pub struct TokenBucketLimiter {
    clock: Arc<dyn Clock>,
    quotas: HashMap<RateCategory, RateQuota>,
    buckets: Mutex<HashMap<(RateCategory, String), Bucket>>,
}

impl TokenBucketLimiter {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, quotas: HashMap<RateCategory, RateQuota>) -> Self {
        Self {
            clock,
            quotas,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn quota(&self, category: RateCategory) -> RateQuota {
        self.quotas
            .get(&category)
            .copied()
            .unwrap_or(RateQuota::new(5, 60))
    }

    /// Drop buckets not touched for `max_idle_seconds`. Intended to run from
    /// a periodic maintenance task owned by the caller.
    pub fn sweep_idle(&self, max_idle_seconds: i64) {
        let now = self.clock.now_unix();
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.retain(|_, bucket| now - bucket.window_started_unix < max_idle_seconds);
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().map(|buckets| buckets.len()).unwrap_or(0)
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn try_consume(&self, key: &str, category: RateCategory) -> RateLimitDecision {
        let quota = self.quota(category);
        let now = self.clock.now_unix();

        let Ok(mut buckets) = self.buckets.lock() else {
            // A poisoned map means another consume panicked mid-update; deny
            // rather than guess at the remaining budget.
            error!("rate limiter state poisoned, denying request");
            return RateLimitDecision::Limited;
        };

        let bucket = buckets
            .entry((category, key.to_string()))
            .or_insert(Bucket {
                remaining: quota.capacity,
                window_started_unix: now,
            });

        // Lazy refill: a fully elapsed window restores the whole budget.
        if now - bucket.window_started_unix >= quota.window_seconds {
            bucket.remaining = quota.capacity;
            bucket.window_started_unix = now;
        }

        if bucket.remaining > 0 {
            bucket.remaining -= 1;
            RateLimitDecision::Allowed
        } else {
            RateLimitDecision::Limited
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        NoopRateLimiter, RateCategory, RateLimitDecision, RateLimiter, TokenBucketLimiter,
    };
    use crate::clock::ManualClock;
    use crate::config::RateQuota;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn limiter(clock: Arc<ManualClock>) -> TokenBucketLimiter {
        let mut quotas = HashMap::new();
        quotas.insert(RateCategory::Auth, RateQuota::new(3, 60));
        quotas.insert(RateCategory::Otp, RateQuota::new(2, 60));
        quotas.insert(RateCategory::General, RateQuota::new(100, 60));
        TokenBucketLimiter::new(clock, quotas)
    }

    #[test]
    fn noop_rate_limiter_allows() {
        let limiter = NoopRateLimiter;
        assert_eq!(
            limiter.try_consume("10.0.0.1", RateCategory::Auth),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn exactly_capacity_requests_admitted_per_window() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let limiter = limiter(clock);

        for _ in 0..3 {
            assert_eq!(
                limiter.try_consume("10.0.0.1", RateCategory::Auth),
                RateLimitDecision::Allowed
            );
        }
        assert_eq!(
            limiter.try_consume("10.0.0.1", RateCategory::Auth),
            RateLimitDecision::Limited
        );
    }

    #[test]
    fn budget_restored_after_full_window() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let limiter = limiter(Arc::clone(&clock));

        for _ in 0..3 {
            limiter.try_consume("10.0.0.1", RateCategory::Auth);
        }
        assert_eq!(
            limiter.try_consume("10.0.0.1", RateCategory::Auth),
            RateLimitDecision::Limited
        );

        // One second short of the window: still limited.
        clock.advance(59);
        assert_eq!(
            limiter.try_consume("10.0.0.1", RateCategory::Auth),
            RateLimitDecision::Limited
        );

        clock.advance(1);
        assert_eq!(
            limiter.try_consume("10.0.0.1", RateCategory::Auth),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn keys_and_categories_are_independent() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let limiter = limiter(clock);

        for _ in 0..2 {
            limiter.try_consume("10.0.0.1", RateCategory::Otp);
        }
        assert_eq!(
            limiter.try_consume("10.0.0.1", RateCategory::Otp),
            RateLimitDecision::Limited
        );

        // Same key, different category: untouched budget.
        assert_eq!(
            limiter.try_consume("10.0.0.1", RateCategory::Auth),
            RateLimitDecision::Allowed
        );
        // Different key, same category: untouched budget.
        assert_eq!(
            limiter.try_consume("10.0.0.2", RateCategory::Otp),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn sweep_idle_drops_stale_buckets_only() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let limiter = limiter(Arc::clone(&clock));

        limiter.try_consume("old", RateCategory::Auth);
        clock.advance(600);
        limiter.try_consume("fresh", RateCategory::Auth);
        assert_eq!(limiter.bucket_count(), 2);

        limiter.sweep_idle(300);
        assert_eq!(limiter.bucket_count(), 1);

        // The fresh key keeps its consumed budget after the sweep.
        limiter.try_consume("fresh", RateCategory::Auth);
        limiter.try_consume("fresh", RateCategory::Auth);
        assert_eq!(
            limiter.try_consume("fresh", RateCategory::Auth),
            RateLimitDecision::Limited
        );
    }

    #[test]
    fn concurrent_consume_never_overspends() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let limiter = Arc::new(limiter(clock));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    let mut admitted = 0u32;
                    for _ in 0..4 {
                        if limiter.try_consume("shared", RateCategory::Auth)
                            == RateLimitDecision::Allowed
                        {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 3);
    }
}
