//! Global ingest rate limiting.
//!
//! A single non-keyed limiter caps how many events per second the whole
//! service accepts, counting each event in a batch individually. Callers are
//! internal producers, so there is no per-tenant keying; the cap protects
//! ClickHouse and the idempotency index, not fairness between callers.

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Result of asking for capacity for N events.
#[derive(Debug)]
pub enum RateLimitResult {
    Allowed,
    /// Capacity exhausted; the response carries the limit and a retry hint.
    Limited {
        limit: u32,
        retry_after_secs: u64,
    },
}

/// Global events-per-second cap over both ingest endpoints.
pub struct IngestRateLimiter {
    limiter: Option<DirectLimiter>,
    limit: u32,
}

impl IngestRateLimiter {
    /// Build a limiter allowing `events_per_second` events, with a burst of
    /// the same size. Zero disables limiting.
    pub fn new(events_per_second: u32) -> Self {
        let limiter = NonZeroU32::new(events_per_second)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate).allow_burst(rate)));
        Self {
            limiter,
            limit: events_per_second,
        }
    }

    /// Ask for capacity to ingest `n` events.
    pub fn check_events(&self, n: u32) -> RateLimitResult {
        let Some(limiter) = &self.limiter else {
            return RateLimitResult::Allowed;
        };
        let Some(n) = NonZeroU32::new(n) else {
            return RateLimitResult::Allowed;
        };

        match limiter.check_n(n) {
            Ok(Ok(())) => RateLimitResult::Allowed,
            Ok(Err(not_until)) => {
                let wait =
                    not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
                RateLimitResult::Limited {
                    limit: self.limit,
                    // Ceil so a sub-second wait still tells clients to back off.
                    retry_after_secs: wait.as_secs().max(1),
                }
            }
            // Batch larger than the burst can never pass; tell the client to
            // retry (smaller) later rather than hammering.
            Err(_insufficient) => RateLimitResult::Limited {
                limit: self.limit,
                retry_after_secs: 1,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_within_quota() {
        let limiter = IngestRateLimiter::new(10);
        assert!(matches!(limiter.check_events(1), RateLimitResult::Allowed));
        assert!(matches!(limiter.check_events(5), RateLimitResult::Allowed));
    }

    #[test]
    fn test_limits_when_burst_exhausted() {
        let limiter = IngestRateLimiter::new(5);
        assert!(matches!(limiter.check_events(5), RateLimitResult::Allowed));
        assert!(matches!(
            limiter.check_events(1),
            RateLimitResult::Limited { limit: 5, .. }
        ));
    }

    #[test]
    fn test_oversized_batch_is_limited_not_panicking() {
        let limiter = IngestRateLimiter::new(5);
        assert!(matches!(
            limiter.check_events(100),
            RateLimitResult::Limited { .. }
        ));
    }

    #[test]
    fn test_zero_disables() {
        let limiter = IngestRateLimiter::new(0);
        for _ in 0..1000 {
            assert!(matches!(limiter.check_events(10), RateLimitResult::Allowed));
        }
    }

    #[test]
    fn test_zero_events_is_free() {
        let limiter = IngestRateLimiter::new(1);
        assert!(matches!(limiter.check_events(0), RateLimitResult::Allowed));
    }
}
