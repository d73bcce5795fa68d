//! Circuit breaker protecting emission calls.
//!
//! State machine: `closed` → after N consecutive failures → `open` (calls are
//! instant no-ops) → after a cooldown → `half-open` (one probe call at a
//! time) → after M consecutive successes → `closed`. Any failure while
//! half-open reopens the circuit immediately.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker state, exposed to producer health surfaces so operators
/// can tell "telemetry degraded" apart from "pipeline broken".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; calls pass through.
    Closed,
    /// Calls are skipped without any network attempt.
    Open,
    /// Probing recovery with one call at a time.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    successes_since_open: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Thread-safe circuit breaker. Shared across worker tasks via the client.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                successes_since_open: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// Transitions `open` → `half-open` once the cooldown has elapsed. In
    /// half-open state only a single probe is allowed in flight.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled_down = inner
                    .last_failure
                    .is_some_and(|t| t.elapsed() >= self.config.cooldown);
                if cooled_down {
                    inner.state = BreakerState::HalfOpen;
                    inner.successes_since_open = 0;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.successes_since_open += 1;
                if inner.successes_since_open >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.successes_since_open = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        inner.consecutive_failures += 1;
        inner.successes_since_open = 0;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "emission circuit breaker opened"
                    );
                }
            }
            // A failed probe reopens immediately.
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
            }
            BreakerState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let b = breaker(1000);
        for _ in 0..4 {
            assert!(b.allow());
            b.record_failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let b = breaker(1000);
        for _ in 0..4 {
            b.record_failure();
        }
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes() {
        let b = breaker(10);
        for _ in 0..5 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());

        thread::sleep(Duration::from_millis(20));

        // Cooldown elapsed: one probe allowed.
        assert!(b.allow());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Probe in flight: concurrent call refused.
        assert!(!b.allow());

        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.allow());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker(10);
        for _ in 0..5 {
            b.record_failure();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }
}
