//! Circuit breaker (C2): tracks failures per upstream and opens/half-opens/
//! closes independently of the resilient connection's own state machine.
//!
//! Generalizes the three-phase breaker sketched in the teacher's
//! `upstream.rs` (healthy / unhealthy / cooldown) into the full
//! closed/open/half-open machine the spec requires, including an optional
//! rolling failure-rate window.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Observable state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Why `allow()` returned what it returned. Useful for logging and tests;
/// callers generally only care about the boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    ClosedNormalOperation,
    HalfOpenProbe,
    OpenCooldownNotElapsed,
    HalfOpenProbeAlreadyInFlight,
}

/// Configuration for a [`CircuitBreaker`] instance.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Time spent `Open` before transitioning to `HalfOpen`.
    pub cooldown: Duration,
    /// If set, the circuit also opens when the failure rate over the last
    /// `rolling_window` operations crosses `failure_threshold` as a
    /// fraction, once at least `rolling_window` samples have been seen.
    pub rolling_window: Option<usize>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
            rolling_window: None,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Closed {
        consecutive_failures: u32,
    },
    Open {
        opened_at: Instant,
        probe_dispatched: bool,
    },
    HalfOpen {
        consecutive_successes: u32,
    },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    window: VecDeque<bool>,
}

/// Per-upstream circuit breaker. All mutating operations are serialized via
/// an internal lock; `allow()` may be invoked from any concurrent context.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Closed { consecutive_failures: 0 },
                window: VecDeque::with_capacity(config.rolling_window.unwrap_or(0)),
            }),
            config,
        }
    }

    /// Whether a new call is permitted right now, and why.
    ///
    /// While `Open`, returns `false` until the cooldown elapses; at that
    /// point it transitions to `HalfOpen` and returns `true` exactly once
    /// (the probe), then `false` again until that probe resolves.
    pub fn allow(&self) -> (bool, AllowReason) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match &mut inner.phase {
            Phase::Closed { .. } => (true, AllowReason::ClosedNormalOperation),
            Phase::Open { opened_at, probe_dispatched } => {
                if now.duration_since(*opened_at) >= self.config.cooldown {
                    if *probe_dispatched {
                        // Already probing under this Open episode, but we
                        // haven't observed the outcome transition it to
                        // HalfOpen yet (exit() drives that transition).
                        (false, AllowReason::HalfOpenProbeAlreadyInFlight)
                    } else {
                        *probe_dispatched = true;
                        inner.phase = Phase::HalfOpen { consecutive_successes: 0 };
                        (true, AllowReason::HalfOpenProbe)
                    }
                } else {
                    (false, AllowReason::OpenCooldownNotElapsed)
                }
            }
            Phase::HalfOpen { .. } => (false, AllowReason::HalfOpenProbeAlreadyInFlight),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.push_window(&mut inner, true);
        match &mut inner.phase {
            Phase::Closed { consecutive_failures } => {
                *consecutive_failures = 0;
            }
            Phase::Open { .. } => {
                // A success arriving while nominally Open (e.g. a stray
                // result from a previous HalfOpen probe) is ignored.
            }
            Phase::HalfOpen { consecutive_successes } => {
                *consecutive_successes += 1;
                if *consecutive_successes >= self.config.success_threshold {
                    inner.phase = Phase::Closed { consecutive_failures: 0 };
                    inner.window.clear();
                }
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.push_window(&mut inner, false);
        match &mut inner.phase {
            Phase::Closed { consecutive_failures } => {
                *consecutive_failures += 1;
                let threshold_tripped = *consecutive_failures >= self.config.failure_threshold;
                let rolling_tripped = self.rolling_window_tripped(&inner.window);
                if threshold_tripped || rolling_tripped {
                    inner.phase = Phase::Open {
                        opened_at: Instant::now(),
                        probe_dispatched: false,
                    };
                }
            }
            Phase::Open { .. } => {}
            Phase::HalfOpen { .. } => {
                inner.phase = Phase::Open {
                    opened_at: Instant::now(),
                    probe_dispatched: false,
                };
            }
        }
    }

    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Open {
            opened_at: Instant::now(),
            probe_dispatched: false,
        };
    }

    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Closed { consecutive_failures: 0 };
        inner.window.clear();
    }

    pub fn state(&self) -> CircuitState {
        match self.inner.lock().phase {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn push_window(&self, inner: &mut Inner, success: bool) {
        if let Some(size) = self.config.rolling_window {
            inner.window.push_back(success);
            while inner.window.len() > size {
                inner.window.pop_front();
            }
        }
    }

    fn rolling_window_tripped(&self, window: &VecDeque<bool>) -> bool {
        let Some(size) = self.config.rolling_window else {
            return false;
        };
        if window.len() < size {
            return false;
        }
        let failures = window.iter().filter(|ok| !**ok).count();
        let rate = failures as f64 / window.len() as f64;
        rate >= (self.config.failure_threshold as f64 / size as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            cooldown: Duration::from_millis(cooldown_ms),
            rolling_window: None,
        })
    }

    #[test]
    fn starts_closed_and_allows() {
        let cb = breaker(3, 2, 100);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow().0);
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let cb = breaker(3, 2, 1_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        let (allowed, reason) = cb.allow();
        assert!(!allowed);
        assert_eq!(reason, AllowReason::OpenCooldownNotElapsed);
    }

    #[test]
    fn half_open_after_cooldown_probes_once() {
        let cb = breaker(1, 1, 20);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(30));

        let (allowed, reason) = cb.allow();
        assert!(allowed);
        assert_eq!(reason, AllowReason::HalfOpenProbe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // A second probe attempt before the first resolves is rejected.
        let (allowed_again, _) = cb.allow();
        assert!(!allowed_again);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let cb = breaker(1, 2, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        cb.allow();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_failure() {
        let cb = breaker(1, 2, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        cb.allow();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn force_open_and_close_are_immediate() {
        let cb = breaker(5, 2, 1_000);
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow().0);
    }

    #[test]
    fn rolling_window_opens_on_failure_rate() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5, // interpreted as "5 of N" once window is full
            success_threshold: 1,
            cooldown: Duration::from_millis(100),
            rolling_window: Some(10),
        });
        for _ in 0..5 {
            cb.record_failure();
        }
        for _ in 0..5 {
            cb.record_success();
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
