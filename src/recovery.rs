//! Recovery scheduler (C7): drives staggered re-connection of failed
//! upstreams.
//!
//! Nothing in the teacher crate does this — `load_balancer.rs` simply skips
//! unhealthy nodes and lets its own periodic health checker notice recovery.
//! This module adds the explicit backoff-and-stagger machinery spec §4.7
//! requires, built from the same `tokio::time`/`tokio::sync::Semaphore`
//! primitives the teacher already depends on.

use crate::connection::ResilientConnection;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailoverStrategy {
    /// No automatic reconnect; traffic just flows to healthy peers.
    Immediate,
    /// Recovery waits for `failback_delay` then attempts reconnect.
    CircuitBreaker,
    /// Like `CircuitBreaker`, plus a post-reconnect selection-weight ramp.
    Gradual,
    /// No automatic recovery; an operator must call `force_recovery`.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub auto_recovery: bool,
    pub strategy: FailoverStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_parallel_recoveries: usize,
    pub stagger_jitter: Duration,
    pub failback_delay: Duration,
    pub pre_recovery_health_check: bool,
    pub gradual_warmup: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_recovery: true,
            strategy: FailoverStrategy::CircuitBreaker,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_parallel_recoveries: 3,
            stagger_jitter: Duration::from_millis(250),
            failback_delay: Duration::from_secs(5),
            pre_recovery_health_check: true,
            gradual_warmup: Duration::from_secs(30),
        }
    }
}

/// Schedules and bounds concurrent recovery attempts across the fleet.
///
/// Ascending-consecutive-failures priority (spec §4.7) is approximated by
/// making backoff delay an increasing function of consecutive failures:
/// connections with fewer failures naturally reach the front of the
/// semaphore's wait queue first, rather than maintaining a separate priority
/// queue alongside it.
pub struct RecoveryScheduler {
    config: RecoveryConfig,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    /// Names with a recovery attempt chain already scheduled or in flight.
    /// The fleet manager observes `Failed` transitions from more than one
    /// place (initial connect, a mid-operation transport failure, a failed
    /// probe) and must not queue a second, redundant chain for the same
    /// upstream before the first resolves.
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl RecoveryScheduler {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_parallel_recoveries)),
            config,
            cancel: CancellationToken::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Drops any in-flight-chain bookkeeping for `name`. Called when an
    /// upstream is removed so a future re-`addUpstream` of the same name
    /// isn't blocked by a stale entry.
    pub fn forget(&self, name: &str) {
        self.in_flight.lock().remove(name);
    }

    /// Called by the fleet manager when a connection transitions to `Failed`.
    /// No-op for `Immediate` and `Manual` strategies, and a no-op if a
    /// recovery chain for this upstream is already running.
    pub fn on_failed(&self, conn: Arc<ResilientConnection>) {
        if !self.config.auto_recovery {
            return;
        }
        match self.config.strategy {
            FailoverStrategy::Immediate | FailoverStrategy::Manual => {}
            FailoverStrategy::CircuitBreaker | FailoverStrategy::Gradual => {
                if !self.in_flight.lock().insert(conn.name().to_string()) {
                    return;
                }
                self.spawn_attempt(conn, 1);
            }
        }
    }

    /// Operator-triggered recovery, bypassing backoff scheduling. Used for
    /// `Manual` strategy and ad hoc operator calls against any strategy.
    pub async fn force_recovery(&self, conn: Arc<ResilientConnection>) -> bool {
        let _permit = self.permits.acquire().await.expect("semaphore never closed");
        self.attempt_once(&conn).await
    }

    fn spawn_attempt(&self, conn: Arc<ResilientConnection>, attempt: u32) {
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        let config = self.config.clone();
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            let consecutive_failures = conn.stats().consecutive_failures;
            let delay = backoff_delay(&config, consecutive_failures.max(attempt as u64) as u32);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = permits.acquire() => permit.expect("semaphore never closed"),
            };

            let reconnected = conn.connect().await.is_ok();
            let succeeded = reconnected
                && (!config.pre_recovery_health_check || {
                    let healthy = conn.force_health_check().await;
                    if !healthy {
                        tracing::debug!(upstream = %conn.name(), attempt, "post-reconnect health check failed");
                        conn.mark_failed();
                    }
                    healthy
                });
            drop(permit);

            if succeeded {
                if config.strategy == FailoverStrategy::Gradual {
                    conn.begin_warmup(config.gradual_warmup);
                }
                tracing::info!(upstream = %conn.name(), attempt, "recovery succeeded");
                in_flight.lock().remove(conn.name());
            } else {
                tracing::warn!(upstream = %conn.name(), attempt, "recovery attempt failed, rescheduling");
                spawn_reschedule(conn, config, cancel, permits, in_flight, attempt + 1);
            }
        });
    }

    async fn attempt_once(&self, conn: &Arc<ResilientConnection>) -> bool {
        if self.config.pre_recovery_health_check && !conn.force_health_check().await {
            return false;
        }
        let succeeded = conn.connect().await.is_ok();
        if succeeded && self.config.strategy == FailoverStrategy::Gradual {
            conn.begin_warmup(self.config.gradual_warmup);
        }
        succeeded
    }
}

fn spawn_reschedule(
    conn: Arc<ResilientConnection>,
    config: RecoveryConfig,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    next_attempt: u32,
) {
    tokio::spawn(async move {
        let delay = backoff_delay(&config, next_attempt);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = permits.acquire() => permit.expect("semaphore never closed"),
        };
        let succeeded = conn.connect().await.is_ok();
        drop(permit);
        if succeeded {
            if config.strategy == FailoverStrategy::Gradual {
                conn.begin_warmup(config.gradual_warmup);
            }
            in_flight.lock().remove(conn.name());
        } else {
            tracing::warn!(upstream = %conn.name(), attempt = next_attempt, "recovery attempt failed, rescheduling");
            spawn_reschedule(conn, config, cancel, permits, in_flight, next_attempt + 1);
        }
    });
}

fn backoff_delay(config: &RecoveryConfig, attempt: u32) -> Duration {
    let exp = config.backoff_multiplier.powi(attempt as i32 - 1);
    let raw_ms = (config.base_delay.as_millis() as f64 * exp).min(config.max_delay.as_millis() as f64);
    let jitter_ms = rand::thread_rng().gen_range(0..=config.stagger_jitter.as_millis() as u64);
    Duration::from_millis(raw_ms as u64 + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempt() {
        let config = RecoveryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            stagger_jitter: Duration::from_millis(0),
            ..RecoveryConfig::default()
        };
        let first = backoff_delay(&config, 1);
        let second = backoff_delay(&config, 2);
        assert!(second >= first);
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = RecoveryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 10.0,
            stagger_jitter: Duration::from_millis(0),
            ..RecoveryConfig::default()
        };
        let delay = backoff_delay(&config, 10);
        assert!(delay <= Duration::from_millis(500));
    }
}
