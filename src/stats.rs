//! Per-connection statistics: atomic counters plus an exponentially
//! smoothed latency average.
//!
//! Mirrors the counting style of `upstream.rs` in the teacher crate
//! (`AtomicUsize` consecutive-failure tracking), generalized to the full set
//! of counters the spec's data model names.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Exponentially smoothed moving average: `ema = (1-alpha)*ema + alpha*sample`.
///
/// Per spec §9's resolved open question, the fleet-wide response time is
/// derived by aggregating these per-connection EMAs on each completion, not
/// by periodic recomputation from raw samples.
#[derive(Debug)]
pub struct Ema {
    alpha: f64,
    value: Mutex<Option<f64>>,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            value: Mutex::new(None),
        }
    }

    pub fn update(&self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        let mut guard = self.value.lock();
        *guard = Some(match *guard {
            Some(prev) => (1.0 - self.alpha) * prev + self.alpha * sample_ms,
            None => sample_ms,
        });
    }

    pub fn value_ms(&self) -> f64 {
        (*self.value.lock()).unwrap_or(0.0)
    }
}

/// A point-in-time, lock-free-to-read snapshot of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub in_flight: u64,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
    pub last_success_unix_ms: Option<i64>,
    pub last_failure_unix_ms: Option<i64>,
    pub avg_latency_ms: f64,
}

impl StatsSnapshot {
    pub fn failure_rate(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            self.failed_operations as f64 / self.total_operations as f64
        }
    }
}

/// Mutable, owned-by-the-connection statistics. Writers (the worker
/// completing an operation, or a health probe) update these with atomics;
/// readers (selector, metrics sweep) take a consistent [`StatsSnapshot`].
#[derive(Debug)]
pub struct ConnectionStats {
    total_operations: AtomicU64,
    successful_operations: AtomicU64,
    failed_operations: AtomicU64,
    in_flight: AtomicU64,
    consecutive_failures: AtomicU64,
    consecutive_successes: AtomicU64,
    last_success_unix_ms: AtomicI64,
    last_failure_unix_ms: AtomicI64,
    latency_ema: Ema,
}

const NO_TIMESTAMP: i64 = -1;

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl ConnectionStats {
    pub fn new(ema_alpha: f64) -> Self {
        Self {
            total_operations: AtomicU64::new(0),
            successful_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            consecutive_successes: AtomicU64::new(0),
            last_success_unix_ms: AtomicI64::new(NO_TIMESTAMP),
            last_failure_unix_ms: AtomicI64::new(NO_TIMESTAMP),
            latency_ema: Ema::new(ema_alpha),
        }
    }

    pub fn begin_operation(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a completed operation. `cancelled` operations are neither a
    /// success nor a failure for the purposes of consecutive counters.
    pub fn record_success(&self, latency: Duration) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.total_operations.fetch_add(1, Ordering::SeqCst);
        self.successful_operations.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.consecutive_successes.fetch_add(1, Ordering::SeqCst);
        self.last_success_unix_ms.store(now_unix_ms(), Ordering::SeqCst);
        self.latency_ema.update(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.total_operations.fetch_add(1, Ordering::SeqCst);
        self.failed_operations.fetch_add(1, Ordering::SeqCst);
        self.consecutive_successes.store(0, Ordering::SeqCst);
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        self.last_failure_unix_ms.store(now_unix_ms(), Ordering::SeqCst);
        self.latency_ema.update(latency);
    }

    /// A cancelled operation clears the in-flight slot but is not recorded
    /// as either a success or a failure (never fed to the breaker).
    pub fn record_cancelled(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn consecutive_successes(&self) -> u64 {
        self.consecutive_successes.load(Ordering::SeqCst)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.latency_ema.value_ms()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_operations: self.total_operations.load(Ordering::SeqCst),
            successful_operations: self.successful_operations.load(Ordering::SeqCst),
            failed_operations: self.failed_operations.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            consecutive_successes: self.consecutive_successes.load(Ordering::SeqCst),
            last_success_unix_ms: non_negative(self.last_success_unix_ms.load(Ordering::SeqCst)),
            last_failure_unix_ms: non_negative(self.last_failure_unix_ms.load(Ordering::SeqCst)),
            avg_latency_ms: self.latency_ema.value_ms(),
        }
    }
}

fn non_negative(v: i64) -> Option<i64> {
    if v == NO_TIMESTAMP { None } else { Some(v) }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_are_zeroed() {
        let stats = ConnectionStats::default();
        let snap = stats.snapshot();
        assert_eq!(snap.total_operations, 0);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.avg_latency_ms, 0.0);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let stats = ConnectionStats::default();
        stats.begin_operation();
        stats.record_failure(Duration::from_millis(10));
        stats.begin_operation();
        stats.record_failure(Duration::from_millis(10));
        assert_eq!(stats.consecutive_failures(), 2);

        stats.begin_operation();
        stats.record_success(Duration::from_millis(5));
        assert_eq!(stats.consecutive_failures(), 0);
        assert_eq!(stats.consecutive_successes(), 1);
    }

    #[test]
    fn failure_resets_consecutive_successes() {
        let stats = ConnectionStats::default();
        stats.begin_operation();
        stats.record_success(Duration::from_millis(5));
        stats.begin_operation();
        stats.record_failure(Duration::from_millis(5));
        assert_eq!(stats.consecutive_successes(), 0);
        assert_eq!(stats.consecutive_failures(), 1);
    }

    #[test]
    fn in_flight_tracks_begin_and_completion() {
        let stats = ConnectionStats::default();
        stats.begin_operation();
        stats.begin_operation();
        assert_eq!(stats.in_flight(), 2);
        stats.record_success(Duration::from_millis(1));
        assert_eq!(stats.in_flight(), 1);
        stats.record_cancelled();
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn ema_converges_toward_repeated_sample() {
        let ema = Ema::new(0.5);
        ema.update(Duration::from_millis(100));
        ema.update(Duration::from_millis(100));
        ema.update(Duration::from_millis(100));
        assert!((ema.value_ms() - 100.0).abs() < 1.0);
    }
}
