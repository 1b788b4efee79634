//! Periodic fleet metrics sweep and alert coalescing (part of C8).
//!
//! One periodic task, cancellable at shutdown — the same interval-timer
//! pattern the teacher uses for its health checker (`load_balancer.rs`),
//! applied here to aggregate statistics and raise coalesced alerts instead of
//! probing liveness.

use crate::config::{AlertThresholds, MonitoringConfig};
use crate::connection::ResilientConnection;
use crate::types::{Alert, AlertSeverity, ConnectionState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Fleet-wide counters produced by one sweep.
#[derive(Debug, Clone, Default)]
pub struct FleetMetrics {
    pub total_upstreams: usize,
    pub healthy_upstreams: usize,
    pub unhealthy_upstreams: usize,
    pub total_operations: u64,
    pub failed_operations: u64,
    pub error_rate_percent: f64,
    pub weighted_avg_latency_ms: f64,
}

/// Bounded ring buffer of alerts, coalesced by `(upstream, message-kind)` so a
/// persistent condition doesn't flood the log with near-duplicate entries.
pub struct AlertLog {
    capacity: usize,
    entries: Mutex<Vec<Alert>>,
    index: Mutex<HashMap<(Option<String>, String), usize>>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(Vec::new()), index: Mutex::new(HashMap::new()) }
    }

    /// Raise an alert, or bump/overwrite the existing coalesced entry if one
    /// with the same key is already present.
    pub fn raise(&self, alert: Alert) {
        let key = alert.coalesce_key();
        let mut index = self.index.lock();
        let mut entries = self.entries.lock();

        if let Some(&pos) = index.get(&key) {
            entries[pos] = alert;
            return;
        }

        if entries.len() >= self.capacity {
            entries.remove(0);
            if let Some(evicted_key) = index.iter().find_map(|(k, &v)| (v == 0).then(|| k.clone())) {
                index.remove(&evicted_key);
            }
            for v in index.values_mut() {
                if *v > 0 {
                    *v -= 1;
                }
            }
        }
        entries.push(alert);
        index.insert(key, entries.len() - 1);
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        self.entries.lock().clone()
    }
}

pub fn sweep(connections: &[Arc<ResilientConnection>]) -> FleetMetrics {
    let mut metrics = FleetMetrics { total_upstreams: connections.len(), ..Default::default() };
    let mut latency_weight_total = 0.0;
    let mut latency_weighted_sum = 0.0;

    for conn in connections {
        let state = conn.state();
        if matches!(state, ConnectionState::Connected | ConnectionState::Degraded) {
            metrics.healthy_upstreams += 1;
        } else {
            metrics.unhealthy_upstreams += 1;
        }

        let snapshot = conn.stats();
        metrics.total_operations += snapshot.total_operations;
        metrics.failed_operations += snapshot.failed_operations;
        if snapshot.total_operations > 0 {
            latency_weight_total += snapshot.total_operations as f64;
            latency_weighted_sum += snapshot.avg_latency_ms * snapshot.total_operations as f64;
        }
    }

    metrics.error_rate_percent = if metrics.total_operations == 0 {
        0.0
    } else {
        (metrics.failed_operations as f64 / metrics.total_operations as f64) * 100.0
    };
    metrics.weighted_avg_latency_ms = if latency_weight_total == 0.0 { 0.0 } else { latency_weighted_sum / latency_weight_total };

    metrics
}

/// Evaluate `monitoring.alertThresholds` against a sweep's output, raising
/// coalesced alerts for anything that crosses a threshold.
pub fn evaluate_alerts(metrics: &FleetMetrics, config: &MonitoringConfig, log: &AlertLog) {
    let thresholds: &AlertThresholds = &config.alert_thresholds;

    if metrics.error_rate_percent >= thresholds.error_rate_percent {
        log.raise(Alert::new(
            AlertSeverity::Warning,
            format!("fleet error rate {:.1}% exceeds threshold {:.1}%", metrics.error_rate_percent, thresholds.error_rate_percent),
            None,
        ));
    }

    if metrics.weighted_avg_latency_ms >= thresholds.response_time_ms {
        log.raise(Alert::new(
            AlertSeverity::Warning,
            format!(
                "fleet average response time {:.0}ms exceeds threshold {:.0}ms",
                metrics.weighted_avg_latency_ms, thresholds.response_time_ms
            ),
            None,
        ));
    }

    if metrics.total_upstreams > 0 {
        let unhealthy_fraction_percent = (metrics.unhealthy_upstreams as f64 / metrics.total_upstreams as f64) * 100.0;
        if unhealthy_fraction_percent >= thresholds.unhealthy_fraction_percent {
            log.raise(Alert::new(
                AlertSeverity::Critical,
                format!(
                    "{:.0}% of upstreams are unhealthy, exceeding threshold {:.0}%",
                    unhealthy_fraction_percent, thresholds.unhealthy_fraction_percent
                ),
                None,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_log_coalesces_by_upstream_and_message_kind() {
        let log = AlertLog::new(10);
        log.raise(Alert::new(AlertSeverity::Warning, "high error rate detected", Some("a".to_string())));
        log.raise(Alert::new(AlertSeverity::Warning, "high error rate worsened", Some("a".to_string())));
        assert_eq!(log.snapshot().len(), 1);
    }

    #[test]
    fn alert_log_keeps_distinct_upstreams_separate() {
        let log = AlertLog::new(10);
        log.raise(Alert::new(AlertSeverity::Warning, "high error rate detected", Some("a".to_string())));
        log.raise(Alert::new(AlertSeverity::Warning, "high error rate detected", Some("b".to_string())));
        assert_eq!(log.snapshot().len(), 2);
    }

    #[test]
    fn alert_log_evicts_oldest_past_capacity() {
        let log = AlertLog::new(1);
        log.raise(Alert::new(AlertSeverity::Info, "first message here", Some("a".to_string())));
        log.raise(Alert::new(AlertSeverity::Info, "second message here", Some("b".to_string())));
        assert_eq!(log.snapshot().len(), 1);
    }

    #[test]
    fn alert_log_reraising_an_evicted_key_does_not_corrupt_index() {
        // Two eviction cycles over four distinct upstreams, then two of the
        // already-evicted keys ("a", "c") get reused. A fresh FIFO insert of a
        // key not currently tracked must evict whatever is genuinely oldest —
        // if the evicted key's stale index entry survives, it instead
        // overwrites an unrelated, still-live slot and leaves a long-gone key
        // ("d") lingering past its eviction.
        let log = AlertLog::new(2);
        let raise = |upstream: &str| {
            log.raise(Alert::new(AlertSeverity::Info, "upstream issue detected", Some(upstream.to_string())));
        };
        raise("a");
        raise("b"); // entries: [a, b]
        raise("c"); // evicts a -> [b, c]
        raise("d"); // evicts b -> [c, d]
        raise("a"); // a re-raised (was evicted): must evict oldest (c) -> [d, a]
        raise("c"); // c re-raised (was evicted): must evict oldest (d) -> [a, c]

        let snapshot = log.snapshot();
        let upstreams: Vec<_> = snapshot.iter().filter_map(|alert| alert.upstream.clone()).collect();
        assert_eq!(snapshot.len(), 2);
        assert!(upstreams.contains(&"a".to_string()), "most recently re-raised key was wrongly evicted: {upstreams:?}");
        assert!(!upstreams.contains(&"d".to_string()), "stale index let an already-evicted key linger: {upstreams:?}");
    }

    #[test]
    fn empty_fleet_has_zero_error_rate() {
        let metrics = sweep(&[]);
        assert_eq!(metrics.error_rate_percent, 0.0);
    }
}
