//! Observability infrastructure for the tuning daemon
//!
//! Provides:
//! - Prometheus metrics (event pipeline counters, handler latency, roster gauges)
//! - Structured logging for tunable changes and tuner lifecycle

use crate::models::MAX_ARITY;
use prometheus::{register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Histogram buckets for handler latency (seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<DaemonMetricsInner> = OnceLock::new();

struct DaemonMetricsInner {
    events_dispatched: IntCounter,
    events_deduped: IntCounter,
    events_dropped: IntCounter,
    sysctl_writes: IntCounter,
    rollbacks: IntCounter,
    ring_errors: IntCounter,
    tuners_live: IntGauge,
    namespaces_live: IntGauge,
    handler_latency_seconds: Histogram,
}

impl DaemonMetricsInner {
    fn new() -> Self {
        Self {
            events_dispatched: register_int_counter!(
                "bpftune_events_dispatched_total",
                "Ring events dispatched to tuner handlers"
            )
            .expect("Failed to register events_dispatched_total"),

            events_deduped: register_int_counter!(
                "bpftune_events_deduped_total",
                "Ring events suppressed by the dedup window"
            )
            .expect("Failed to register events_deduped_total"),

            events_dropped: register_int_counter!(
                "bpftune_events_dropped_total",
                "Ring events dropped (unknown tuner, evicted namespace, retired id)"
            )
            .expect("Failed to register events_dropped_total"),

            sysctl_writes: register_int_counter!(
                "bpftune_sysctl_writes_total",
                "Tunable values written back to the kernel"
            )
            .expect("Failed to register sysctl_writes_total"),

            rollbacks: register_int_counter!(
                "bpftune_rollbacks_total",
                "Tunables restored to their original values"
            )
            .expect("Failed to register rollbacks_total"),

            ring_errors: register_int_counter!(
                "bpftune_ring_errors_total",
                "Hard read failures on event ring sources"
            )
            .expect("Failed to register ring_errors_total"),

            tuners_live: register_int_gauge!(
                "bpftune_tuners_live",
                "Tuners currently initialized or attached"
            )
            .expect("Failed to register tuners_live"),

            namespaces_live: register_int_gauge!(
                "bpftune_namespaces_live",
                "Network namespaces currently tracked"
            )
            .expect("Failed to register namespaces_live"),

            handler_latency_seconds: register_histogram!(
                "bpftune_handler_latency_seconds",
                "Time spent in tuner event handlers",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register handler_latency_seconds"),
        }
    }
}

/// Daemon metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct DaemonMetrics {
    _private: (),
}

impl Default for DaemonMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(DaemonMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &DaemonMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_events_dispatched(&self) {
        self.inner().events_dispatched.inc();
    }

    pub fn inc_events_deduped(&self) {
        self.inner().events_deduped.inc();
    }

    pub fn inc_events_dropped(&self) {
        self.inner().events_dropped.inc();
    }

    pub fn inc_sysctl_writes(&self) {
        self.inner().sysctl_writes.inc();
    }

    pub fn inc_rollbacks(&self) {
        self.inner().rollbacks.inc();
    }

    pub fn inc_ring_errors(&self) {
        self.inner().ring_errors.inc();
    }

    pub fn set_tuners_live(&self, count: i64) {
        self.inner().tuners_live.set(count);
    }

    pub fn set_namespaces_live(&self, count: i64) {
        self.inner().namespaces_live.set(count);
    }

    pub fn observe_handler_latency(&self, duration_secs: f64) {
        self.inner().handler_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for tuning decisions
///
/// Centralizes the daemon's significant log lines so tuners and the registry
/// emit them consistently.
#[derive(Debug, Clone, Default)]
pub struct StructuredLogger;

impl StructuredLogger {
    pub fn new() -> Self {
        Self
    }

    /// Log receipt of a ring event by a tuner
    pub fn log_event(&self, scenario_id: u32, tuner: &str) {
        debug!("event (scenario {}) for tuner {}", scenario_id, tuner);
    }

    /// Log a tunable write with the tuner-supplied reason
    pub fn log_write(&self, tuner: &str, scenario_label: &str, reason: &str) {
        info!(tuner, scenario = scenario_label, "{}", reason);
    }

    /// Log correlation state for a tunable before an increase decision
    pub fn log_correlation(
        &self,
        tunable: &str,
        netns_cookie: i64,
        new: &[i64; MAX_ARITY],
        covar: f64,
        corr: f64,
    ) {
        info!(
            "covar for '{}' netns {} (new {} {} {}): {} ; corr {}",
            tunable, netns_cookie, new[0], new[1], new[2], covar, corr
        );
    }

    /// Log adoption of an externally-changed value
    pub fn log_external_mutation(&self, tunable: &str, netns_cookie: i64, adopted: &[i64; MAX_ARITY]) {
        warn!(
            tunable,
            netns_cookie,
            adopted = ?adopted,
            "tunable changed outside the daemon; adopting value as new original"
        );
    }

    /// Log tuner lifecycle transitions
    pub fn log_tuner_added(&self, tuner: &str, tuner_id: u32) {
        info!(tuner, tuner_id, "tuner initialized");
    }

    pub fn log_tuner_failed(&self, tuner: &str, reason: &str) {
        warn!(tuner, reason, "tuner init failed");
    }

    pub fn log_tuner_fini(&self, tuner: &str) {
        info!("fini tuner {}", tuner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_metrics_creation() {
        // Prometheus keeps a process-global registry, so this exercises the
        // handle rather than asserting on values.
        let metrics = DaemonMetrics::new();
        metrics.inc_events_dispatched();
        metrics.inc_events_deduped();
        metrics.inc_sysctl_writes();
        metrics.set_tuners_live(2);
        metrics.set_namespaces_live(1);
        metrics.observe_handler_latency(0.0001);
    }
}
