//! Prometheus metrics for the reconciliation engine.
//!
//! # Metrics
//!
//! ## Counters
//! - `halyard_reconcile_total` - Reconcile cycles by outcome
//! - `halyard_node_update_total` - Node watch deliveries by result
//! - `halyard_config_update_total` - Config watch deliveries
//! - `halyard_loopback_additions_total` / `halyard_loopback_removals_total`
//! - `halyard_loopback_addition_errors_total` / `halyard_loopback_removal_errors_total`
//! - `halyard_director_check_total` - Real-server liveness probes by result
//! - `halyard_coordination_hazard_total` - Probes observed during hysteresis
//!
//! ## Gauges
//! - `halyard_loopback_desired` - Desired VIP count per family
//! - `halyard_loopback_config_healthy` - Last address pass succeeded (1/0)
//! - `halyard_config_queue_depth` - Config deliveries pending in channel
//! - `halyard_worker_running` - Whether the local worker is active
//!
//! ## Histograms
//! - `halyard_reconcile_duration_seconds` - Reconcile wall time by outcome
//!
//! Metrics are side effects only; the registry is exposed for whatever
//! scrape surface the process wires up elsewhere.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::time::Duration;

/// Reconcile outcome label values.
pub mod outcome {
    /// Parity held; nothing was done.
    pub const NOOP: &str = "noop";
    /// The cycle converged.
    pub const COMPLETE: &str = "complete";
    /// Observation failed before any mutation.
    pub const ERROR: &str = "error";
    /// A mutating sub-operation failed; the next tick retries.
    pub const CRITICAL: &str = "critical";
}

/// Histogram buckets for reconcile durations (seconds).
const RECONCILE_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metrics registry for one running role.
pub struct Metrics {
    registry: Registry,

    /// Reconcile cycles by outcome.
    pub reconcile: IntCounterVec,
    /// Reconcile durations by outcome.
    pub reconcile_duration: HistogramVec,
    /// Node watch deliveries by result ("noop"/"updated").
    pub node_updates: IntCounterVec,
    /// Config watch deliveries.
    pub config_updates: IntCounter,

    /// Loopback additions issued, by family.
    pub loopback_additions: IntCounterVec,
    /// Loopback removals issued, by family.
    pub loopback_removals: IntCounterVec,
    /// Failed loopback additions, by family.
    pub loopback_addition_errors: IntCounterVec,
    /// Failed loopback removals, by family.
    pub loopback_removal_errors: IntCounterVec,
    /// Desired VIP count, by family.
    pub loopback_desired: IntGaugeVec,
    /// Whether the last address pass succeeded, by family.
    pub loopback_config_healthy: IntGaugeVec,

    /// Config deliveries pending in the watch channel.
    pub config_queue_depth: IntGauge,

    /// Liveness probes by result ("up"/"down").
    pub director_checks: IntCounterVec,
    /// Probes that disagreed with the last decision without reaching the
    /// failover threshold.
    pub coordination_hazards: IntCounter,
    /// Whether the local worker is running.
    pub worker_running: IntGauge,
}

impl Metrics {
    /// Create and register all engine metrics under the given role label.
    pub fn new(role: &str) -> Self {
        let registry = Registry::new();

        let reconcile = IntCounterVec::new(
            Opts::new("halyard_reconcile_total", "Reconcile cycles by outcome")
                .const_label("role", role),
            &["outcome"],
        )
        .expect("metric creation should not fail");

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "halyard_reconcile_duration_seconds",
                "Reconcile wall time by outcome",
            )
            .const_label("role", role)
            .buckets(RECONCILE_BUCKETS.to_vec()),
            &["outcome"],
        )
        .expect("metric creation should not fail");

        let node_updates = IntCounterVec::new(
            Opts::new("halyard_node_update_total", "Node watch deliveries by result")
                .const_label("role", role),
            &["result"],
        )
        .expect("metric creation should not fail");

        let config_updates = IntCounter::with_opts(
            Opts::new("halyard_config_update_total", "Config watch deliveries")
                .const_label("role", role),
        )
        .expect("metric creation should not fail");

        let loopback_additions = IntCounterVec::new(
            Opts::new("halyard_loopback_additions_total", "Loopback additions issued")
                .const_label("role", role),
            &["family"],
        )
        .expect("metric creation should not fail");

        let loopback_removals = IntCounterVec::new(
            Opts::new("halyard_loopback_removals_total", "Loopback removals issued")
                .const_label("role", role),
            &["family"],
        )
        .expect("metric creation should not fail");

        let loopback_addition_errors = IntCounterVec::new(
            Opts::new(
                "halyard_loopback_addition_errors_total",
                "Failed loopback additions",
            )
            .const_label("role", role),
            &["family"],
        )
        .expect("metric creation should not fail");

        let loopback_removal_errors = IntCounterVec::new(
            Opts::new(
                "halyard_loopback_removal_errors_total",
                "Failed loopback removals",
            )
            .const_label("role", role),
            &["family"],
        )
        .expect("metric creation should not fail");

        let loopback_desired = IntGaugeVec::new(
            Opts::new("halyard_loopback_desired", "Desired VIP count").const_label("role", role),
            &["family"],
        )
        .expect("metric creation should not fail");

        let loopback_config_healthy = IntGaugeVec::new(
            Opts::new(
                "halyard_loopback_config_healthy",
                "Whether the last address pass succeeded",
            )
            .const_label("role", role),
            &["family"],
        )
        .expect("metric creation should not fail");

        let config_queue_depth = IntGauge::with_opts(
            Opts::new(
                "halyard_config_queue_depth",
                "Config deliveries pending in the watch channel",
            )
            .const_label("role", role),
        )
        .expect("metric creation should not fail");

        let director_checks = IntCounterVec::new(
            Opts::new("halyard_director_check_total", "Liveness probes by result")
                .const_label("role", role),
            &["result"],
        )
        .expect("metric creation should not fail");

        let coordination_hazards = IntCounter::with_opts(
            Opts::new(
                "halyard_coordination_hazard_total",
                "Probes that disagreed with the last decision below the failover threshold",
            )
            .const_label("role", role),
        )
        .expect("metric creation should not fail");

        let worker_running = IntGauge::with_opts(
            Opts::new("halyard_worker_running", "Whether the local worker is active")
                .const_label("role", role),
        )
        .expect("metric creation should not fail");

        for collector in [
            Box::new(reconcile.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(reconcile_duration.clone()),
            Box::new(node_updates.clone()),
            Box::new(config_updates.clone()),
            Box::new(loopback_additions.clone()),
            Box::new(loopback_removals.clone()),
            Box::new(loopback_addition_errors.clone()),
            Box::new(loopback_removal_errors.clone()),
            Box::new(loopback_desired.clone()),
            Box::new(loopback_config_healthy.clone()),
            Box::new(config_queue_depth.clone()),
            Box::new(director_checks.clone()),
            Box::new(coordination_hazards.clone()),
            Box::new(worker_running.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registration should not fail");
        }

        Metrics {
            registry,
            reconcile,
            reconcile_duration,
            node_updates,
            config_updates,
            loopback_additions,
            loopback_removals,
            loopback_addition_errors,
            loopback_removal_errors,
            loopback_desired,
            loopback_config_healthy,
            config_queue_depth,
            director_checks,
            coordination_hazards,
            worker_running,
        }
    }

    /// Record a finished reconcile attempt.
    pub fn observe_reconcile(&self, outcome: &str, elapsed: Duration) {
        self.reconcile.with_label_values(&[outcome]).inc();
        self.reconcile_duration
            .with_label_values(&[outcome])
            .observe(elapsed.as_secs_f64());
    }

    /// The underlying registry, for a scrape surface.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_metrics_register() {
        let metrics = Metrics::new("director");
        metrics.observe_reconcile(outcome::COMPLETE, Duration::from_millis(12));
        metrics.node_updates.with_label_values(&["noop"]).inc();
        metrics.worker_running.set(1);

        let mut rendered = String::new();
        prometheus::TextEncoder::new()
            .encode_utf8(&metrics.registry().gather(), &mut rendered)
            .expect("metrics should encode");
        assert!(rendered.contains("halyard_reconcile_total"));
        assert!(rendered.contains("halyard_worker_running"));
        assert!(rendered.contains("role=\"director\""));
    }

    #[test]
    fn reconcile_counter_tracks_outcomes() {
        let metrics = Metrics::new("realserver");
        metrics.observe_reconcile(outcome::NOOP, Duration::from_micros(50));
        metrics.observe_reconcile(outcome::NOOP, Duration::from_micros(50));
        assert_eq!(
            metrics.reconcile.with_label_values(&[outcome::NOOP]).get(),
            2
        );
    }
}
