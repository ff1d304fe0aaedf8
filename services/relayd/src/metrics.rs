//! Prometheus metrics exposition
//!
//! The dispatch engine emits:
//!
//! - `dispatch_tasks_total` (counter): label `outcome`
//! - `dispatch_send_duration_seconds` (histogram)
//! - `dispatch_retries_total` (counter): label `class`
//! - `dispatch_pool_transitions_total` (counter): label `state`
//!
//! This module installs the recorder and adds the API-level request counter.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `dispatch_send_duration_seconds` with explicit buckets so it
/// renders as a Prometheus histogram (with `_bucket` lines usable from
/// `histogram_quantile()`) rather than the default summary. The buckets run
/// from 10ms out to the worst throttled-retry latencies.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "dispatch_send_duration_seconds".to_string(),
            ),
            &[
                0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0, 300.0, 1200.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed `/send` API request.
pub fn record_request(status: u16) {
    metrics::counter!("relay_requests_total", "status" => status.to_string()).increment(1);
}
