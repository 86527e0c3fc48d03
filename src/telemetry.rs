//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still works
/// — the `metrics` macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    // -- Deployment lifecycle --
    describe_counter!("mindmux_deploys_total", "Total deploy attempts");
    describe_counter!(
        "mindmux_deploy_failures_total",
        "Deploys that ended in the error state"
    );
    describe_histogram!(
        "mindmux_deploy_duration_seconds",
        "Wall-clock duration of successful deploys (spawn + weight load + readiness)"
    );
    describe_gauge!("mindmux_running_models", "Models currently in the running state");

    // -- Data plane --
    describe_counter!("mindmux_requests_total", "Data-plane requests processed");
    describe_histogram!(
        "mindmux_request_duration_seconds",
        "Chat completion duration (time to upstream response headers)"
    );
    describe_counter!(
        "mindmux_context_truncations_total",
        "Chat requests whose message history was truncated to fit the context window"
    );
    describe_counter!(
        "mindmux_context_overflows_total",
        "Chat requests rejected because even a minimal context could not fit"
    );

    // -- GPU --
    describe_gauge!("mindmux_gpu_memory_free_mb", "Free memory per GPU");
    describe_gauge!("mindmux_gpu_utilization_percent", "Utilization per GPU");

    // -- Router / reconciler --
    describe_counter!(
        "mindmux_router_regenerations_total",
        "Reverse-proxy include file regenerations"
    );
    describe_counter!(
        "mindmux_router_reload_failures_total",
        "Proxy reload signals that failed"
    );
    describe_counter!("mindmux_reconcile_runs_total", "Reconciliation passes");
    describe_counter!(
        "mindmux_reconcile_evictions_total",
        "Orphaned records evicted by the reconciler"
    );
}
