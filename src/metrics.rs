//! Prometheus metrics for leadflow.
//!
//! Exposed via the `/metrics` endpoint.
//!
//! ## Metrics
//!
//! ### Counters
//! - `leadflow_nodes_executed_total` - Node evaluations by node_type and outcome
//! - `leadflow_executions_finished_total` - Executions reaching a terminal status
//! - `leadflow_executions_started_total` - Create-or-restart by trigger source
//! - `leadflow_wakeups_processed_total` - Wake-up deliveries by result
//! - `leadflow_concurrent_updates_total` - Optimistic writes that lost
//! - `leadflow_emails_sent_total` - Email sends by provider and success
//!
//! ### Histograms
//! - `leadflow_wakeup_lag_seconds` - How late a wake-up was delivered

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics exporter.
///
/// Call once at startup. Later calls return the existing handle.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Execution Metrics
// =============================================================================

/// Record a node evaluation.
pub fn record_node_execution(node_type: &str, outcome: &str) {
    counter!(
        "leadflow_nodes_executed_total",
        "node_type" => node_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an execution starting (or restarting).
pub fn record_execution_started(source: &str) {
    counter!(
        "leadflow_executions_started_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record an execution reaching a terminal status.
pub fn record_execution_finished(status: &str) {
    counter!(
        "leadflow_executions_finished_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record an optimistic write that was rejected.
pub fn record_concurrent_update(operation: &str) {
    counter!(
        "leadflow_concurrent_updates_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// =============================================================================
// Wake-up Metrics
// =============================================================================

/// Record a processed wake-up.
pub fn record_wakeup(result: &str) {
    counter!(
        "leadflow_wakeups_processed_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record how far past its due time a wake-up was delivered.
pub fn record_wakeup_lag(lag: Duration) {
    histogram!("leadflow_wakeup_lag_seconds").record(lag.as_secs_f64());
}

// =============================================================================
// Email Metrics
// =============================================================================

/// Record an email send attempt.
pub fn record_email(provider: &str, success: bool) {
    counter!(
        "leadflow_emails_sent_total",
        "provider" => provider.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_node_execution("DELAY", "suspend");
        record_execution_started("manual");
        record_execution_finished("COMPLETED");
        record_concurrent_update("step");
        record_wakeup("resumed");
        record_wakeup_lag(Duration::from_millis(250));
        record_email("log", true);
    }

    #[test]
    fn test_render_after_init() {
        let _handle = init_metrics();
        record_execution_finished("FAILED");
        let output = render_metrics();
        assert!(!output.starts_with("# Metrics not initialized"));
    }
}
