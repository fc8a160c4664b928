//! Prometheus metrics for operator observability.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus) listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a finished reconcile pass.
pub fn reconcile_finished(controller: &str, outcome: &str) {
    counter!(
        "preview_reconciles_total",
        "controller" => controller.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an instance phase transition.
pub fn phase_changed(phase: &str) {
    counter!("preview_instance_transitions_total", "phase" => phase.to_string()).increment(1);
}

/// Record build duration.
pub fn build_duration(duration_secs: f64) {
    histogram!("preview_build_duration_seconds").record(duration_secs);
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("preview_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record a posted status comment.
pub fn comment_posted() {
    counter!("preview_comments_posted_total").increment(1);
}

/// Record instances created by detection.
pub fn instances_created(count: usize) {
    counter!("preview_instances_created_total").increment(count as u64);
}

/// Set the number of keys waiting in a controller's queue.
pub fn queue_depth(controller: &str, depth: usize) {
    gauge!("preview_queue_depth", "controller" => controller.to_string()).set(depth as f64);
}
