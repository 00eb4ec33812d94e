//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

pub fn record_ws_connect() {
    metrics::gauge!("talk_connections_active").increment(1.0);
}

pub fn record_ws_disconnect() {
    metrics::gauge!("talk_connections_active").decrement(1.0);
}

/// Record a completed turn-based request with its duration.
pub fn record_turn(route: &str, duration_secs: f64) {
    let labels = [("route", route.to_string())];
    metrics::counter!("talk_turns_total", &labels).increment(1);
    metrics::histogram!("talk_turn_duration_seconds", &labels).record(duration_secs);
}

/// Record an outbound streaming event by its `type` tag.
pub fn record_event(kind: &'static str) {
    metrics::counter!("talk_stream_events_total", "type" => kind).increment(1);
}

/// Record an error by its wire code.
pub fn record_error(code: &str) {
    let labels = [("code", code.to_string())];
    metrics::counter!("talk_errors_total", &labels).increment(1);
}
