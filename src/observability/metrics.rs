//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_downstream_calls_total` (counter): terminal outcomes by route
//! - `gateway_downstream_call_duration_seconds` (histogram)
//! - `gateway_pool_events_total` (counter): reused, created, discarded, evicted
//! - `gateway_breaker_rejections_total` (counter): calls refused by an open breaker
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Labels stay low-cardinality (route name, host, outcome)

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

/// Record the terminal outcome of one downstream call.
pub fn record_call_outcome(route: &str, outcome: &'static str, status: u16, start: Instant) {
    counter!(
        "gateway_downstream_calls_total",
        "route" => route.to_string(),
        "outcome" => outcome,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("gateway_downstream_call_duration_seconds", "route" => route.to_string())
        .record(start.elapsed().as_secs_f64());
}

/// Record a pool lifecycle event for a destination host.
pub fn record_pool_event(host: &str, event: &'static str) {
    counter!("gateway_pool_events_total", "host" => host.to_string(), "event" => event).increment(1);
}

/// Record a call refused because its breaker is open.
pub fn record_breaker_rejection(host: &str) {
    counter!("gateway_breaker_rejections_total", "host" => host.to_string()).increment(1);
}
