//! Process-wide Prometheus metrics not already covered by
//! `metrics_store` (which owns the per-channel counters/histogram).
//! This module owns the HTTP-surface counters and the `/metrics`
//! scrape handler.

use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder};

use crate::connection_tracker::ConnectionTracker;

lazy_static! {
    static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "axonhub_http_requests_total",
        "Total inbound HTTP requests by route and status class",
        &["route", "status_class"]
    )
    .unwrap();
    static ref ACTIVE_CONNECTIONS: Gauge = register_gauge!(
        "axonhub_active_upstream_connections",
        "Sum of in-flight upstream requests across all channels"
    )
    .unwrap();
}

pub fn record_http_request(route: &str, status: u16) {
    let class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };
    HTTP_REQUESTS_TOTAL.with_label_values(&[route, class]).inc();
}

/// Called periodically (or on each dispatch) to mirror a channel's
/// active count into the process-wide gauge. Coarser than per-channel
/// counters but cheap enough to sample on every request.
pub fn sync_active_connections_gauge(tracker: &ConnectionTracker, channel_ids: &[String]) {
    let total: i64 = channel_ids.iter().map(|id| tracker.active(id)).sum();
    ACTIVE_CONNECTIONS.set(total as f64);
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    ([("content-type", "text/plain; version=0.0.4")], buffer)
}
