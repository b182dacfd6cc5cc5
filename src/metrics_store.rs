//! In-memory per-channel aggregated metrics, updated by the pipeline on
//! every attempt's terminal `PerformanceRecord`.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};
use std::collections::HashMap;

use crate::canonical::PerformanceRecord;

lazy_static! {
    static ref CHANNEL_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "axonhub_channel_requests_total",
        "Total dispatch attempts per channel",
        &["channel_id"]
    )
    .unwrap();
    static ref CHANNEL_SUCCESS_TOTAL: CounterVec = register_counter_vec!(
        "axonhub_channel_success_total",
        "Successful dispatch attempts per channel",
        &["channel_id"]
    )
    .unwrap();
    static ref CHANNEL_FAILURE_TOTAL: CounterVec = register_counter_vec!(
        "axonhub_channel_failure_total",
        "Failed dispatch attempts per channel",
        &["channel_id"]
    )
    .unwrap();
    static ref ATTEMPT_LATENCY_SECONDS: HistogramVec = register_histogram_vec!(
        "axonhub_attempt_latency_seconds",
        "Per-attempt upstream latency in seconds",
        &["channel_id"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();
}

/// Snapshot of a channel's rolling health, read by `ErrorAwareStrategy`
/// and `WeightRoundRobinStrategy`.
#[derive(Debug, Clone, Default)]
pub struct AggregatedMetrics {
    pub request_count: u64,
    pub success_count: u64,
    pub consecutive_failures: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl AggregatedMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.request_count as f64
    }
}

/// Process-wide, per-channel metrics store. Updates for a given channel
/// are serialized through a single `RwLock` entry; reads observe a
/// consistent snapshot (a clone taken under the read lock).
#[derive(Debug, Default)]
pub struct MetricsStore {
    channels: RwLock<HashMap<String, AggregatedMetrics>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a terminated `PerformanceRecord` into the channel's
    /// aggregated metrics and mirrors the update into Prometheus.
    pub fn record(&self, record: &PerformanceRecord) {
        let mut channels = self.channels.write();
        let entry = channels.entry(record.channel_id.clone()).or_default();
        entry.request_count += 1;
        CHANNEL_REQUESTS_TOTAL
            .with_label_values(&[&record.channel_id])
            .inc();

        if record.success {
            entry.success_count += 1;
            entry.consecutive_failures = 0;
            entry.last_success_at = Some(Utc::now());
            CHANNEL_SUCCESS_TOTAL
                .with_label_values(&[&record.channel_id])
                .inc();
        } else {
            entry.consecutive_failures += 1;
            entry.last_failure_at = Some(Utc::now());
            CHANNEL_FAILURE_TOTAL
                .with_label_values(&[&record.channel_id])
                .inc();
        }

        if let (_, Some(request_ms), _) = record.calculate() {
            ATTEMPT_LATENCY_SECONDS
                .with_label_values(&[&record.channel_id])
                .observe(request_ms as f64 / 1000.0);
        }

        tracing::debug!(
            channel_id = %record.channel_id,
            success = record.success,
            request_count = entry.request_count,
            consecutive_failures = entry.consecutive_failures,
            "metrics recorded"
        );
    }

    pub fn get_channel_metrics(&self, channel_id: &str) -> AggregatedMetrics {
        self.channels
            .read()
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_record(channel_id: &str) -> PerformanceRecord {
        let mut record = PerformanceRecord::start(channel_id, false);
        record.mark_success(Some(10));
        record
    }

    fn failure_record(channel_id: &str) -> PerformanceRecord {
        let mut record = PerformanceRecord::start(channel_id, false);
        record.mark_failed(502);
        record
    }

    #[test]
    fn records_success_resets_consecutive_failures() {
        let store = MetricsStore::new();
        store.record(&failure_record("ch1"));
        store.record(&failure_record("ch1"));
        assert_eq!(store.get_channel_metrics("ch1").consecutive_failures, 2);

        store.record(&success_record("ch1"));
        let metrics = store.get_channel_metrics("ch1");
        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.request_count, 3);
    }

    #[test]
    fn records_failure_increments_consecutive_failures() {
        let store = MetricsStore::new();
        store.record(&failure_record("ch1"));
        assert_eq!(store.get_channel_metrics("ch1").consecutive_failures, 1);
        assert!(store.get_channel_metrics("ch1").last_failure_at.is_some());
    }

    #[test]
    fn unknown_channel_returns_default() {
        let store = MetricsStore::new();
        let metrics = store.get_channel_metrics("missing");
        assert_eq!(metrics.request_count, 0);
        assert_eq!(metrics.success_rate(), 1.0);
    }

    #[test]
    fn channels_are_independent() {
        let store = MetricsStore::new();
        store.record(&success_record("ch1"));
        store.record(&failure_record("ch2"));
        assert_eq!(store.get_channel_metrics("ch1").success_count, 1);
        assert_eq!(store.get_channel_metrics("ch2").consecutive_failures, 1);
    }

    #[test]
    fn success_rate_computed_correctly() {
        let store = MetricsStore::new();
        store.record(&success_record("ch1"));
        store.record(&success_record("ch1"));
        store.record(&failure_record("ch1"));
        let metrics = store.get_channel_metrics("ch1");
        assert!((metrics.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}
