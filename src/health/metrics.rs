//! Metrics registry and Prometheus text exposition.

use crate::bacnet::StatsSnapshot;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Processing latency buckets in milliseconds.
pub const PROCESSING_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// Read latency buckets in milliseconds.
pub const READ_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0];

/// Fixed-bucket histogram; observations are milliseconds.
pub struct Histogram {
    bounds: &'static [f64],
    /// One slot per bound plus the +Inf overflow slot.
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    /// Sum kept in microseconds so it fits an atomic integer.
    sum_us: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, ms: f64) {
        let slot = self
            .bounds
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(self.bounds.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us
            .fetch_add((ms * 1000.0).max(0.0) as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        let mut cumulative = 0u64;
        for (i, bound) in self.bounds.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        cumulative += self.buckets[self.bounds.len()].load(Ordering::Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
        let _ = writeln!(
            out,
            "{name}_sum {}",
            self.sum_us.load(Ordering::Relaxed) as f64 / 1000.0
        );
        let _ = writeln!(out, "{name}_count {}", self.count());
        out.push('\n');
    }
}

/// Message-type counter indices.
pub const MSG_OBJECT_DEFINITION: usize = 0;
pub const MSG_VALUE_UPDATE: usize = 1;
pub const MSG_OBJECT_DELETE: usize = 2;
pub const MSG_DEVICE_CONFIG: usize = 3;

const MSG_LABELS: [&str; 4] = [
    "object_definition",
    "value_update",
    "object_delete",
    "device_config",
];

/// All gateway counters and histograms.
pub struct Metrics {
    pub events_received: AtomicU64,
    pub events_acked: AtomicU64,
    pub events_nakked: AtomicU64,
    pub consumer_reconnects: AtomicU64,
    pub messages_processed: [AtomicU64; 4],
    pub decode_errors: AtomicU64,
    pub registry_errors: AtomicU64,
    pub cache_errors: AtomicU64,
    pub cov_send_failures: AtomicU64,
    pub processing_latency: Histogram,
    pub read_latency: Histogram,
    start_time_secs: i64,
}

impl Metrics {
    pub fn new(start_time_secs: i64) -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_acked: AtomicU64::new(0),
            events_nakked: AtomicU64::new(0),
            consumer_reconnects: AtomicU64::new(0),
            messages_processed: Default::default(),
            decode_errors: AtomicU64::new(0),
            registry_errors: AtomicU64::new(0),
            cache_errors: AtomicU64::new(0),
            cov_send_failures: AtomicU64::new(0),
            processing_latency: Histogram::new(PROCESSING_BUCKETS),
            read_latency: Histogram::new(READ_BUCKETS),
            start_time_secs,
        }
    }

    pub fn note_processed(&self, message_index: usize) {
        self.messages_processed[message_index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed_total(&self) -> u64 {
        self.messages_processed
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Renders the text exposition format, folding in the gauges carried
    /// by the snapshot.
    pub fn render(&self, snapshot: &GatewaySnapshot) -> String {
        let mut out = String::with_capacity(4096);

        counter(
            &mut out,
            "process_start_time_seconds",
            "Start time of the process since unix epoch in seconds.",
            self.start_time_secs.max(0) as u64,
        );
        counter(
            &mut out,
            "events_received_total",
            "Events delivered by the event store.",
            self.events_received.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "events_acked_total",
            "Events acknowledged upstream.",
            self.events_acked.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "events_nakked_total",
            "Events negatively acknowledged upstream.",
            self.events_nakked.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "consumer_reconnects_total",
            "Event store reconnect attempts.",
            self.consumer_reconnects.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            out,
            "# HELP messages_processed_total Messages applied to the registry."
        );
        let _ = writeln!(out, "# TYPE messages_processed_total counter");
        for (i, label) in MSG_LABELS.iter().enumerate() {
            let _ = writeln!(
                out,
                "messages_processed_total{{type=\"{label}\"}} {}",
                self.messages_processed[i].load(Ordering::Relaxed)
            );
        }
        out.push('\n');

        counter(
            &mut out,
            "decode_errors_total",
            "Events rejected by the decoder.",
            self.decode_errors.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "registry_errors_total",
            "Events rejected by the registry.",
            self.registry_errors.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "cache_errors_total",
            "Failed cache operations.",
            self.cache_errors.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "cache_reconnects_total",
            "Cache reconnects.",
            snapshot.cache_reconnects,
        );
        counter(
            &mut out,
            "cov_send_failures_total",
            "COV notifications lost to send failures.",
            self.cov_send_failures.load(Ordering::Relaxed),
        );

        gauge(
            &mut out,
            "objects_total",
            "Objects in the registry.",
            snapshot.objects_total as u64,
        );

        let _ = writeln!(out, "# HELP objects_by_type Objects per BACnet type.");
        let _ = writeln!(out, "# TYPE objects_by_type gauge");
        for (label, count) in &snapshot.objects_by_type {
            let _ = writeln!(out, "objects_by_type{{type=\"{label}\"}} {count}");
        }
        out.push('\n');

        counter(
            &mut out,
            "bacnet_read_requests_total",
            "BACnet read requests served.",
            snapshot.bacnet.read_requests,
        );
        counter(
            &mut out,
            "bacnet_write_requests_total",
            "BACnet write requests received.",
            snapshot.bacnet.write_requests,
        );
        counter(
            &mut out,
            "bacnet_subscribe_requests_total",
            "BACnet COV subscribe requests received.",
            snapshot.bacnet.subscribe_requests,
        );
        counter(
            &mut out,
            "bacnet_cov_notifications_total",
            "COV notifications handed to the datalink.",
            snapshot.bacnet.cov_notifications_sent,
        );
        gauge(
            &mut out,
            "bacnet_cov_subscriptions_active",
            "Live COV subscriptions.",
            snapshot.cov_subscriptions_active as u64,
        );

        self.processing_latency.render(
            &mut out,
            "message_processing_latency_milliseconds",
            "End-to-end apply latency per event.",
        );
        self.read_latency.render(
            &mut out,
            "bacnet_read_latency_milliseconds",
            "Present-value read latency.",
        );

        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}\n");
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}\n");
}

/// Live gauges assembled by the supervisor for `/metrics` and `/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewaySnapshot {
    pub device_name: String,
    pub uptime_seconds: u64,
    pub objects_total: usize,
    pub objects_by_type: Vec<(String, usize)>,
    pub cov_subscriptions_active: usize,
    pub cache_reconnects: u64,
    pub bacnet: StatsSnapshot,
    pub consumers: Vec<ConsumerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatus {
    pub subscription_id: String,
    pub state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new(PROCESSING_BUCKETS);
        h.observe(0.4);
        h.observe(3.0);
        h.observe(700.0);
        h.observe(5000.0);

        let mut out = String::new();
        h.render(&mut out, "latency_ms", "test");
        assert!(out.contains("latency_ms_bucket{le=\"1\"} 1"));
        assert!(out.contains("latency_ms_bucket{le=\"5\"} 2"));
        assert!(out.contains("latency_ms_bucket{le=\"1000\"} 3"));
        assert!(out.contains("latency_ms_bucket{le=\"+Inf\"} 4"));
        assert!(out.contains("latency_ms_count 4"));
    }

    #[test]
    fn render_includes_the_expected_families() {
        let metrics = Metrics::new(1_700_000_000);
        metrics.events_received.fetch_add(3, Ordering::Relaxed);
        metrics.note_processed(MSG_VALUE_UPDATE);
        metrics.processing_latency.observe(12.0);

        let snapshot = GatewaySnapshot {
            objects_total: 2,
            objects_by_type: vec![("AI".to_string(), 2)],
            cov_subscriptions_active: 1,
            ..Default::default()
        };
        let text = metrics.render(&snapshot);

        assert!(text.contains("events_received_total 3"));
        assert!(text.contains("messages_processed_total{type=\"value_update\"} 1"));
        assert!(text.contains("objects_total 2"));
        assert!(text.contains("objects_by_type{type=\"AI\"} 2"));
        assert!(text.contains("bacnet_cov_subscriptions_active 1"));
        assert!(text.contains("message_processing_latency_milliseconds_bucket{le=\"25\"} 1"));
        assert!(text.contains("bacnet_read_latency_milliseconds_count 0"));
    }
}
