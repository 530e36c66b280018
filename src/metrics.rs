// Metrics port injected into every component.
//
// Components never touch process-wide registries; the embedding service
// bridges a sink to whatever exporter it runs.

use std::sync::Arc;

use dashmap::DashMap;

pub type Labels<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync + 'static {
    fn increment_counter(&self, name: &str, labels: Labels<'_>);
    fn observe_histogram(&self, name: &str, value: f64, labels: Labels<'_>);
    fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>);
}

pub mod names {
    pub const BREAKER_CALLS: &str = "circuit_breaker_calls_total";
    pub const BREAKER_TRANSITIONS: &str = "circuit_breaker_transitions_total";
    pub const BREAKER_STATE: &str = "circuit_breaker_state";

    pub const LOCK_ACQUIRE: &str = "booking_lock_acquire_total";
    pub const LOCK_ACQUIRE_SECONDS: &str = "booking_lock_acquire_seconds";
    pub const LOCK_EXTEND: &str = "booking_lock_extend_total";
    pub const LOCK_RELEASE: &str = "booking_lock_release_total";
    pub const LOCK_UNPARSABLE: &str = "booking_lock_unparsable_records_total";
    pub const AUDIT_WRITE_FAILURES: &str = "lock_audit_write_failures_total";

    pub const DLQ_ENQUEUED: &str = "dlq_enqueued_total";
    pub const DLQ_RETRIES: &str = "dlq_retries_total";
    pub const DLQ_PERMANENT: &str = "dlq_permanent_failures_total";
    pub const DLQ_STALE_INDEX: &str = "dlq_stale_index_entries_total";
    pub const DLQ_SIZE: &str = "dlq_size";
    pub const DLQ_OLDEST_AGE: &str = "dlq_oldest_message_age_seconds";
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _labels: Labels<'_>) {}
    fn observe_histogram(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
}

pub fn noop_metrics() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

// Render `name{k=v,...}` with labels sorted so lookups are order independent
fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    format!("{}{{{}}}", name, pairs.join(","))
}

#[derive(Debug, Default, Clone)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
}

// Recorder keeping every series in memory. Backs health endpoints and tests.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    histograms: DashMap<String, HistogramSummary>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .get(&series_key(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    // Sum of a counter over every label combination
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|e| e.key() == name || e.key().starts_with(&format!("{name}{{")))
            .map(|e| *e.value())
            .sum()
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        self.gauges.get(&series_key(name, labels)).map(|v| *v)
    }

    pub fn histogram(&self, name: &str, labels: Labels<'_>) -> Option<HistogramSummary> {
        self.histograms
            .get(&series_key(name, labels))
            .map(|v| v.clone())
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) {
        *self.counters.entry(series_key(name, labels)).or_insert(0) += 1;
    }

    fn observe_histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        let mut entry = self
            .histograms
            .entry(series_key(name, labels))
            .or_default();
        entry.count += 1;
        entry.sum += value;
        if value > entry.max {
            entry.max = value;
        }
    }

    fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.gauges.insert(series_key(name, labels), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_order_does_not_matter() {
        let metrics = InMemoryMetrics::new();
        metrics.increment_counter("calls", &[("state", "closed"), ("outcome", "success")]);
        metrics.increment_counter("calls", &[("outcome", "success"), ("state", "closed")]);
        metrics.increment_counter("calls", &[("outcome", "failure"), ("state", "closed")]);

        assert_eq!(
            metrics.counter("calls", &[("state", "closed"), ("outcome", "success")]),
            2
        );
        assert_eq!(metrics.counter_total("calls"), 3);
        assert_eq!(metrics.counter_total("call"), 0);
    }

    #[test]
    fn test_histogram_and_gauge() {
        let metrics = InMemoryMetrics::new();
        metrics.observe_histogram("latency", 0.5, &[]);
        metrics.observe_histogram("latency", 1.5, &[]);
        metrics.set_gauge("size", 3.0, &[]);
        metrics.set_gauge("size", 2.0, &[]);

        let summary = metrics.histogram("latency", &[]).unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.sum, 2.0);
        assert_eq!(summary.max, 1.5);
        assert_eq!(metrics.gauge("size", &[]), Some(2.0));
    }
}
