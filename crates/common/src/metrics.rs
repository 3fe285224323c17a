use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Process-wide metrics registry shared by master and worker runtimes.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    io_items_served: CounterVec,
    io_items_retired: CounterVec,
    rows_loaded: CounterVec,
    rows_saved: CounterVec,
    pipeline_in_flight: GaugeVec,
    stage_seconds: HistogramVec,
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let io_items_served = CounterVec::new(
            Opts::new("strobe_io_items_served_total", "IO items handed out by the master"),
            &["job"],
        )
        .expect("metric opts");
        let io_items_retired = CounterVec::new(
            Opts::new("strobe_io_items_retired_total", "IO items fully saved by a worker"),
            &["job"],
        )
        .expect("metric opts");
        let rows_loaded = CounterVec::new(
            Opts::new("strobe_rows_loaded_total", "Source rows read by load workers"),
            &["job"],
        )
        .expect("metric opts");
        let rows_saved = CounterVec::new(
            Opts::new("strobe_rows_saved_total", "Output rows committed by save workers"),
            &["job"],
        )
        .expect("metric opts");
        let pipeline_in_flight = GaugeVec::new(
            Opts::new("strobe_pipeline_in_flight_items", "Accepted minus retired items per worker"),
            &["job"],
        )
        .expect("metric opts");
        let stage_seconds = HistogramVec::new(
            HistogramOpts::new("strobe_stage_seconds", "Per-item wall time spent in each stage"),
            &["stage"],
        )
        .expect("metric opts");

        registry
            .register(Box::new(io_items_served.clone()))
            .expect("register metric");
        registry
            .register(Box::new(io_items_retired.clone()))
            .expect("register metric");
        registry
            .register(Box::new(rows_loaded.clone()))
            .expect("register metric");
        registry
            .register(Box::new(rows_saved.clone()))
            .expect("register metric");
        registry
            .register(Box::new(pipeline_in_flight.clone()))
            .expect("register metric");
        registry
            .register(Box::new(stage_seconds.clone()))
            .expect("register metric");

        Self {
            registry,
            io_items_served,
            io_items_retired,
            rows_loaded,
            rows_saved,
            pipeline_in_flight,
            stage_seconds,
        }
    }
}

impl MetricsRegistry {
    /// Create an isolated registry (tests); production code uses [`global_metrics`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record one IO item handed out by the master.
    pub fn record_io_item_served(&self, job: &str) {
        self.inner.io_items_served.with_label_values(&[job]).inc();
    }

    /// Record one IO item fully committed by a save worker.
    pub fn record_io_item_retired(&self, job: &str) {
        self.inner.io_items_retired.with_label_values(&[job]).inc();
    }

    /// Record rows materialized by a load worker.
    pub fn record_rows_loaded(&self, job: &str, rows: u64) {
        self.inner
            .rows_loaded
            .with_label_values(&[job])
            .inc_by(rows as f64);
    }

    /// Record rows committed by a save worker.
    pub fn record_rows_saved(&self, job: &str, rows: u64) {
        self.inner
            .rows_saved
            .with_label_values(&[job])
            .inc_by(rows as f64);
    }

    /// Set the worker's current accepted-minus-retired item count.
    pub fn set_in_flight(&self, job: &str, items: i64) {
        self.inner
            .pipeline_in_flight
            .with_label_values(&[job])
            .set(items as f64);
    }

    /// Observe per-item wall time for one stage.
    pub fn observe_stage_seconds(&self, stage: &str, secs: f64) {
        self.inner
            .stage_seconds
            .with_label_values(&[stage])
            .observe(secs.max(0.0));
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        if encoder.encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Return the process-wide metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    static METRICS: OnceLock<MetricsRegistry> = OnceLock::new();
    METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn counters_show_up_in_text_exposition() {
        let metrics = MetricsRegistry::new();
        metrics.record_io_item_served("job-a");
        metrics.record_io_item_served("job-a");
        metrics.record_rows_saved("job-a", 42);
        metrics.set_in_flight("job-a", 3);
        let text = metrics.render_text();
        assert!(text.contains("strobe_io_items_served_total"));
        assert!(text.contains("strobe_rows_saved_total"));
        assert!(text.contains("strobe_pipeline_in_flight_items"));
    }
}
