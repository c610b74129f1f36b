use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Process-wide metrics registry for the memory subsystem.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    arbitration_requests: CounterVec,
    arbitration_outcomes: CounterVec,
    arbitration_queue_seconds: HistogramVec,
    arbitration_seconds: HistogramVec,
    reclaim_seconds: HistogramVec,
    shrunk_bytes: CounterVec,
    reclaimed_bytes: CounterVec,
    free_capacity_bytes: GaugeVec,
    spill_bytes: CounterVec,
    spill_runs: CounterVec,
    spill_time_seconds: HistogramVec,
}

impl MetricsRegistry {
    /// Create a fresh registry with all memory metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record one finished arbitration request.
    pub fn record_arbitration(
        &self,
        arbitrator: &str,
        outcome: &str,
        queue_secs: f64,
        arbitration_secs: f64,
    ) {
        let labels = [arbitrator];
        self.inner
            .arbitration_requests
            .with_label_values(&labels)
            .inc();
        self.inner
            .arbitration_outcomes
            .with_label_values(&[arbitrator, outcome])
            .inc();
        self.inner
            .arbitration_queue_seconds
            .with_label_values(&labels)
            .observe(queue_secs.max(0.0));
        self.inner
            .arbitration_seconds
            .with_label_values(&labels)
            .observe(arbitration_secs.max(0.0));
    }

    /// Record one reclaim pass against a candidate pool.
    pub fn record_reclaim(&self, arbitrator: &str, shrunk: u64, reclaimed: u64, secs: f64) {
        let labels = [arbitrator];
        self.inner
            .shrunk_bytes
            .with_label_values(&labels)
            .inc_by(shrunk as f64);
        self.inner
            .reclaimed_bytes
            .with_label_values(&labels)
            .inc_by(reclaimed as f64);
        self.inner
            .reclaim_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    /// Publish the arbitrator's current free capacity gauge.
    pub fn set_free_capacity(&self, arbitrator: &str, bytes: u64) {
        self.inner
            .free_capacity_bytes
            .with_label_values(&[arbitrator])
            .set(bytes as f64);
    }

    /// Record one operator spill run.
    pub fn record_spill(&self, operator: &str, bytes: u64, secs: f64) {
        let labels = [operator];
        self.inner
            .spill_bytes
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner.spill_runs.with_label_values(&labels).inc();
        self.inner
            .spill_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    /// Render all families in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let arbitration_requests = counter_vec(
            &registry,
            "arbor_arbitration_requests_total",
            "Arbitration requests started",
            &["arbitrator"],
        );
        let arbitration_outcomes = counter_vec(
            &registry,
            "arbor_arbitration_outcomes_total",
            "Arbitration requests finished, by outcome",
            &["arbitrator", "outcome"],
        );
        let arbitration_queue_seconds = histogram_vec(
            &registry,
            "arbor_arbitration_queue_seconds",
            "Time spent waiting for the serialized arbitration slot",
            &["arbitrator"],
        );
        let arbitration_seconds = histogram_vec(
            &registry,
            "arbor_arbitration_seconds",
            "Time spent running arbitration after dequeue",
            &["arbitrator"],
        );
        let reclaim_seconds = histogram_vec(
            &registry,
            "arbor_reclaim_seconds",
            "Time spent reclaiming from one candidate pool",
            &["arbitrator"],
        );
        let shrunk_bytes = counter_vec(
            &registry,
            "arbor_shrunk_bytes_total",
            "Unused capacity shrunk from pools",
            &["arbitrator"],
        );
        let reclaimed_bytes = counter_vec(
            &registry,
            "arbor_reclaimed_bytes_total",
            "Used capacity reclaimed from pools via spilling",
            &["arbitrator"],
        );
        let free_capacity_bytes = gauge_vec(
            &registry,
            "arbor_free_capacity_bytes",
            "Arbitrator free capacity available for grants",
            &["arbitrator"],
        );
        let spill_bytes = counter_vec(
            &registry,
            "arbor_spill_bytes_total",
            "Spill bytes written",
            &["operator"],
        );
        let spill_runs = counter_vec(
            &registry,
            "arbor_spill_runs_total",
            "Spill runs written",
            &["operator"],
        );
        let spill_time_seconds = histogram_vec(
            &registry,
            "arbor_spill_time_seconds",
            "Spill write time",
            &["operator"],
        );

        Self {
            registry,
            arbitration_requests,
            arbitration_outcomes,
            arbitration_queue_seconds,
            arbitration_seconds,
            reclaim_seconds,
            shrunk_bytes,
            reclaimed_bytes,
            free_capacity_bytes,
            spill_bytes,
            spill_runs,
            spill_time_seconds,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Shared process-wide registry used by arbitrators and spillers.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_arbitration("SHARED", "succeeded", 0.0, 0.001);
        let text = m.render_prometheus();
        assert!(text.contains("arbor_arbitration_requests_total"));
        assert!(text.contains("succeeded"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_arbitration("SHARED", "failed", 0.002, 0.01);
        m.record_reclaim("SHARED", 1024, 4096, 0.005);
        m.set_free_capacity("SHARED", 1 << 20);
        m.record_spill("order_by", 512, 0.004);
        let text = m.render_prometheus();

        assert!(text.contains("arbor_arbitration_requests_total"));
        assert!(text.contains("arbor_arbitration_outcomes_total"));
        assert!(text.contains("arbor_arbitration_queue_seconds"));
        assert!(text.contains("arbor_arbitration_seconds"));
        assert!(text.contains("arbor_reclaim_seconds"));
        assert!(text.contains("arbor_shrunk_bytes_total"));
        assert!(text.contains("arbor_reclaimed_bytes_total"));
        assert!(text.contains("arbor_free_capacity_bytes"));
        assert!(text.contains("arbor_spill_bytes_total"));
        assert!(text.contains("arbor_spill_runs_total"));
        assert!(text.contains("arbor_spill_time_seconds"));
    }
}
